//! Request authentication middleware
//!
//! Mutating routes require an `AuthHMAC` signature when credentials are
//! configured. A configured `allowed_ip` rejects every other peer before any
//! route runs.

use crate::routes::AppError;
use crate::state::AppState;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use tagstream_core::auth::{self, RequestParts};
use tracing::{info, warn};

/// Verify the request signature against the configured credentials
pub async fn require_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let headers = request.headers();
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let parts = RequestParts {
        method: request.method().as_str(),
        path: request.uri().path(),
        content_type: header_str(header::CONTENT_TYPE.as_str()),
        content_md5: header_str("content-md5"),
        date: header_str(header::DATE.as_str()),
        authorization: header_str(header::AUTHORIZATION.as_str()),
    };

    if !auth::verify(&parts, state.config.active_credentials()) {
        warn!(
            method = parts.method,
            path = parts.path,
            "Rejected request with invalid signature"
        );
        metrics::counter!("tagstream_auth_failures_total").increment(1);
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(request).await)
}

/// Reject peers other than `allowed_ip` when one is configured
pub async fn restrict_peer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(allowed) = state.config.allowed_ip {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        if peer != Some(allowed) {
            info!(
                ?peer,
                %allowed,
                "Rejected connection that didn't match the allowed ip"
            );
            return Err(AppError::Forbidden);
        }
    }

    Ok(next.run(request).await)
}
