//! HMAC request authentication
//!
//! Requests are signed over a canonical string built from the method, a few
//! headers and the path:
//!
//! ```text
//! METHOD\ncontent-type\ncontent-md5\ndate\npath
//! ```
//!
//! and carry `Authorization: AuthHMAC <access_id>:<base64 signature>`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const SCHEME: &str = "AuthHMAC";

/// Shared-secret credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub access_id: String,
    #[serde(default)]
    pub secret: String,
}

impl Credentials {
    pub fn new(access_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            access_id: access_id.into(),
            secret: secret.into(),
        }
    }

    /// Empty credentials leave endpoints open
    pub fn is_configured(&self) -> bool {
        !self.access_id.is_empty() && !self.secret.is_empty()
    }
}

/// The parts of a request that take part in signing
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestParts<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub content_type: Option<&'a str>,
    pub content_md5: Option<&'a str>,
    pub date: Option<&'a str>,
    pub authorization: Option<&'a str>,
}

impl<'a> RequestParts<'a> {
    pub fn canonical_string(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}",
            self.method.to_ascii_uppercase(),
            self.content_type.unwrap_or(""),
            self.content_md5.unwrap_or(""),
            self.date.unwrap_or(""),
            self.path
        )
    }
}

/// `Date` header value for `at` in IMF-fixdate form
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Base64 HMAC-SHA256 of the request's canonical string
pub fn signature(request: &RequestParts<'_>, secret: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(request.canonical_string().as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Value for the `Authorization` header of an outgoing request
pub fn authorization_header(request: &RequestParts<'_>, credentials: &Credentials) -> String {
    format!(
        "{} {}:{}",
        SCHEME,
        credentials.access_id,
        signature(request, &credentials.secret)
    )
}

/// Check a request against the configured credentials.
///
/// Returns true when no credentials are configured.
pub fn verify(request: &RequestParts<'_>, credentials: Option<&Credentials>) -> bool {
    let credentials = match credentials {
        Some(c) if c.is_configured() => c,
        _ => return true,
    };

    let Some(header) = request.authorization else {
        debug!(path = request.path, "Missing authorization header");
        return false;
    };
    let Some((scheme, rest)) = header.trim().split_once(' ') else {
        return false;
    };
    if scheme != SCHEME {
        return false;
    }
    let Some((access_id, provided)) = rest.trim().rsplit_once(':') else {
        return false;
    };
    if access_id != credentials.access_id {
        debug!(access_id, "Unknown access id");
        return false;
    }

    let expected = signature(request, &credentials.secret);
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_http_date_is_imf_fixdate() {
        let at = Utc.with_ymd_and_hms(2026, 10, 15, 10, 0, 0).unwrap();
        assert_eq!(http_date(at), "Thu, 15 Oct 2026 10:00:00 GMT");
    }

    fn request<'a>(authorization: Option<&'a str>) -> RequestParts<'a> {
        RequestParts {
            method: "post",
            path: "/classifier/jobs",
            content_type: Some("application/xml"),
            content_md5: None,
            date: Some("Thu, 15 Oct 2026 10:00:00 GMT"),
            authorization,
        }
    }

    #[test]
    fn test_canonical_string() {
        assert_eq!(
            request(None).canonical_string(),
            "POST\napplication/xml\n\nThu, 15 Oct 2026 10:00:00 GMT\n/classifier/jobs"
        );
    }

    #[test]
    fn test_open_without_credentials() {
        assert!(verify(&request(None), None));
        assert!(verify(&request(None), Some(&Credentials::default())));
    }

    #[test]
    fn test_signed_request_verifies() {
        let creds = Credentials::new("collector", "s3cret");
        let header = authorization_header(&request(None), &creds);
        assert!(header.starts_with("AuthHMAC collector:"));
        assert!(verify(&request(Some(&header)), Some(&creds)));
    }

    #[test]
    fn test_rejects_bad_signatures() {
        let creds = Credentials::new("collector", "s3cret");
        assert!(!verify(&request(None), Some(&creds)));
        assert!(!verify(&request(Some("AuthHMAC collector:AAAA")), Some(&creds)));
        assert!(!verify(&request(Some("Basic abc")), Some(&creds)));

        let other = Credentials::new("collector", "other");
        let header = authorization_header(&request(None), &other);
        assert!(!verify(&request(Some(&header)), Some(&creds)));

        let wrong_id = Credentials::new("someone", "s3cret");
        let header = authorization_header(&request(None), &wrong_id);
        assert!(!verify(&request(Some(&header)), Some(&creds)));
    }
}
