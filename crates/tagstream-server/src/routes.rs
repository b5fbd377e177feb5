//! HTTP routes and handlers

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, MethodRouter},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tagstream_classifiers::TaggerLookup;
use tagstream_core::{Error, FeedId, ItemId};
use tagstream_engine::JobState;
use tagstream_store::{atom, Element, Entry, ParseError, RemoveOutcome};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::state::AppState;
use crate::xml;

pub fn create_router(state: AppState) -> Router {
    let signed = |route: MethodRouter<AppState>| {
        route.route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_signature,
        ))
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/classifier", get(about))
        .route("/classifier.xml", get(about))
        .route("/classifier/clues", get(clues))
        .route("/classifier/jobs", signed(post(create_job)))
        .route("/classifier/jobs.xml", signed(post(create_job)))
        .route(
            "/classifier/jobs/:id",
            get(get_job).merge(signed(delete(delete_job))),
        )
        .route("/feeds", signed(post(add_feed)))
        .route(
            "/feeds/:id",
            signed(delete(delete_feed).put(update_feed)),
        )
        .route("/feeds/:id/feed_items", signed(post(add_entry)))
        .route("/feed_items/:id", signed(delete(remove_entry)))
        .fallback(fallback)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(state.config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::restrict_peer,
        ))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}

async fn about() -> Response {
    xml_response(StatusCode::OK, xml::about())
}

async fn fallback() -> AppError {
    AppError::NotFound
}

/// Create a classification job from `<job><tag-url>URL</tag-url></job>`
async fn create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, AppError> {
    if body.trim().is_empty() {
        return Err(AppError::UnsupportedMediaType);
    }

    let root = Element::parse(&body)?;
    let tag_url = (root.name == "job")
        .then(|| root.child_text("tag-url"))
        .flatten()
        .ok_or_else(|| AppError::Unprocessable(xml::MISSING_TAG_URL.to_string()))?;
    validate_tag_url(tag_url)?;

    let job = state.engine.add_classification_job(tag_url);
    let location = location(&headers, &format!("/classifier/jobs/{}", job.id()));
    info!(job_id = job.id(), tag_url, "Created classification job");

    Ok((
        StatusCode::CREATED,
        [
            (header::CONTENT_TYPE, xml::CONTENT_TYPE.to_string()),
            (header::LOCATION, location),
        ],
        xml::job(&job.snapshot()),
    )
        .into_response())
}

fn validate_tag_url(tag_url: &str) -> Result<(), AppError> {
    let url = url::Url::parse(tag_url)
        .map_err(|e| AppError::Unprocessable(format!("Invalid tag url {tag_url:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(()),
        scheme => Err(AppError::Unprocessable(format!(
            "Tag url scheme '{scheme}' is not supported"
        ))),
    }
}

/// Job ids may carry a `.xml` suffix
fn job_id(raw: &str) -> &str {
    raw.strip_suffix(".xml").unwrap_or(raw)
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let job = state
        .engine
        .fetch_classification_job(job_id(&id))
        .ok_or(AppError::NotFound)?;
    Ok(xml_response(StatusCode::OK, xml::job(&job.snapshot())))
}

/// Finished jobs are removed, unfinished ones cancelled
async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let job = state
        .engine
        .fetch_classification_job(job_id(&id))
        .ok_or(AppError::NotFound)?;

    match job.state() {
        JobState::Complete | JobState::Error => {
            state.engine.remove_classification_job(&job, false);
        }
        _ => {
            state.engine.cancel(&job);
        }
    }
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct CluesQuery {
    item: ItemId,
    tag: String,
}

#[derive(Debug, Serialize)]
struct ClueView {
    clue: String,
    prob: f64,
}

/// Explain an item's classification under a tag
async fn clues(
    State(state): State<AppState>,
    Query(query): Query<CluesQuery>,
) -> Result<Json<Vec<ClueView>>, AppError> {
    let item = state
        .items
        .fetch_item(query.item)
        .ok_or(AppError::NotFound)?;

    validate_tag_url(&query.tag)?;

    let tagger = match state.taggers.get_tagger_without_fetching(&query.tag) {
        TaggerLookup::Ok(tagger) => tagger,
        TaggerLookup::NotFound if state.taggers.is_failed_tag(&query.tag) => {
            let reason = state.taggers.fetch_error(&query.tag).unwrap_or_default();
            return Err(AppError::NotReady(format!("Tagger unavailable: {reason}")));
        }
        TaggerLookup::NotFound => {
            state.taggers.fetch_tagger_in_background(&query.tag);
            return Err(AppError::NotReady("Tagger is being fetched".to_string()));
        }
        TaggerLookup::CheckedOut => {
            return Err(AppError::NotReady("Tagger is being replaced".to_string()));
        }
    };

    let clues = tagger
        .clues_for(&item)
        .into_iter()
        .map(|clue| ClueView {
            clue: state
                .items
                .token_text(clue.token_id)
                .unwrap_or_else(|| clue.token_id.to_string()),
            prob: clue.probability,
        })
        .collect();
    Ok(Json(clues))
}

/// Parse a numeric path id; anything else is an unknown resource
fn numeric_id(raw: &str) -> Result<u64, AppError> {
    raw.parse::<u64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or(AppError::NotFound)
}

async fn add_feed(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, AppError> {
    if body.trim().is_empty() {
        return Err(AppError::BadXml(xml::BAD_XML.to_string()));
    }
    let feed = atom::parse_feed(&body)?;
    let id = feed.id;

    let items = state.items.clone();
    blocking(move || items.add_feed(feed)).await?;
    debug!(feed_id = id, "Feed added");

    Ok(created(&headers, &format!("/feeds/{id}"), "Feed added."))
}

async fn update_feed(Path(id): Path<String>) -> Result<Response, AppError> {
    numeric_id(&id)?;
    Ok(xml_response(StatusCode::ACCEPTED, xml::info("Feed updates ignored.")))
}

async fn delete_feed(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id: FeedId = numeric_id(&id)?;
    let items = state.items.clone();
    blocking(move || items.remove_feed(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_entry(
    State(state): State<AppState>,
    Path(feed_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, AppError> {
    let feed_id: FeedId = numeric_id(&feed_id)?;
    if body.trim().is_empty() {
        return Err(AppError::BadXml(xml::BAD_XML.to_string()));
    }
    let entry = Entry::from_atom(&body)?.with_feed(feed_id);

    let items = state.items.clone();
    let id = blocking(move || items.add_entry(&entry)).await?;
    debug!(item_id = id, feed_id, "Entry added");

    Ok(created(&headers, &format!("/feed_items/{id}"), "Entry added."))
}

async fn remove_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id: ItemId = numeric_id(&id)?;
    let items = state.items.clone();
    let status = match blocking(move || items.remove_entry(id)).await? {
        RemoveOutcome::Removed => StatusCode::NO_CONTENT,
        RemoveOutcome::Protected => StatusCode::ACCEPTED,
    };
    Ok(xml_response(status, xml::info("Entry removed successfully.")))
}

/// Run store I/O off the async executor
async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> tagstream_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("store task failed: {e}")))?
        .map_err(AppError::from)
}

/// Absolute URL for a resource on this server
fn location(headers: &HeaderMap, path: &str) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}{path}")
}

fn created(headers: &HeaderMap, path: &str, message: &str) -> Response {
    (
        StatusCode::CREATED,
        [
            (header::CONTENT_TYPE, xml::CONTENT_TYPE.to_string()),
            (header::LOCATION, location(headers, path)),
        ],
        xml::info(message),
    )
        .into_response()
}

fn xml_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, xml::CONTENT_TYPE)], body).into_response()
}

/// Error handling
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadXml(String),

    #[error("{}", xml::BAD_XML)]
    UnsupportedMediaType,

    #[error("{0}")]
    Unprocessable(String),

    #[error("{}", xml::NOT_FOUND)]
    NotFound,

    #[error("{0}")]
    NotReady(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Access denied")]
    Forbidden,

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadXml(_) => StatusCode::BAD_REQUEST,
            AppError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::NotReady(_) => StatusCode::FAILED_DEPENDENCY,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) => AppError::Unprocessable(msg),
            Error::NotFound(_) => AppError::NotFound,
            Error::Unavailable(msg) => AppError::NotReady(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<ParseError> for AppError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Xml(msg) => {
                debug!("Rejected malformed XML: {}", msg);
                AppError::BadXml(xml::BAD_XML.to_string())
            }
            ParseError::BadEntry(msg) => AppError::Unprocessable(msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            AppError::Internal(msg) => {
                error!("Request failed: {}", msg);
                metrics::counter!("tagstream_errors_total", "type" => "internal").increment(1);
            }
            AppError::Unauthorized | AppError::Forbidden => {}
            other => warn!(%status, "Request rejected: {}", other),
        }
        xml_response(status, xml::errors(&self.to_string()))
    }
}
