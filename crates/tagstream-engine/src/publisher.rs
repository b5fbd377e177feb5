//! Publication of classification results

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tagstream_classifiers::Tagger;
use tagstream_core::auth::{self, Credentials, RequestParts};
use tagstream_core::{Error, ItemId, Result};
use tracing::{debug, info};

/// One item the tagger scored above the positive threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Tagging {
    pub item: ItemId,
    pub strength: f64,
}

/// Destination for the taggings a job produces
#[async_trait]
pub trait TaggingPublisher: Send + Sync {
    async fn publish(&self, tagger: &Tagger, taggings: &[Tagging]) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct TaggingDocument<'a> {
    tag: &'a str,
    classified_at: DateTime<Utc>,
    taggings: &'a [Tagging],
}

/// Posts taggings as JSON to the tagger's `classifier_taggings_url`
pub struct HttpTaggingPublisher {
    client: reqwest::Client,
    credentials: Option<Credentials>,
}

impl HttpTaggingPublisher {
    pub fn new(credentials: Option<Credentials>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tagstream/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            credentials: credentials.filter(Credentials::is_configured),
        })
    }
}

#[async_trait]
impl TaggingPublisher for HttpTaggingPublisher {
    async fn publish(&self, tagger: &Tagger, taggings: &[Tagging]) -> Result<()> {
        let Some(target) = tagger.classifier_taggings_url() else {
            debug!(tag_id = tagger.tag_id(), "Tag has no taggings URL, skipping publication");
            return Ok(());
        };
        let url = reqwest::Url::parse(target)
            .map_err(|e| Error::network(format!("invalid taggings url {target:?}: {e}")))?;

        let body = serde_json::to_vec(&TaggingDocument {
            tag: tagger.tag_id(),
            classified_at: Utc::now(),
            taggings,
        })?;

        let mut request = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(credentials) = &self.credentials {
            let date = auth::http_date(Utc::now());
            let parts = RequestParts {
                method: "POST",
                path: url.path(),
                content_type: Some("application/json"),
                date: Some(&date),
                ..Default::default()
            };
            request = request
                .header(reqwest::header::DATE, date.as_str())
                .header(
                    reqwest::header::AUTHORIZATION,
                    auth::authorization_header(&parts, credentials),
                );
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| Error::network(format!("POST {target} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::network(format!("POST {target} returned {status}")));
        }

        info!(tag_id = tagger.tag_id(), taggings = taggings.len(), "Taggings published");
        Ok(())
    }
}

/// Drops taggings after logging them; for deployments that poll job status only
pub struct DiscardPublisher;

#[async_trait]
impl TaggingPublisher for DiscardPublisher {
    async fn publish(&self, tagger: &Tagger, taggings: &[Tagging]) -> Result<()> {
        debug!(tag_id = tagger.tag_id(), taggings = taggings.len(), "Discarding taggings");
        Ok(())
    }
}
