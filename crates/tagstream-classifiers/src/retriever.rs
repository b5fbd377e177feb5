//! Tag definition retrieval

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tagstream_core::auth::{self, Credentials, RequestParts};
use tagstream_core::{Error, Result};
use tracing::debug;

/// Source of tag definition documents
#[async_trait]
pub trait TagRetriever: Send + Sync {
    /// Fetch the raw definition document for `tag_url`
    async fn retrieve(&self, tag_url: &str) -> Result<String>;
}

/// Retrieves definitions over HTTP, signing requests when credentials are set
pub struct HttpTagRetriever {
    client: reqwest::Client,
    credentials: Option<Credentials>,
}

impl HttpTagRetriever {
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
impl TagRetriever for HttpTagRetriever {
    async fn retrieve(&self, tag_url: &str) -> Result<String> {
        let url = reqwest::Url::parse(tag_url)
            .map_err(|e| Error::network(format!("invalid tag url {tag_url:?}: {e}")))?;

        let mut request = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "application/atom+xml");

        if let Some(credentials) = &self.credentials {
            let date = auth::http_date(Utc::now());
            let parts = RequestParts {
                method: "GET",
                path: url.path(),
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

        debug!(tag_url, "Fetching tag definition");
        let response = request
            .send()
            .await
            .map_err(|e| Error::network(format!("GET {tag_url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::network(format!("GET {tag_url} returned {status}")));
        }
        response
            .text()
            .await
            .map_err(|e| Error::network(format!("reading {tag_url} failed: {e}")))
    }
}
