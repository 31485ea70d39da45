//! Remote content fetcher.
//!
//! Every request towards a remote catalog goes through [`RemoteFetcher`].
//! [`HttpFetcher`] is the `reqwest` implementation; tests substitute their
//! own. There is no retry or backoff here, callers decide what a failure
//! means.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::SourceConfig;

#[derive(Error, Debug)]
pub enum FetchError {
    /// Remote answered 404, there is nothing to fetch
    #[error("Content not found: {url}")]
    ContentNotFound { url: String },

    /// Any other status, network or protocol failure
    #[error("Could not fetch {url}: {reason}")]
    ContentFetch { url: String, reason: String },

    #[error("Cannot build HTTP client: {0}")]
    Client(String),
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::ContentNotFound { .. })
    }
}

#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// GET `url`, or POST `body` as JSON when one is given.
    async fn fetch(&self, url: &str, body: Option<&serde_json::Value>)
        -> Result<Vec<u8>, FetchError>;
}

/// Client settings for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub timeout: Option<Duration>,
    pub api_key: Option<String>,
    pub user_agent: String,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            timeout: None,
            api_key: None,
            user_agent: format!("catalog-harvester/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl FetcherSettings {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sends `key` in the `Authorization` header of every request.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Default settings carrying the source's API key, if any.
    pub fn for_source(config: &SourceConfig) -> Self {
        let settings = Self::default();
        match config.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => settings.with_api_key(key),
            _ => settings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    api_key: Option<String>,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_settings(FetcherSettings::default())
    }

    pub fn with_settings(settings: FetcherSettings) -> Result<Self, FetchError> {
        let mut builder = Client::builder().user_agent(settings.user_agent);
        if let Some(timeout) = settings.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            api_key: settings.api_key,
        })
    }
}

/// Maps a transport error into a [`FetchError::ContentFetch`].
fn transport_error(url: &str, err: reqwest::Error) -> FetchError {
    let reason = if err.is_timeout() {
        format!("timeout: {err}")
    } else if err.is_connect() {
        format!("connection error: {err}")
    } else {
        format!("HTTP exception: {err}")
    };
    FetchError::ContentFetch {
        url: url.to_string(),
        reason,
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    #[tracing::instrument(skip(self, body))]
    async fn fetch(
        &self,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Vec<u8>, FetchError> {
        let mut request = match body {
            None => self.client.get(url),
            Some(body) => self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_string()),
        };
        if let Some(key) = &self.api_key {
            request = request.header(AUTHORIZATION, key);
        }

        let response = request.send().await.map_err(|e| transport_error(url, e))?;

        let status = response.status();
        trace!(%status, "response received");
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::ContentNotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::ContentFetch {
                url: url.to_string(),
                reason: format!("HTTP error: {}", status.as_u16()),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(url, e))?;
        debug!(size = bytes.len(), "fetched");
        Ok(bytes.to_vec())
    }
}
