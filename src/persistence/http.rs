//! Remote object-store backend over plain HTTP.
//!
//! The collection lives at a single object URL: `GET` reads it (404 means no
//! state yet) and `PUT` replaces it. Works with any store that accepts
//! authenticated whole-object PUTs, e.g. a presigned bucket URL or a
//! bearer-protected blob endpoint.

use super::{PersistenceBackend, decode_blob, encode_blob};
use crate::error::{Result, SyncError};
use crate::task::Task;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use url::Url;

/// Task collection stored as one remote JSON object.
#[derive(Debug, Clone)]
pub struct HttpObjectBackend {
    client: reqwest::Client,
    url: Url,
    token: Option<String>,
}

impl HttpObjectBackend {
    /// Build a backend for the object at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] for an unparseable or non-HTTP URL, or
    /// if the HTTP client cannot be constructed.
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let url =
            Url::parse(url).map_err(|e| SyncError::Config(format!("invalid storage url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::Config(format!(
                "storage url must be http(s), got {}",
                url.scheme()
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build http client: {e}")))?;
        let token = token.map(|t| t.trim().to_owned()).filter(|t| !t.is_empty());
        Ok(Self { client, url, token })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl PersistenceBackend for HttpObjectBackend {
    fn describe(&self) -> String {
        // Query strings may carry signatures.
        let mut shown = self.url.clone();
        shown.set_query(None);
        shown.to_string()
    }

    async fn load(&self) -> Result<Vec<Task>> {
        let response = self
            .authorize(self.client.get(self.url.clone()))
            .send()
            .await
            .map_err(|e| SyncError::Storage(format!("GET {} failed: {e}", self.describe())))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(SyncError::Storage(format!(
                "GET {} returned {status}",
                self.describe()
            )));
        }

        let bytes = response.bytes().await.map_err(|e| {
            SyncError::Storage(format!("cannot read body of {}: {e}", self.describe()))
        })?;
        decode_blob(&bytes)
    }

    async fn save(&self, tasks: &[Task]) -> Result<()> {
        let body = encode_blob(tasks)?;
        let response = self
            .authorize(self.client.put(self.url.clone()))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| SyncError::Storage(format!("PUT {} failed: {e}", self.describe())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Storage(format!(
                "PUT {} returned {status}",
                self.describe()
            )));
        }
        Ok(())
    }
}
