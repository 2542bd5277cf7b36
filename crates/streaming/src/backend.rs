//! Backend abstraction for the authoritative deleted-cells store.
//!
//! The fetch coordinator and the deletion state machine only see the
//! [`DeletionBackend`] trait; [`HttpBackend`] is the production
//! implementation over `reqwest`.

use std::future::Future;
use std::pin::Pin;

use reqwest::StatusCode;
use tracing::debug;

use crate::protocol::{CellCoord, DeleteRequest, DeleteResponse, PageQuery};

/// Type alias for a boxed future that can be sent between threads.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Transport failure (connect, timeout, body read).
    Network(String),
    /// Non-success HTTP status.
    Status { status: u16, body: String },
    /// Response body was not the expected JSON.
    Decode(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Network(msg) => write!(f, "network error: {msg}"),
            BackendError::Status { status, body } => {
                write!(f, "backend returned {status}: {body}")
            }
            BackendError::Decode(msg) => write!(f, "malformed backend response: {msg}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Authoritative store of deleted cells.
///
/// Methods return boxed futures for dyn-compatibility.
pub trait DeletionBackend: Send + Sync {
    /// Fetch one page of deleted cells inside `query.region`, ordered by
    /// `(lat, lon)` and strictly after `query.after`.
    fn fetch_page(&self, query: PageQuery) -> BoxFuture<'_, Result<Vec<CellCoord>, BackendError>>;

    /// Delete a cell (or let the server pick a batch) on behalf of the
    /// bearer of `token`.
    fn delete<'a>(
        &'a self,
        token: &'a str,
        request: DeleteRequest,
    ) -> BoxFuture<'a, Result<DeleteResponse, BackendError>>;
}

/// `reqwest`-based client for the deleted-cells HTTP API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_page(&self, query: PageQuery) -> Result<Vec<CellCoord>, BackendError> {
        let resp = self
            .http
            .get(self.url("deleted"))
            .query(&query.query_pairs())
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let bytes = read_success_body(resp).await?;
        let page: Vec<CellCoord> =
            serde_json::from_slice(&bytes).map_err(|e| BackendError::Decode(e.to_string()))?;
        debug!("fetched page of {} cells (limit {})", page.len(), query.limit);
        Ok(page)
    }

    async fn post_delete(
        &self,
        token: &str,
        request: DeleteRequest,
    ) -> Result<DeleteResponse, BackendError> {
        let resp = self
            .http
            .post(self.url("delete"))
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        // Some deployments signal a duplicate delete with 409 instead of a
        // 200 carrying `alreadyDeleted: true`.
        if resp.status() == StatusCode::CONFLICT {
            return Ok(DeleteResponse::already_deleted());
        }

        let bytes = read_success_body(resp).await?;
        serde_json::from_slice(&bytes).map_err(|e| BackendError::Decode(e.to_string()))
    }
}

async fn read_success_body(resp: reqwest::Response) -> Result<Vec<u8>, BackendError> {
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| BackendError::Network(e.to_string()))?;
    if !status.is_success() {
        return Err(BackendError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    Ok(bytes.to_vec())
}

impl DeletionBackend for HttpBackend {
    fn fetch_page(&self, query: PageQuery) -> BoxFuture<'_, Result<Vec<CellCoord>, BackendError>> {
        Box::pin(self.get_page(query))
    }

    fn delete<'a>(
        &'a self,
        token: &'a str,
        request: DeleteRequest,
    ) -> BoxFuture<'a, Result<DeleteResponse, BackendError>> {
        Box::pin(self.post_delete(token, request))
    }
}

#[cfg(test)]
mod tests {
    use super::{BackendError, HttpBackend};

    #[test]
    fn joins_urls_without_double_slashes() {
        let b = HttpBackend::new("http://localhost:8080/api/");
        assert_eq!(b.url("deleted"), "http://localhost:8080/api/deleted");
    }

    #[test]
    fn status_errors_render_code_and_body() {
        let err = BackendError::Status {
            status: 503,
            body: "maintenance".to_string(),
        };
        assert_eq!(err.to_string(), "backend returned 503: maintenance");
    }
}
