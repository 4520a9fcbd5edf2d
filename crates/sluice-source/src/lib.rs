//! Remote source client: paginated listing fetches with bounded retry.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sluice_core::{DateWindow, DocumentType};
use thiserror::Error;

mod fixture;
mod http;

pub use fixture::{FixtureDataset, FixturePage, FixtureTransport};
pub use http::{
    classify_reqwest_error, BackoffPolicy, HttpClientConfig, HttpSource,
    ReqwestTransport, RetryDisposition,
};

pub const CRATE_NAME: &str = "sluice-source";

/// Shared-secret header attached to every request for a tenant.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret {
    pub header: String,
    pub value: String,
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecret")
            .field("header", &self.header)
            .field("value", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantEndpoint {
    pub tenant_id: String,
    pub base_url: String,
    pub auth: Option<SharedSecret>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub tenant_id: String,
    pub document_type: DocumentType,
    pub cursor: Option<String>,
    pub window: Option<DateWindow>,
    /// Stop after this many pages even if the source reports more.
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    /// Raw rows exactly as the source returned them; validation happens downstream.
    pub rows: Vec<JsonValue>,
    /// Cursor of the next unread page; `None` once the listing is exhausted.
    pub next_cursor: Option<String>,
    pub pages_fetched: u32,
    pub reached_page_limit: bool,
}

/// Wire shape of one listing page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PagePayload {
    #[serde(default)]
    pub rows: Vec<JsonValue>,
    #[serde(default)]
    pub next: Option<JsonValue>,
    #[serde(default)]
    pub count: Option<u64>,
}

impl PagePayload {
    pub fn next_cursor(&self) -> Option<String> {
        match &self.next {
            Some(JsonValue::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("request failed: {0}")]
    Other(String),
}

impl TransportError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            TransportError::Timeout(_) | TransportError::Connection(_) => {
                RetryDisposition::Retryable
            }
            TransportError::Status { .. } | TransportError::Other(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },
    #[error(transparent)]
    Transport(TransportError),
    #[error("invalid response body from {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("source returned cursor `{0}` again; listing is not advancing")]
    RepeatedCursor(String),
    #[error("unknown tenant `{0}`")]
    UnknownTenant(String),
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("building http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// One GET against a fully built URL.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: reqwest::Url,
    pub headers: Vec<(String, String)>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: &TransportRequest) -> Result<Vec<u8>, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn get(&self, request: &TransportRequest) -> Result<Vec<u8>, TransportError> {
        (**self).get(request).await
    }
}

/// The per-tenant paginated listing consumed by the batch runner and verifier.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, SourceError>;

    /// Tenants this source can serve.
    fn tenant_ids(&self) -> Vec<String>;

    /// Total rows the source reports for the unfiltered listing, when it exposes one.
    async fn reported_count(
        &self,
        tenant_id: &str,
        document_type: DocumentType,
    ) -> Result<Option<u64>, SourceError>;
}
