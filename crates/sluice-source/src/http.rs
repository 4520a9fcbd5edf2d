use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use sluice_core::{DateWindow, DocumentType};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    FetchOutcome, FetchRequest, PagePayload, RemoteSource, SourceError, TenantEndpoint, Transport,
    TransportError, TransportRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total calls made before giving up, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub page_size: u32,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            page_size: 1000,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
        })
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if classify_reqwest_error(&err) == RetryDisposition::Retryable {
        TransportError::Connection(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, request: &TransportRequest) -> Result<Vec<u8>, TransportError> {
        let mut builder = self.client.get(request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.send().await.map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let body = resp.bytes().await.map_err(transport_error)?;
        Ok(body.to_vec())
    }
}

/// Datasette-style paginated JSON source, one base URL per tenant.
#[derive(Debug)]
pub struct HttpSource<T = ReqwestTransport> {
    transport: T,
    tenants: HashMap<String, TenantEndpoint>,
    page_size: u32,
    backoff: BackoffPolicy,
}

impl HttpSource<ReqwestTransport> {
    pub fn new(
        config: &HttpClientConfig,
        tenants: impl IntoIterator<Item = TenantEndpoint>,
    ) -> Result<Self, SourceError> {
        let transport = ReqwestTransport::new(config)?;
        Ok(Self::with_transport(transport, config, tenants))
    }
}

impl<T: Transport> HttpSource<T> {
    pub fn with_transport(
        transport: T,
        config: &HttpClientConfig,
        tenants: impl IntoIterator<Item = TenantEndpoint>,
    ) -> Self {
        Self {
            transport,
            tenants: tenants
                .into_iter()
                .map(|t| (t.tenant_id.clone(), t))
                .collect(),
            page_size: config.page_size.max(1),
            backoff: config.backoff,
        }
    }

    fn endpoint(&self, tenant_id: &str) -> Result<&TenantEndpoint, SourceError> {
        self.tenants
            .get(tenant_id)
            .ok_or_else(|| SourceError::UnknownTenant(tenant_id.to_string()))
    }

    /// `{base}/{type}.json?_size=..&_next=..&date__gte=..&date__lte=..`
    pub fn page_url(
        &self,
        endpoint: &TenantEndpoint,
        document_type: DocumentType,
        cursor: Option<&str>,
        window: Option<DateWindow>,
        page_size: u32,
    ) -> Result<Url, SourceError> {
        let raw = format!(
            "{}/{}.json",
            endpoint.base_url.trim_end_matches('/'),
            document_type
        );
        let mut url = Url::parse(&raw).map_err(|e| SourceError::InvalidUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("_size", &page_size.to_string());
            if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
                query.append_pair("_next", cursor);
            }
            if let Some(window) = window {
                query.append_pair("date__gte", &window.start.format("%Y-%m-%d").to_string());
                query.append_pair("date__lte", &window.end.format("%Y-%m-%d").to_string());
            }
        }
        Ok(url)
    }

    async fn fetch_pages(
        &self,
        endpoint: &TenantEndpoint,
        request: &FetchRequest,
    ) -> Result<FetchOutcome, SourceError> {
        let page_limit = request.max_pages.map(|m| m.max(1));
        let mut cursor = request.cursor.clone();
        let mut seen: HashSet<String> = cursor.iter().cloned().collect();
        let mut rows = Vec::new();
        let mut pages_fetched = 0u32;

        loop {
            let url = self.page_url(
                endpoint,
                request.document_type,
                cursor.as_deref(),
                request.window,
                self.page_size,
            )?;
            let page = self.get_page(endpoint, url).await?;
            pages_fetched += 1;
            cursor = page.next_cursor();
            debug!(pages_fetched, rows = page.rows.len(), next = ?cursor, "fetched page");
            rows.extend(page.rows);

            if let Some(next) = &cursor {
                if !seen.insert(next.clone()) {
                    return Err(SourceError::RepeatedCursor(next.clone()));
                }
            }
            if cursor.is_none() {
                return Ok(FetchOutcome {
                    rows,
                    next_cursor: None,
                    pages_fetched,
                    reached_page_limit: false,
                });
            }
            if page_limit.is_some_and(|limit| pages_fetched >= limit) {
                return Ok(FetchOutcome {
                    rows,
                    next_cursor: cursor,
                    pages_fetched,
                    reached_page_limit: true,
                });
            }
        }
    }

    /// Fetches and decodes one page, retrying transient transport failures.
    async fn get_page(
        &self,
        endpoint: &TenantEndpoint,
        url: Url,
    ) -> Result<PagePayload, SourceError> {
        let request = TransportRequest {
            headers: endpoint
                .auth
                .iter()
                .map(|s| (s.header.clone(), s.value.clone()))
                .collect(),
            url,
        };
        let max_attempts = self.backoff.max_attempts.max(1);

        let mut attempt = 0u32;
        let body = loop {
            match self.transport.get(&request).await {
                Ok(body) => break body,
                Err(err) if err.disposition() == RetryDisposition::Retryable => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(SourceError::RetriesExhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }
                    let delay = self.backoff.delay_for_attempt(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient fetch failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(SourceError::Transport(err)),
            }
        };

        serde_json::from_slice(&body).map_err(|e| SourceError::Decode {
            url: request.url.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl<T: Transport> RemoteSource for HttpSource<T> {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, SourceError> {
        let endpoint = self.endpoint(&request.tenant_id)?;
        let span = info_span!(
            "http_fetch",
            tenant = %request.tenant_id,
            document_type = %request.document_type,
            cursor = request.cursor.as_deref().unwrap_or("<start>"),
        );

        self.fetch_pages(endpoint, request).instrument(span).await
    }

    fn tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tenants.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn reported_count(
        &self,
        tenant_id: &str,
        document_type: DocumentType,
    ) -> Result<Option<u64>, SourceError> {
        let endpoint = self.endpoint(tenant_id)?;
        let url = self.page_url(endpoint, document_type, None, None, 1)?;
        let page = self
            .get_page(endpoint, url)
            .instrument(info_span!(
                "http_count",
                tenant = %tenant_id,
                document_type = %document_type
            ))
            .await?;
        Ok(page.count)
    }
}
