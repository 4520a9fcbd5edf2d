//! On-disk fixture listings served through the [`Transport`] seam.
//!
//! Layout: `<dir>/<tenant_id>/<document_type>.json`, each file a
//! [`FixtureDataset`]. Tenant endpoints use `fixture://<tenant_id>` as their
//! base URL and cursors are the opaque strings `p1`, `p2`, ...

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sluice_core::DocumentType;
use tokio::sync::Mutex;

use crate::{TenantEndpoint, Transport, TransportError, TransportRequest};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixturePage {
    #[serde(default)]
    pub rows: Vec<JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureDataset {
    /// Reported count; omitted to simulate a source without count metadata.
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub pages: Vec<FixturePage>,
}

type DatasetKey = (String, DocumentType);

#[derive(Debug, Default)]
pub struct FixtureTransport {
    datasets: HashMap<DatasetKey, FixtureDataset>,
    failures: Mutex<HashMap<(DatasetKey, usize), VecDeque<TransportError>>>,
    calls: AtomicUsize,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(
        mut self,
        tenant_id: impl Into<String>,
        document_type: DocumentType,
        dataset: FixtureDataset,
    ) -> Self {
        self.datasets.insert((tenant_id.into(), document_type), dataset);
        self
    }

    /// Loads every `<tenant>/<document_type>.json` under `dir`.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut transport = Self::new();
        for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let tenant_id = entry.file_name().to_string_lossy().to_string();
            for document_type in DocumentType::ALL {
                let path = entry.path().join(format!("{document_type}.json"));
                if !path.exists() {
                    continue;
                }
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let dataset: FixtureDataset = serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?;
                transport
                    .datasets
                    .insert((tenant_id.clone(), document_type), dataset);
            }
        }
        Ok(transport)
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.datasets.keys().map(|(t, _)| t.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn endpoint(tenant_id: &str) -> TenantEndpoint {
        TenantEndpoint {
            tenant_id: tenant_id.to_string(),
            base_url: format!("fixture://{tenant_id}"),
            auth: None,
        }
    }

    pub fn endpoints(&self) -> Vec<TenantEndpoint> {
        self.tenant_ids().iter().map(|t| Self::endpoint(t)).collect()
    }

    /// Makes the next request for `page_index` (0-based) fail with `error`.
    pub async fn fail_next(
        &self,
        tenant_id: &str,
        document_type: DocumentType,
        page_index: usize,
        error: TransportError,
    ) {
        self.failures
            .lock()
            .await
            .entry(((tenant_id.to_string(), document_type), page_index))
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn page_index_from_cursor(cursor: &str) -> Option<usize> {
    cursor.strip_prefix('p')?.parse().ok()
}

fn row_date(row: &JsonValue) -> Option<&str> {
    row.get("date")?.as_str()?.get(..10)
}

#[async_trait]
impl Transport for FixtureTransport {
    async fn get(&self, request: &TransportRequest) -> Result<Vec<u8>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let url = &request.url;
        let not_found = || TransportError::Status {
            status: 404,
            url: url.to_string(),
        };

        let tenant_id = url.host_str().ok_or_else(not_found)?.to_string();
        let document_type: DocumentType = url
            .path()
            .trim_start_matches('/')
            .strip_suffix(".json")
            .and_then(|s| s.parse().ok())
            .ok_or_else(not_found)?;
        let key = (tenant_id, document_type);
        let dataset = self.datasets.get(&key).ok_or_else(not_found)?;

        let mut page_index = 0usize;
        let mut size: Option<usize> = None;
        let mut date_from: Option<String> = None;
        let mut date_to: Option<String> = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "_next" => {
                    page_index =
                        page_index_from_cursor(&value).ok_or_else(|| TransportError::Status {
                            status: 400,
                            url: url.to_string(),
                        })?;
                }
                "_size" => size = value.parse().ok(),
                "date__gte" => date_from = Some(value.into_owned()),
                "date__lte" => date_to = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(err) = self
            .failures
            .lock()
            .await
            .get_mut(&(key.clone(), page_index))
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }

        let rows: Vec<JsonValue> = dataset
            .pages
            .get(page_index)
            .map(|page| page.rows.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|row| {
                if date_from.is_none() && date_to.is_none() {
                    return true;
                }
                let Some(date) = row_date(row) else {
                    return false;
                };
                date_from.as_deref().map_or(true, |from| date >= from)
                    && date_to.as_deref().map_or(true, |to| date <= to)
            })
            .take(size.unwrap_or(usize::MAX))
            .collect();

        let next = if page_index + 1 < dataset.pages.len() {
            JsonValue::String(format!("p{}", page_index + 1))
        } else {
            JsonValue::Null
        };
        let body = serde_json::json!({
            "rows": rows,
            "next": next,
            "count": dataset.count,
        });
        serde_json::to_vec(&body).map_err(|e| TransportError::Other(e.to_string()))
    }
}
