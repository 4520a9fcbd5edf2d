use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::{
    ChildRecord, DocumentKey, DocumentType, NewChildRecord, ParentDocument, ProgressKey,
    ProgressRecord, UpsertOutcome,
};
use tokio::sync::Mutex;

use crate::{GroupWrite, IngestStore, StoreError};

type ChildKey = (String, DocumentType, String);

#[derive(Debug, Default)]
struct MemoryState {
    progress: BTreeMap<ProgressKey, ProgressRecord>,
    documents: BTreeMap<DocumentKey, ParentDocument>,
    children: HashMap<ChildKey, ChildRecord>,
}

/// Same restriction Postgres puts on `text` columns.
fn check_storable(child: &NewChildRecord) -> Result<(), String> {
    if child.text.contains('\0') || child.media_ref.as_deref().is_some_and(|m| m.contains('\0')) {
        return Err("value contains a NUL byte".to_string());
    }
    Ok(())
}

/// Process-local store; every operation runs under one lock, so a document
/// group write is atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn get_or_create_progress(
        &self,
        key: &ProgressKey,
    ) -> Result<ProgressRecord, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .progress
            .entry(key.clone())
            .or_insert_with(|| ProgressRecord::new(key, Utc::now()))
            .clone())
    }

    async fn load_progress(&self, key: &ProgressKey) -> Result<Option<ProgressRecord>, StoreError> {
        Ok(self.state.lock().await.progress.get(key).cloned())
    }

    async fn save_progress(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .progress
            .insert(record.key(), record.clone());
        Ok(())
    }

    async fn compare_and_save_progress(
        &self,
        record: &ProgressRecord,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.progress.get_mut(&record.key()) {
            Some(stored) if stored.updated_at == expected_updated_at => {
                *stored = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_progress(&self, tenant_id: &str) -> Result<Vec<ProgressRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .progress
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn count_documents(
        &self,
        tenant_id: &str,
        document_type: DocumentType,
    ) -> Result<u64, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .documents
            .keys()
            .filter(|k| k.tenant_id == tenant_id && k.document_type == document_type)
            .count() as u64)
    }

    async fn count_children(
        &self,
        tenant_id: &str,
        document_type: DocumentType,
    ) -> Result<u64, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .children
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.document_type == document_type)
            .count() as u64)
    }

    async fn write_document_group(
        &self,
        key: &DocumentKey,
        children: &[NewChildRecord],
    ) -> Result<GroupWrite, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let document = state
            .documents
            .entry(key.clone())
            .or_insert_with(|| ParentDocument::from_key(key, now))
            .clone();

        let mut outcomes = Vec::with_capacity(children.len());
        for child in children {
            if let Err(reason) = check_storable(child) {
                outcomes.push(Err(StoreError::Rejected {
                    remote_id: child.remote_id.clone(),
                    reason,
                }));
                continue;
            }
            let child_key = (key.tenant_id.clone(), key.document_type, child.remote_id.clone());
            let outcome = match state.children.entry(child_key) {
                Entry::Occupied(mut entry) => {
                    let existing = entry.get_mut();
                    existing.document_id = document.id;
                    existing.ordinal = child.ordinal;
                    existing.text = child.text.clone();
                    existing.media_ref = child.media_ref.clone();
                    existing.updated_at = now;
                    UpsertOutcome::Updated
                }
                Entry::Vacant(entry) => {
                    entry.insert(ChildRecord {
                        remote_id: child.remote_id.clone(),
                        document_id: document.id,
                        tenant_id: key.tenant_id.clone(),
                        document_type: key.document_type,
                        ordinal: child.ordinal,
                        text: child.text.clone(),
                        media_ref: child.media_ref.clone(),
                        created_at: now,
                        updated_at: now,
                    });
                    UpsertOutcome::Created
                }
            };
            outcomes.push(Ok(outcome));
        }

        Ok(GroupWrite { document, outcomes })
    }

    async fn list_children(
        &self,
        tenant_id: &str,
        document_type: DocumentType,
    ) -> Result<Vec<ChildRecord>, StoreError> {
        let mut out = self
            .state
            .lock()
            .await
            .children
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.document_type == document_type)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        Ok(out)
    }
}
