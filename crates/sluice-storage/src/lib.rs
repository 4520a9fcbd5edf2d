//! Storage and job queue contracts for sluice, with in-memory and Postgres backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::{
    ChildRecord, DocumentKey, DocumentType, NewChildRecord, ParentDocument, ProgressKey,
    ProgressRecord, UpsertOutcome,
};
use thiserror::Error;

mod memory;
mod postgres;
mod queue;

pub use memory::MemoryStore;
pub use postgres::{PgJobQueue, PgStore};
pub use queue::{ClaimedJob, JobQueue, MemoryJobQueue, QueueError};

pub const CRATE_NAME: &str = "sluice-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("rejected record {remote_id}: {reason}")]
    Rejected { remote_id: String, reason: String },
}

/// Result of writing one document and its pages inside a single transaction.
#[derive(Debug)]
pub struct GroupWrite {
    pub document: ParentDocument,
    /// One entry per input child, in input order.
    pub outcomes: Vec<Result<UpsertOutcome, StoreError>>,
}

/// The contract a storage backend satisfies for the ingestion engine.
///
/// Documents are get-or-create on their natural key and pages are
/// update-or-create on their remote id, so replaying any input is safe.
#[async_trait]
pub trait IngestStore: Send + Sync {
    async fn get_or_create_progress(&self, key: &ProgressKey) -> Result<ProgressRecord, StoreError>;

    async fn load_progress(&self, key: &ProgressKey) -> Result<Option<ProgressRecord>, StoreError>;

    async fn save_progress(&self, record: &ProgressRecord) -> Result<(), StoreError>;

    /// Saves `record` only if the stored row was last updated at `expected_updated_at`.
    async fn compare_and_save_progress(
        &self,
        record: &ProgressRecord,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn list_progress(&self, tenant_id: &str) -> Result<Vec<ProgressRecord>, StoreError>;

    async fn count_documents(
        &self,
        tenant_id: &str,
        document_type: DocumentType,
    ) -> Result<u64, StoreError>;

    async fn count_children(
        &self,
        tenant_id: &str,
        document_type: DocumentType,
    ) -> Result<u64, StoreError>;

    /// Gets or creates the document, then upserts every child individually.
    ///
    /// A failing child is reported in `outcomes` without affecting its siblings;
    /// an `Err` means nothing in the group was written.
    async fn write_document_group(
        &self,
        key: &DocumentKey,
        children: &[NewChildRecord],
    ) -> Result<GroupWrite, StoreError>;

    /// All pages for a tenant and document type ordered by remote id.
    async fn list_children(
        &self,
        tenant_id: &str,
        document_type: DocumentType,
    ) -> Result<Vec<ChildRecord>, StoreError>;
}
