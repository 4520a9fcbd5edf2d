use sluice_core::{IngestStatus, ProgressKey};
use sluice_source::SourceError;
use sluice_storage::{QueueError, StoreError};
use thiserror::Error;

/// Why a raw row could not become a page record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RowError {
    #[error("row is not an object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("invalid field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(
        "verification failed for {key}: missing {missing} of {expected} records (stored {actual})"
    )]
    Divergence {
        key: ProgressKey,
        expected: u64,
        actual: u64,
        missing: u64,
    },
    #[error("unknown tenant `{0}`")]
    UnknownTenant(String),
    #[error("no progress record for {0}")]
    ProgressNotFound(ProgressKey),
    #[error("cannot {action} {key} while {status}")]
    InvalidAction {
        key: ProgressKey,
        action: &'static str,
        status: IngestStatus,
    },
    #[error("progress for {0} kept changing underneath the update")]
    Contended(ProgressKey),
}
