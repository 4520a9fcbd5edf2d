use chrono::{DateTime, Duration, SubsecRound, Utc};
use sluice_core::{ProgressKey, ProgressRecord};
use sluice_storage::IngestStore;
use tracing::debug;

use crate::SyncError;

const UPDATE_ATTEMPTS: usize = 5;

/// A timestamp strictly after `previous`, so every save moves `updated_at`
/// even at the storage layer's microsecond resolution.
pub(crate) fn tick(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6).max(previous + Duration::microseconds(1))
}

/// Read-modify-write of one progress record guarded by compare-and-save.
///
/// `apply` may run several times and must only touch the record it is given.
/// When it leaves the record unchanged nothing is written.
pub(crate) async fn update_progress<T>(
    store: &dyn IngestStore,
    key: &ProgressKey,
    mut apply: impl FnMut(&mut ProgressRecord, DateTime<Utc>) -> Result<T, SyncError>,
) -> Result<(ProgressRecord, T), SyncError> {
    for attempt in 1..=UPDATE_ATTEMPTS {
        let current = store
            .load_progress(key)
            .await?
            .ok_or_else(|| SyncError::ProgressNotFound(key.clone()))?;
        let mut next = current.clone();
        let value = apply(&mut next, tick(current.updated_at))?;

        if next == current {
            return Ok((next, value));
        }
        if store.compare_and_save_progress(&next, current.updated_at).await? {
            return Ok((next, value));
        }
        debug!(%key, attempt, "progress changed concurrently; reloading");
    }
    Err(SyncError::Contended(key.clone()))
}
