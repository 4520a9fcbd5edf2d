use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use sluice_core::{IngestStatus, ProgressKey, ProgressRecord, VerifyUnit};
use sluice_source::{FetchRequest, RemoteSource, SourceError};
use sluice_storage::IngestStore;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::progress::update_progress;
use crate::{SyncError, VerificationConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Local count meets or exceeds the remote count.
    Complete,
    /// Some records are missing but within both tolerances.
    WithinTolerance,
    /// Missing records exceed a tolerance; the run is failed.
    Diverged,
    /// The remote exposes no count and no sweep was allowed.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub expected: Option<u64>,
    pub actual: u64,
    pub missing: u64,
    pub verdict: Verdict,
}

/// Pure threshold check: diverged when `missing` is strictly greater than
/// either the absolute tolerance or `expected * relative_tolerance`.
pub fn assess(
    expected: Option<u64>,
    actual: u64,
    config: &VerificationConfig,
) -> VerificationReport {
    let Some(expected) = expected else {
        return VerificationReport {
            expected: None,
            actual,
            missing: 0,
            verdict: Verdict::Unknown,
        };
    };
    let missing = expected.saturating_sub(actual);
    let verdict = if missing == 0 {
        Verdict::Complete
    } else if missing > config.absolute_tolerance
        || missing as f64 > expected as f64 * config.relative_tolerance
    {
        Verdict::Diverged
    } else {
        Verdict::WithinTolerance
    };
    VerificationReport {
        expected: Some(expected),
        actual,
        missing,
        verdict,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified(VerificationReport),
    /// The record moved on to another run or is no longer completed.
    Skipped,
}

pub struct Verifier {
    store: Arc<dyn IngestStore>,
    source: Arc<dyn RemoteSource>,
    config: VerificationConfig,
}

impl Verifier {
    pub fn new(
        store: Arc<dyn IngestStore>,
        source: Arc<dyn RemoteSource>,
        config: VerificationConfig,
    ) -> Self {
        Self { store, source, config }
    }

    /// Runs a queued verification; fails with [`SyncError::Divergence`] on unacceptable loss.
    pub async fn run(&self, unit: &VerifyUnit) -> Result<VerifyOutcome, SyncError> {
        let span = info_span!(
            "verify_unit",
            tenant = %unit.key.tenant_id,
            document_type = %unit.key.document_type,
            run_id = %unit.run_id,
            unit_id = %unit.unit_id,
        );
        self.run_admitted(unit).instrument(span).await
    }

    async fn run_admitted(&self, unit: &VerifyUnit) -> Result<VerifyOutcome, SyncError> {
        let record = self
            .store
            .load_progress(&unit.key)
            .await?
            .ok_or_else(|| SyncError::ProgressNotFound(unit.key.clone()))?;
        if !awaiting_verification(&record, unit.run_id) {
            info!(status = %record.status, "record moved on; skipping verification");
            return Ok(VerifyOutcome::Skipped);
        }
        self.verify(&unit.key, unit.run_id).await
    }

    /// Compares the remote count to stored pages and records both on the
    /// progress record, provided it still holds the completed run `run_id`.
    pub async fn verify(
        &self,
        key: &ProgressKey,
        run_id: Uuid,
    ) -> Result<VerifyOutcome, SyncError> {
        let expected = self.expected_count(key).await?;
        let actual = self
            .store
            .count_children(&key.tenant_id, key.document_type)
            .await?;
        let report = assess(expected, actual, &self.config);

        let divergence = || SyncError::Divergence {
            key: key.clone(),
            expected: expected.unwrap_or_default(),
            actual,
            missing: report.missing,
        };
        let message = divergence().to_string();
        let (_, applied) = update_progress(self.store.as_ref(), key, |record, now| {
            if !awaiting_verification(record, run_id) {
                return Ok(false);
            }
            record.record_verification(expected, actual, now);
            if report.verdict == Verdict::Diverged {
                record.mark_failed(message.clone(), now);
            }
            Ok(true)
        })
        .await?;
        if !applied {
            info!("record moved on while counting; discarding verification");
            return Ok(VerifyOutcome::Skipped);
        }

        match report.verdict {
            Verdict::Complete => info!(expected = ?expected, actual, "verification passed"),
            Verdict::WithinTolerance => warn!(
                expected = ?expected,
                actual,
                missing = report.missing,
                "verification within tolerance"
            ),
            Verdict::Unknown => warn!(actual, "remote exposes no count; recorded local count only"),
            Verdict::Diverged => return Err(divergence()),
        }
        Ok(VerifyOutcome::Verified(report))
    }

    async fn expected_count(&self, key: &ProgressKey) -> Result<Option<u64>, SyncError> {
        if let Some(count) = self
            .source
            .reported_count(&key.tenant_id, key.document_type)
            .await?
        {
            return Ok(Some(count));
        }
        if !self.config.sweep_fallback {
            return Ok(None);
        }
        warn!(%key, "remote reports no count; sweeping the full listing");
        self.sweep_count(key).await.map(Some)
    }

    /// Counts rows by paging through the whole unfiltered listing.
    async fn sweep_count(&self, key: &ProgressKey) -> Result<u64, SyncError> {
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();
        let mut total = 0u64;
        loop {
            let outcome = self
                .source
                .fetch(&FetchRequest {
                    tenant_id: key.tenant_id.clone(),
                    document_type: key.document_type,
                    cursor,
                    window: None,
                    max_pages: Some(self.config.sweep_pages_per_request.max(1)),
                })
                .await?;
            total += outcome.rows.len() as u64;
            match outcome.next_cursor {
                Some(next) if !seen.insert(next.clone()) => {
                    return Err(SourceError::RepeatedCursor(next).into());
                }
                Some(next) => cursor = Some(next),
                None => return Ok(total),
            }
        }
    }
}

fn awaiting_verification(record: &ProgressRecord, run_id: Uuid) -> bool {
    record.run_id == Some(run_id) && record.status == IngestStatus::Completed
}
