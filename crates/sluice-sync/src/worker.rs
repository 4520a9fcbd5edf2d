use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sluice_core::WorkUnit;
use sluice_storage::JobQueue;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::batch::{BatchOutcome, BatchRunner};
use crate::verify::{Verifier, VerifyOutcome};
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Batch(BatchOutcome),
    Verify(VerifyOutcome),
    Failed { unit_id: Uuid, error: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub batches: usize,
    pub verifications: usize,
    pub skipped: usize,
    pub failed: usize,
    pub queue_errors: usize,
}

impl WorkerReport {
    fn observe(&mut self, outcome: &UnitOutcome) {
        match outcome {
            UnitOutcome::Batch(BatchOutcome::Skipped(_))
            | UnitOutcome::Verify(VerifyOutcome::Skipped) => self.skipped += 1,
            UnitOutcome::Batch(_) => self.batches += 1,
            UnitOutcome::Verify(_) => self.verifications += 1,
            UnitOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Pulls units off the queue one at a time and hands failures back to the
/// queue's own bookkeeping.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    runner: BatchRunner,
    verifier: Verifier,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(queue: Arc<dyn JobQueue>, runner: BatchRunner, verifier: Verifier) -> Self {
        Self {
            queue,
            runner,
            verifier,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Claims and executes one unit; `None` when the queue is empty.
    pub async fn run_once(&self) -> Result<Option<UnitOutcome>, SyncError> {
        let Some(job) = self.queue.claim().await? else {
            return Ok(None);
        };
        debug!(job_id = %job.job_id, attempts = job.attempts, "claimed job");

        let result = match &job.unit {
            WorkUnit::Batch(unit) => self.runner.run(unit).await.map(UnitOutcome::Batch),
            WorkUnit::Verify(unit) => self.verifier.run(unit).await.map(UnitOutcome::Verify),
        };

        match result {
            Ok(outcome) => {
                self.queue.complete(&job).await?;
                Ok(Some(outcome))
            }
            Err(err) => {
                let message = err.to_string();
                error!(
                    job_id = %job.job_id,
                    key = %job.unit.key(),
                    error = %message,
                    "unit failed"
                );
                self.queue.fail(&job, &message).await?;
                Ok(Some(UnitOutcome::Failed {
                    unit_id: job.unit.unit_id(),
                    error: message,
                }))
            }
        }
    }

    /// Executes units, including the ones they chain, until the queue is empty.
    pub async fn run_until_idle(&self) -> Result<WorkerReport, SyncError> {
        let mut report = WorkerReport::default();
        while let Some(outcome) = self.run_once().await? {
            report.observe(&outcome);
        }
        Ok(report)
    }

    /// Polls the queue until `shutdown` resolves. A unit in flight always finishes.
    ///
    /// Queue errors are logged and retried after the poll interval.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> WorkerReport {
        tokio::pin!(shutdown);
        let mut report = WorkerReport::default();
        info!(poll_ms = self.poll_interval.as_millis() as u64, "worker started");

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = std::future::ready(()) => {}
            }
            match self.run_once().await {
                Ok(Some(outcome)) => {
                    report.observe(&outcome);
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    error!(error = %err, "queue error; retrying after poll interval");
                    report.queue_errors += 1;
                }
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(?report, "worker stopped");
        report
    }
}
