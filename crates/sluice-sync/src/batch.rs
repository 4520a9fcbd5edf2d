use std::sync::Arc;

use serde::Serialize;
use sluice_core::{
    BatchCounts, BatchUnit, IngestMode, IngestStatus, ProgressRecord, VerifyUnit, WorkUnit,
};
use sluice_source::{FetchRequest, RemoteSource};
use sluice_storage::{IngestStore, JobQueue};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::grouper::RecordUpserter;
use crate::progress::update_progress;
use crate::SyncError;

/// Why a delivered unit was dropped without doing any work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The record belongs to a newer run than the unit.
    StaleRun,
    /// The checkpoint already moved past the unit's cursor.
    CursorMismatch,
    /// The record is paused, failed or finished.
    NotInProgress(IngestStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Checkpoint saved and the successor enqueued.
    Chained { counts: BatchCounts, next: BatchUnit },
    /// Listing exhausted; the record is completed and verification enqueued.
    Completed { counts: BatchCounts },
    /// Checkpoint saved but the record left `in_progress` meanwhile, so the chain stops here.
    Halted { counts: BatchCounts, status: IngestStatus },
    Skipped(SkipReason),
}

fn admit(record: &ProgressRecord, unit: &BatchUnit) -> Result<(), SkipReason> {
    if record.run_id != Some(unit.run_id) {
        return Err(SkipReason::StaleRun);
    }
    if record.cursor != unit.cursor {
        return Err(SkipReason::CursorMismatch);
    }
    Ok(())
}

/// Executes one bounded fetch, process and checkpoint step.
pub struct BatchRunner {
    store: Arc<dyn IngestStore>,
    source: Arc<dyn RemoteSource>,
    queue: Arc<dyn JobQueue>,
    upserter: RecordUpserter,
}

impl BatchRunner {
    pub fn new(
        store: Arc<dyn IngestStore>,
        source: Arc<dyn RemoteSource>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            upserter: RecordUpserter::new(store.clone()),
            store,
            source,
            queue,
        }
    }

    pub async fn run(&self, unit: &BatchUnit) -> Result<BatchOutcome, SyncError> {
        let span = info_span!(
            "batch_unit",
            tenant = %unit.key.tenant_id,
            document_type = %unit.key.document_type,
            run_id = %unit.run_id,
            unit_id = %unit.unit_id,
            sequence = unit.sequence,
        );
        self.admit_and_execute(unit).instrument(span).await
    }

    async fn admit_and_execute(&self, unit: &BatchUnit) -> Result<BatchOutcome, SyncError> {
        let record = self
            .store
            .load_progress(&unit.key)
            .await?
            .ok_or_else(|| SyncError::ProgressNotFound(unit.key.clone()))?;
        if let Err(reason) = admit(&record, unit) {
            warn!(
                ?reason,
                record_run = ?record.run_id,
                record_cursor = ?record.cursor,
                "dropping stale unit"
            );
            return Ok(BatchOutcome::Skipped(reason));
        }
        if record.status != IngestStatus::InProgress {
            info!(status = %record.status, "record not in progress; chain stops");
            return Ok(BatchOutcome::Skipped(SkipReason::NotInProgress(record.status)));
        }

        match self.execute(unit, &record).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(error = %err, "batch unit failed");
                self.record_failure(unit, &err).await;
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        unit: &BatchUnit,
        record: &ProgressRecord,
    ) -> Result<BatchOutcome, SyncError> {
        let request = FetchRequest {
            tenant_id: unit.key.tenant_id.clone(),
            document_type: unit.key.document_type,
            cursor: record.cursor.clone(),
            window: match record.mode {
                IngestMode::Incremental => record.window(),
                IngestMode::Full => None,
            },
            max_pages: unit.max_pages,
        };
        let fetched = self.source.fetch(&request).await?;
        let counts = self.upserter.process(&unit.key, &fetched.rows).await;
        let next_cursor = fetched.next_cursor.filter(|c| !c.is_empty());

        let (saved, admitted) = update_progress(self.store.as_ref(), &unit.key, |current, now| {
            if let Err(reason) = admit(current, unit) {
                return Ok(Err(reason));
            }
            current.record_batch(counts, next_cursor.clone(), now);
            let exhausted = next_cursor.is_none();
            let running = matches!(current.status, IngestStatus::InProgress | IngestStatus::Paused);
            if exhausted && running {
                current.mark_completed(now);
            }
            Ok(Ok(()))
        })
        .await?;

        if let Err(reason) = admitted {
            warn!(?reason, "checkpoint superseded by another unit; discarding counts");
            return Ok(BatchOutcome::Skipped(reason));
        }

        info!(
            fetched = counts.fetched,
            created = counts.created,
            updated = counts.updated,
            errors = counts.errors,
            pages = fetched.pages_fetched,
            next = next_cursor.as_deref().unwrap_or("<end>"),
            "checkpoint saved"
        );

        match (saved.status, next_cursor) {
            (IngestStatus::Completed, _) => {
                let verify = VerifyUnit {
                    unit_id: Uuid::new_v4(),
                    key: unit.key.clone(),
                    run_id: unit.run_id,
                };
                self.queue.enqueue(WorkUnit::Verify(verify)).await?;
                info!(
                    units = saved.units_executed,
                    total_fetched = saved.records_fetched,
                    "run completed; verification enqueued"
                );
                Ok(BatchOutcome::Completed { counts })
            }
            (IngestStatus::InProgress, Some(cursor)) => {
                let next = unit.successor(cursor);
                self.queue.enqueue(WorkUnit::Batch(next.clone())).await?;
                Ok(BatchOutcome::Chained { counts, next })
            }
            (status, _) => {
                info!(%status, "record left in_progress during the unit; not chaining");
                Ok(BatchOutcome::Halted { counts, status })
            }
        }
    }

    /// Marks the run failed, keeping the last saved checkpoint. A run that
    /// completed but could not enqueue its verification is failed too.
    async fn record_failure(&self, unit: &BatchUnit, err: &SyncError) {
        let message = err.to_string();
        let result = update_progress(self.store.as_ref(), &unit.key, |current, now| {
            let live = matches!(current.status, IngestStatus::InProgress | IngestStatus::Completed);
            if current.run_id == Some(unit.run_id) && live {
                current.mark_failed(message.clone(), now);
            }
            Ok(())
        })
        .await;
        if let Err(save_err) = result {
            error!(error = %save_err, "could not record unit failure on progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::{DocumentType, ProgressKey};
    use sluice_source::{
        FixtureDataset, FixturePage, FixtureTransport, HttpClientConfig, HttpSource, TransportError,
    };
    use async_trait::async_trait;
    use sluice_storage::{ClaimedJob, MemoryJobQueue, MemoryStore, QueueError};

    use crate::{IngestConfig, Orchestrator};

    /// Accepts batch units but refuses to enqueue verification.
    struct NoVerifyQueue(Arc<MemoryJobQueue>);

    #[async_trait]
    impl JobQueue for NoVerifyQueue {
        async fn enqueue(&self, unit: WorkUnit) -> Result<(), QueueError> {
            match unit {
                WorkUnit::Verify(v) => Err(QueueError::NotClaimed(v.unit_id)),
                batch => self.0.enqueue(batch).await,
            }
        }

        async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
            self.0.claim().await
        }

        async fn complete(&self, job: &ClaimedJob) -> Result<(), QueueError> {
            self.0.complete(job).await
        }

        async fn fail(&self, job: &ClaimedJob, error: &str) -> Result<(), QueueError> {
            self.0.fail(job, error).await
        }
    }

    fn dataset(pages: usize) -> FixtureDataset {
        FixtureDataset {
            count: Some(pages as u64),
            pages: (0..pages)
                .map(|i| FixturePage {
                    rows: vec![json!({
                        "id": format!("m-{i}"),
                        "name": "Council",
                        "date": "2025-01-14",
                        "ordinal": i,
                    })],
                })
                .collect(),
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryJobQueue>,
        transport: Arc<FixtureTransport>,
        runner: BatchRunner,
        orchestrator: Orchestrator,
    }

    fn harness(pages: usize) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let transport = Arc::new(FixtureTransport::new().with_dataset(
            "springfield",
            DocumentType::Minutes,
            dataset(pages),
        ));
        let source = Arc::new(HttpSource::with_transport(
            transport.clone(),
            &HttpClientConfig::default(),
            transport.endpoints(),
        ));
        let runner = BatchRunner::new(store.clone(), source, queue.clone());
        let orchestrator = Orchestrator::new(
            store.clone(),
            queue.clone(),
            IngestConfig {
                pages_per_unit: 2,
                ..IngestConfig::default()
            },
        );
        Harness { store, queue, transport, runner, orchestrator }
    }

    fn minutes() -> ProgressKey {
        ProgressKey::new("springfield", DocumentType::Minutes)
    }

    async fn first_unit(h: &Harness) -> BatchUnit {
        h.orchestrator.trigger(&minutes()).await.unwrap();
        match h.queue.queued_units().await.pop() {
            Some(WorkUnit::Batch(unit)) => unit,
            other => panic!("expected batch unit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unit_checkpoints_then_chains_successor() {
        let h = harness(5);
        let unit = first_unit(&h).await;

        let outcome = h.runner.run(&unit).await.unwrap();
        let BatchOutcome::Chained { counts, next } = outcome else {
            panic!("expected chain, got {outcome:?}");
        };
        assert_eq!(counts.fetched, 2);
        assert_eq!(next.cursor.as_deref(), Some("p2"));
        assert_eq!(next.sequence, 2);

        let record = h.store.load_progress(&minutes()).await.unwrap().unwrap();
        assert_eq!(record.cursor.as_deref(), Some("p2"));
        assert_eq!(record.units_executed, 1);
    }

    #[tokio::test]
    async fn redelivered_unit_is_dropped() {
        let h = harness(5);
        let unit = first_unit(&h).await;
        h.runner.run(&unit).await.unwrap();
        let calls = h.transport.calls();

        let replay = h.runner.run(&unit).await.unwrap();
        assert_eq!(replay, BatchOutcome::Skipped(SkipReason::CursorMismatch));
        assert_eq!(h.transport.calls(), calls);

        let record = h.store.load_progress(&minutes()).await.unwrap().unwrap();
        assert_eq!(record.records_fetched, 2);
    }

    #[tokio::test]
    async fn unit_from_superseded_run_is_dropped() {
        let h = harness(1);
        let unit = first_unit(&h).await;
        h.orchestrator.pause("springfield", DocumentType::Minutes).await.unwrap();
        h.orchestrator.trigger(&minutes()).await.unwrap();

        assert_eq!(h.runner.run(&unit).await.unwrap(), BatchOutcome::Skipped(SkipReason::StaleRun));
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn paused_record_stops_the_chain() {
        let h = harness(5);
        let unit = first_unit(&h).await;
        let record = h.store.load_progress(&minutes()).await.unwrap().unwrap();
        let mut paused = record.clone();
        paused.mark_paused(record.updated_at + chrono::Duration::seconds(1));
        h.store.save_progress(&paused).await.unwrap();

        assert_eq!(
            h.runner.run(&unit).await.unwrap(),
            BatchOutcome::Skipped(SkipReason::NotInProgress(IngestStatus::Paused))
        );
    }

    #[tokio::test]
    async fn http_error_fails_the_run_and_keeps_checkpoint() {
        let h = harness(5);
        let unit = first_unit(&h).await;
        let BatchOutcome::Chained { next, .. } = h.runner.run(&unit).await.unwrap() else {
            panic!("expected chain");
        };
        h.transport
            .fail_next(
                "springfield",
                DocumentType::Minutes,
                2,
                TransportError::Status { status: 500, url: "fixture://springfield".into() },
            )
            .await;

        let err = h.runner.run(&next).await.unwrap_err();
        assert!(matches!(err, SyncError::Source(_)));

        let record = h.store.load_progress(&minutes()).await.unwrap().unwrap();
        assert_eq!(record.status, IngestStatus::Failed);
        assert_eq!(record.cursor.as_deref(), Some("p2"));
        assert_eq!(record.records_fetched, 2);
        assert_eq!(record.retry_count, 1);
        assert!(record.last_error.as_deref().unwrap_or_default().contains("500"));
    }

    #[tokio::test]
    async fn final_unit_completes_and_enqueues_verification() {
        let h = harness(1);
        let unit = first_unit(&h).await;
        assert!(matches!(h.runner.run(&unit).await.unwrap(), BatchOutcome::Completed { .. }));

        let record = h.store.load_progress(&minutes()).await.unwrap().unwrap();
        assert_eq!(record.status, IngestStatus::Completed);
        assert_eq!(record.cursor, None);
        assert!(h
            .queue
            .queued_units()
            .await
            .iter()
            .any(|u| matches!(u, WorkUnit::Verify(v) if v.run_id == unit.run_id)));
    }

    #[tokio::test]
    async fn verification_enqueue_failure_fails_the_completed_run() {
        let h = harness(1);
        let unit = first_unit(&h).await;
        let source = Arc::new(HttpSource::with_transport(
            h.transport.clone(),
            &HttpClientConfig::default(),
            h.transport.endpoints(),
        ));
        let runner = BatchRunner::new(
            h.store.clone(),
            source,
            Arc::new(NoVerifyQueue(h.queue.clone())),
        );

        let err = runner.run(&unit).await.unwrap_err();
        assert!(matches!(err, SyncError::Queue(_)));

        let record = h.store.load_progress(&minutes()).await.unwrap().unwrap();
        assert_eq!(record.status, IngestStatus::Failed);
        assert_eq!(record.records_fetched, 1);
        assert!(record.last_error.is_some());
        assert!(h.queue.queued_units().await.is_empty());

        h.orchestrator
            .retry_failed("springfield", DocumentType::Minutes)
            .await
            .unwrap();
        let record = h.store.load_progress(&minutes()).await.unwrap().unwrap();
        assert_eq!(record.status, IngestStatus::InProgress);
        assert_eq!(h.queue.queued_units().await.len(), 1);
    }
}
