//! Ingestion engine: orchestration, chained batch units, record upserts and verification.

use std::sync::Arc;

use sluice_source::RemoteSource;
use sluice_storage::{IngestStore, JobQueue};

mod batch;
mod config;
mod error;
mod grouper;
mod orchestrator;
mod progress;
mod scheduler;
mod verify;
mod worker;

pub use batch::{BatchOutcome, BatchRunner, SkipReason};
pub use config::{IngestConfig, SyncConfig, TenantConfig, TenantRegistry, VerificationConfig};
pub use error::{RowError, SyncError};
pub use grouper::{
    group_rows, parse_row_date, validate_row, GroupedRows, RecordUpserter, ValidatedRow,
};
pub use orchestrator::{Orchestrator, TriggerAck, TriggerDisposition};
pub use scheduler::{maybe_build_scheduler, refresh_job};
pub use verify::{assess, VerificationReport, Verdict, Verifier, VerifyOutcome};
pub use worker::{UnitOutcome, Worker, WorkerReport};

pub const CRATE_NAME: &str = "sluice-sync";

/// Every component wired over one store, queue and source.
pub struct Engine {
    pub orchestrator: Arc<Orchestrator>,
    pub worker: Worker,
}

impl Engine {
    pub fn new(
        store: Arc<dyn IngestStore>,
        queue: Arc<dyn JobQueue>,
        source: Arc<dyn RemoteSource>,
        ingest: IngestConfig,
        verification: VerificationConfig,
    ) -> Self {
        let orchestrator = Orchestrator::new(store.clone(), queue.clone(), ingest)
            .with_known_tenants(source.tenant_ids());
        let runner = BatchRunner::new(store.clone(), source.clone(), queue.clone());
        let verifier = Verifier::new(store, source, verification);
        let worker = Worker::new(queue, runner, verifier);
        Self {
            orchestrator: Arc::new(orchestrator),
            worker,
        }
    }

    pub fn from_config(
        store: Arc<dyn IngestStore>,
        queue: Arc<dyn JobQueue>,
        source: Arc<dyn RemoteSource>,
        config: &SyncConfig,
    ) -> Self {
        let mut engine = Self::new(
            store,
            queue,
            source,
            config.ingest.clone(),
            config.verification.clone(),
        );
        engine.worker = engine.worker.with_poll_interval(config.worker_poll_interval());
        engine
    }
}
