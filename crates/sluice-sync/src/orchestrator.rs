use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use sluice_core::{
    BatchUnit, DateWindow, DocumentType, IngestMode, IngestStatus, ProgressKey, ProgressRecord,
    WorkUnit,
};
use sluice_storage::{IngestStore, JobQueue};
use tracing::{info, warn};
use uuid::Uuid;

use crate::progress::update_progress;
use crate::{IngestConfig, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDisposition {
    /// A fresh run from the start of the listing.
    Started,
    /// Continued a failed, paused or stale run from its checkpoint.
    Resumed,
    /// A live chain already owns the record; nothing was enqueued.
    AlreadyRunning,
}

/// Acknowledgment returned to the trigger caller for one document type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerAck {
    pub mode: IngestMode,
    pub unit_enqueued: bool,
    pub disposition: TriggerDisposition,
    pub run_id: Option<Uuid>,
    pub cursor: Option<String>,
}

enum Decision {
    Skip,
    Begin(IngestMode),
    Resume,
}

pub struct Orchestrator {
    store: Arc<dyn IngestStore>,
    queue: Arc<dyn JobQueue>,
    config: IngestConfig,
    known_tenants: Option<BTreeSet<String>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn IngestStore>,
        queue: Arc<dyn JobQueue>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            known_tenants: None,
        }
    }

    /// Restricts triggers to these tenants; any other id is rejected before a
    /// progress record is created.
    pub fn with_known_tenants(mut self, tenants: impl IntoIterator<Item = String>) -> Self {
        self.known_tenants = Some(tenants.into_iter().collect());
        self
    }

    fn ensure_known(&self, tenant_id: &str) -> Result<(), SyncError> {
        match &self.known_tenants {
            Some(known) if !known.contains(tenant_id) => {
                Err(SyncError::UnknownTenant(tenant_id.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Starts or resumes one run per document type. Does not wait for completion.
    pub async fn start_ingestion(
        &self,
        tenant_id: &str,
    ) -> Result<BTreeMap<DocumentType, TriggerAck>, SyncError> {
        self.ensure_known(tenant_id)?;
        let mut acks = BTreeMap::new();
        for document_type in DocumentType::ALL {
            let key = ProgressKey::new(tenant_id, document_type);
            acks.insert(document_type, self.trigger(&key).await?);
        }
        Ok(acks)
    }

    pub async fn trigger(&self, key: &ProgressKey) -> Result<TriggerAck, SyncError> {
        self.ensure_known(&key.tenant_id)?;
        self.store.get_or_create_progress(key).await?;
        let has_documents = self
            .store
            .count_documents(&key.tenant_id, key.document_type)
            .await?
            > 0;
        let stale_after = self.config.stale_after;
        let window_months = self.config.window_months;

        let (record, decision) = update_progress(self.store.as_ref(), key, |record, now| {
            let decision = match record.status {
                IngestStatus::InProgress if !record.is_stale(now, stale_after) => Decision::Skip,
                _ if record.force_full_refresh => Decision::Begin(IngestMode::Full),
                IngestStatus::InProgress | IngestStatus::Failed | IngestStatus::Paused
                    if record.run_id.is_some() =>
                {
                    Decision::Resume
                }
                _ if has_documents => Decision::Begin(IngestMode::Incremental),
                _ => Decision::Begin(IngestMode::Full),
            };
            match decision {
                Decision::Skip => {}
                Decision::Begin(IngestMode::Full) => {
                    record.begin_run(IngestMode::Full, None, now);
                }
                Decision::Begin(IngestMode::Incremental) => {
                    let window = DateWindow::around(now.date_naive(), window_months);
                    record.begin_run(IngestMode::Incremental, Some(window), now);
                }
                Decision::Resume => {
                    record.resume(now);
                }
            }
            Ok(decision)
        })
        .await?;

        let disposition = match decision {
            Decision::Skip => {
                info!(
                    %key,
                    run_id = ?record.run_id,
                    "run already in progress; not starting a second chain"
                );
                return Ok(self.ack(&record, false, TriggerDisposition::AlreadyRunning));
            }
            Decision::Begin(_) => TriggerDisposition::Started,
            Decision::Resume => TriggerDisposition::Resumed,
        };

        self.enqueue_first_unit(&record).await?;
        info!(
            %key,
            mode = %record.mode,
            run_id = ?record.run_id,
            cursor = record.cursor.as_deref().unwrap_or("<start>"),
            ?disposition,
            "ingestion run enqueued"
        );
        Ok(self.ack(&record, true, disposition))
    }

    /// Flags every document type for a full re-ingest, then triggers.
    pub async fn force_full_refresh(
        &self,
        tenant_id: &str,
    ) -> Result<BTreeMap<DocumentType, TriggerAck>, SyncError> {
        self.ensure_known(tenant_id)?;
        for document_type in DocumentType::ALL {
            let key = ProgressKey::new(tenant_id, document_type);
            self.store.get_or_create_progress(&key).await?;
            update_progress(self.store.as_ref(), &key, |record, now| {
                if !record.force_full_refresh {
                    record.force_full_refresh = true;
                    record.updated_at = now;
                }
                Ok(())
            })
            .await?;
        }
        self.start_ingestion(tenant_id).await
    }

    /// Puts a failed record back in progress and resumes from its cursor.
    pub async fn retry_failed(
        &self,
        tenant_id: &str,
        document_type: DocumentType,
    ) -> Result<TriggerAck, SyncError> {
        let key = ProgressKey::new(tenant_id, document_type);
        let (record, ()) = update_progress(self.store.as_ref(), &key, |record, now| {
            if record.status != IngestStatus::Failed || record.run_id.is_none() {
                return Err(SyncError::InvalidAction {
                    key: key.clone(),
                    action: "retry",
                    status: record.status,
                });
            }
            record.resume(now);
            Ok(())
        })
        .await?;

        self.enqueue_first_unit(&record).await?;
        info!(%key, run_id = ?record.run_id, cursor = ?record.cursor, "retrying failed run");
        Ok(self.ack(&record, true, TriggerDisposition::Resumed))
    }

    /// Stops the chain after the unit currently in flight.
    pub async fn pause(
        &self,
        tenant_id: &str,
        document_type: DocumentType,
    ) -> Result<ProgressRecord, SyncError> {
        let key = ProgressKey::new(tenant_id, document_type);
        let (record, ()) = update_progress(self.store.as_ref(), &key, |record, now| {
            if record.status != IngestStatus::InProgress {
                return Err(SyncError::InvalidAction {
                    key: key.clone(),
                    action: "pause",
                    status: record.status,
                });
            }
            record.mark_paused(now);
            Ok(())
        })
        .await?;
        warn!(%key, cursor = ?record.cursor, "run paused by operator");
        Ok(record)
    }

    pub async fn progress_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<ProgressRecord>, SyncError> {
        Ok(self.store.list_progress(tenant_id).await?)
    }

    async fn enqueue_first_unit(&self, record: &ProgressRecord) -> Result<(), SyncError> {
        let key = record.key();
        let run_id = record
            .run_id
            .ok_or_else(|| SyncError::ProgressNotFound(key.clone()))?;
        let max_pages = match record.mode {
            IngestMode::Full => Some(self.config.pages_per_unit.max(1)),
            IngestMode::Incremental => None,
        };
        let unit = BatchUnit::first(key, run_id, record.cursor.clone(), max_pages);
        self.queue.enqueue(WorkUnit::Batch(unit)).await?;
        Ok(())
    }

    fn ack(
        &self,
        record: &ProgressRecord,
        unit_enqueued: bool,
        disposition: TriggerDisposition,
    ) -> TriggerAck {
        TriggerAck {
            mode: record.mode,
            unit_enqueued,
            disposition,
            run_id: record.run_id,
            cursor: record.cursor.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sluice_storage::{MemoryJobQueue, MemoryStore};

    fn orchestrator() -> (Arc<MemoryStore>, Arc<MemoryJobQueue>, Orchestrator) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let orchestrator = Orchestrator::new(store.clone(), queue.clone(), IngestConfig::default());
        (store, queue, orchestrator)
    }

    #[tokio::test]
    async fn first_trigger_runs_full_with_bounded_units() {
        let (store, queue, orchestrator) = orchestrator();
        let acks = orchestrator.start_ingestion("springfield").await.unwrap();

        assert_eq!(acks.len(), 2);
        for ack in acks.values() {
            assert_eq!(ack.mode, IngestMode::Full);
            assert!(ack.unit_enqueued);
            assert_eq!(ack.disposition, TriggerDisposition::Started);
        }
        let units = queue.queued_units().await;
        assert_eq!(units.len(), 2);
        assert!(units.iter().all(|u| matches!(
            u,
            WorkUnit::Batch(b) if b.max_pages == Some(10) && b.cursor.is_none()
        )));

        let record = store
            .load_progress(&ProgressKey::new("springfield", DocumentType::Minutes))
            .await
            .unwrap()
            .expect("record");
        assert_eq!(record.status, IngestStatus::InProgress);
    }

    #[tokio::test]
    async fn concurrent_trigger_is_a_no_op() {
        let (_store, queue, orchestrator) = orchestrator();
        orchestrator.start_ingestion("springfield").await.unwrap();
        let again = orchestrator.start_ingestion("springfield").await.unwrap();

        assert!(again.values().all(|ack| {
            !ack.unit_enqueued && ack.disposition == TriggerDisposition::AlreadyRunning
        }));
        assert_eq!(queue.queued_units().await.len(), 2);
    }

    #[tokio::test]
    async fn existing_documents_select_incremental_window() {
        let (store, queue, orchestrator) = orchestrator();
        let key = sluice_core::DocumentKey {
            tenant_id: "springfield".into(),
            document_type: DocumentType::Agendas,
            name: "Council".into(),
            date: chrono::NaiveDate::from_ymd_opt(2025, 1, 14).unwrap(),
        };
        store.write_document_group(&key, &[]).await.unwrap();

        let ack = orchestrator
            .trigger(&ProgressKey::new("springfield", DocumentType::Agendas))
            .await
            .unwrap();
        assert_eq!(ack.mode, IngestMode::Incremental);

        let record = store
            .load_progress(&ProgressKey::new("springfield", DocumentType::Agendas))
            .await
            .unwrap()
            .expect("record");
        let window = record.window().expect("window");
        assert!(window.contains(Utc::now().date_naive()));
        let units = queue.queued_units().await;
        assert!(matches!(&units[0], WorkUnit::Batch(b) if b.max_pages.is_none()));
    }

    #[tokio::test]
    async fn retry_requires_failed_status() {
        let (_store, _queue, orchestrator) = orchestrator();
        orchestrator.start_ingestion("springfield").await.unwrap();
        let err = orchestrator
            .retry_failed("springfield", DocumentType::Minutes)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidAction {
                action: "retry",
                status: IngestStatus::InProgress,
                ..
            }
        ));

        let missing = orchestrator
            .retry_failed("shelbyville", DocumentType::Minutes)
            .await
            .unwrap_err();
        assert!(matches!(missing, SyncError::ProgressNotFound(_)));
    }

    #[tokio::test]
    async fn force_refresh_sets_flag_on_every_type() {
        let (store, _queue, orchestrator) = orchestrator();
        orchestrator.force_full_refresh("springfield").await.unwrap();
        for record in store.list_progress("springfield").await.unwrap() {
            assert!(record.force_full_refresh);
            assert_eq!(record.mode, IngestMode::Full);
            assert_eq!(record.status, IngestStatus::InProgress);
        }
    }

    #[tokio::test]
    async fn unregistered_tenant_creates_no_records() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let orchestrator = Orchestrator::new(store.clone(), queue.clone(), IngestConfig::default())
            .with_known_tenants(["springfield".to_string()]);

        let err = orchestrator.start_ingestion("springfeld").await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownTenant(ref t) if t == "springfeld"));
        let err = orchestrator.force_full_refresh("springfeld").await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownTenant(_)));

        assert!(store.list_progress("springfeld").await.unwrap().is_empty());
        assert!(queue.queued_units().await.is_empty());
        assert!(orchestrator.start_ingestion("springfield").await.is_ok());
    }
}
