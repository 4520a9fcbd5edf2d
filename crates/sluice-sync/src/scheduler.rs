use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::{Orchestrator, SyncConfig};

/// Builds the periodic refresh job, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<Orchestrator>,
    tenants: Vec<String>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = refresh_job(&config.refresh_cron, orchestrator, tenants)?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub fn refresh_job(
    cron: &str,
    orchestrator: Arc<Orchestrator>,
    tenants: Vec<String>,
) -> Result<Job> {
    let tenants = Arc::new(tenants);
    Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        let tenants = tenants.clone();
        Box::pin(async move {
            for tenant in tenants.iter() {
                match orchestrator.start_ingestion(tenant).await {
                    Ok(acks) => info!(tenant = %tenant, ?acks, "scheduled ingestion triggered"),
                    Err(err) => error!(
                        tenant = %tenant,
                        error = %err,
                        "scheduled ingestion failed to start"
                    ),
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_storage::{MemoryJobQueue, MemoryStore};

    use crate::IngestConfig;

    fn orchestrator() -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryJobQueue::new()),
            IngestConfig::default(),
        ))
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let config = SyncConfig::from_lookup(|_| None);
        let sched = maybe_build_scheduler(&config, orchestrator(), vec!["springfield".into()])
            .await
            .unwrap();
        assert!(sched.is_none());
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let err = refresh_job("every tuesday", orchestrator(), vec![])
            .err()
            .expect("invalid cron should be rejected");
        assert!(err.to_string().contains("every tuesday"));
    }
}
