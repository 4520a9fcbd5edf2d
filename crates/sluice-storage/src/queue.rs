use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use sluice_core::WorkUnit;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("queue payload error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("job {0} is not claimed")]
    NotClaimed(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub job_id: Uuid,
    pub unit: WorkUnit,
    pub attempts: u32,
}

/// Execution substrate for work units. A unit may enqueue its own successor
/// while it is being executed.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, unit: WorkUnit) -> Result<(), QueueError>;

    /// Takes the oldest queued job, if any.
    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError>;

    async fn complete(&self, job: &ClaimedJob) -> Result<(), QueueError>;

    async fn fail(&self, job: &ClaimedJob, error: &str) -> Result<(), QueueError>;
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    queued: VecDeque<ClaimedJob>,
    running: HashMap<Uuid, ClaimedJob>,
    completed: Vec<WorkUnit>,
    failed: Vec<(WorkUnit, String)>,
}

/// FIFO queue held in process memory.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn queued_units(&self) -> Vec<WorkUnit> {
        self.state
            .lock()
            .await
            .queued
            .iter()
            .map(|j| j.unit.clone())
            .collect()
    }

    pub async fn completed_units(&self) -> Vec<WorkUnit> {
        self.state.lock().await.completed.clone()
    }

    pub async fn failed_units(&self) -> Vec<(WorkUnit, String)> {
        self.state.lock().await.failed.clone()
    }

    /// Drops every queued job, as a crashed worker host would.
    pub async fn discard_queued(&self) -> usize {
        let mut state = self.state.lock().await;
        let dropped = state.queued.len();
        state.queued.clear();
        dropped
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, unit: WorkUnit) -> Result<(), QueueError> {
        self.state.lock().await.queued.push_back(ClaimedJob {
            job_id: unit.unit_id(),
            unit,
            attempts: 0,
        });
        Ok(())
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let mut state = self.state.lock().await;
        let Some(mut job) = state.queued.pop_front() else {
            return Ok(None);
        };
        job.attempts += 1;
        state.running.insert(job.job_id, job.clone());
        Ok(Some(job))
    }

    async fn complete(&self, job: &ClaimedJob) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let job = state
            .running
            .remove(&job.job_id)
            .ok_or(QueueError::NotClaimed(job.job_id))?;
        state.completed.push(job.unit);
        Ok(())
    }

    async fn fail(&self, job: &ClaimedJob, error: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let job = state
            .running
            .remove(&job.job_id)
            .ok_or(QueueError::NotClaimed(job.job_id))?;
        state.failed.push((job.unit, error.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{BatchUnit, DocumentType, ProgressKey};

    fn unit(sequence: u32) -> WorkUnit {
        let mut unit = BatchUnit::first(
            ProgressKey::new("springfield", DocumentType::Minutes),
            Uuid::new_v4(),
            None,
            Some(10),
        );
        unit.sequence = sequence;
        WorkUnit::Batch(unit)
    }

    #[tokio::test]
    async fn claims_in_fifo_order_and_tracks_outcomes() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(unit(1)).await.unwrap();
        queue.enqueue(unit(2)).await.unwrap();

        let first = queue.claim().await.unwrap().expect("first job");
        let second = queue.claim().await.unwrap().expect("second job");
        assert!(matches!(&first.unit, WorkUnit::Batch(b) if b.sequence == 1));
        assert_eq!(first.attempts, 1);
        assert!(queue.claim().await.unwrap().is_none());

        queue.complete(&first).await.unwrap();
        queue.fail(&second, "read timeout").await.unwrap();

        assert_eq!(queue.completed_units().await.len(), 1);
        let failed = queue.failed_units().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].1, "read timeout");
    }

    #[tokio::test]
    async fn completing_unclaimed_job_is_an_error() {
        let queue = MemoryJobQueue::new();
        let job = ClaimedJob {
            job_id: Uuid::new_v4(),
            unit: unit(1),
            attempts: 1,
        };
        assert!(matches!(queue.complete(&job).await, Err(QueueError::NotClaimed(_))));
    }
}
