//! Durable posting-job queue.
//!
//! Consumers claim one due job at a time (prefetch of one); scaling out is
//! adding consumers. FIFO claim order plus the per-document lock keeps
//! per-document ordering: a retry never jumps ahead of an older due job.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::Serialize;

use keel_core::{JobId, TenantId};

use crate::job::{JobStatus, PostingJob};

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("queue storage failure: {0}")]
    Storage(String),
}

impl From<QueueError> for keel_core::EngineError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(_) | QueueError::TenantIsolation => {
                keel_core::EngineError::validation(err.to_string())
            }
            QueueError::AlreadyExists(_) => keel_core::EngineError::processing(err.to_string()),
            QueueError::Storage(_) => keel_core::EngineError::infrastructure(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub manual_review: usize,
    pub dead_lettered: usize,
}

pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: PostingJob) -> Result<JobId, QueueError>;

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<PostingJob>, QueueError>;

    fn update(&self, job: &PostingJob) -> Result<(), QueueError>;

    /// Claim the oldest due job (optionally tenant-filtered), marking it
    /// running. Returns `None` when nothing is due.
    fn claim_next(&self, tenant_id: Option<TenantId>) -> Result<Option<PostingJob>, QueueError>;

    fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueError>;
}

impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    fn enqueue(&self, job: PostingJob) -> Result<JobId, QueueError> {
        (**self).enqueue(job)
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<PostingJob>, QueueError> {
        (**self).get(tenant_id, job_id)
    }

    fn update(&self, job: &PostingJob) -> Result<(), QueueError> {
        (**self).update(job)
    }

    fn claim_next(&self, tenant_id: Option<TenantId>) -> Result<Option<PostingJob>, QueueError> {
        (**self).claim_next(tenant_id)
    }

    fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueError> {
        (**self).stats(tenant_id)
    }
}

/// In-memory job queue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    jobs: RwLock<HashMap<JobId, PostingJob>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: PostingJob) -> Result<JobId, QueueError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| QueueError::Storage("lock poisoned".to_string()))?;
        if jobs.contains_key(&job.id) {
            return Err(QueueError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<PostingJob>, QueueError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| QueueError::Storage("lock poisoned".to_string()))?;
        match jobs.get(&job_id) {
            Some(j) if j.tenant_id == tenant_id => Ok(Some(j.clone())),
            Some(_) => Err(QueueError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn update(&self, job: &PostingJob) -> Result<(), QueueError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| QueueError::Storage("lock poisoned".to_string()))?;
        if !jobs.contains_key(&job.id) {
            return Err(QueueError::NotFound(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn claim_next(&self, tenant_id: Option<TenantId>) -> Result<Option<PostingJob>, QueueError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| QueueError::Storage("lock poisoned".to_string()))?;
        let now = Utc::now();

        let next = jobs
            .values()
            .filter(|j| j.is_due(now) && tenant_id.is_none_or(|t| j.tenant_id == t))
            .min_by_key(|j| (j.created_at, j.id.as_uuid().as_u128()))
            .map(|j| j.id);

        if let Some(job_id) = next {
            if let Some(job) = jobs.get_mut(&job_id) {
                job.mark_running();
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| QueueError::Storage("lock poisoned".to_string()))?;
        let mut stats = QueueStats::default();
        for job in jobs.values().filter(|j| j.tenant_id == tenant_id) {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed { .. } => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::ManualReview { .. } => stats.manual_review += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }
}
