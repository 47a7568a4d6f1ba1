//! Terminal dead-letter queue.
//!
//! A dead letter carries everything an operator needs to replay or discard
//! the job without re-deriving context: the original payload, the
//! accumulated error history, the attempt count and the source service.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::{JobId, TenantId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    /// Original message body, replayable as-is.
    pub payload: serde_json::Value,
    /// Error text accumulated across attempts, oldest first.
    pub error_history: Vec<String>,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    pub source_service: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead letter not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("dead letter storage failure: {0}")]
    Storage(String),
}

/// Per-pipeline terminal queue.
pub trait DeadLetterQueue: Send + Sync {
    fn push(&self, letter: DeadLetter) -> Result<(), DeadLetterError>;

    fn list(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError>;

    /// Remove a letter for replay; the caller re-enqueues the payload.
    fn take(&self, tenant_id: TenantId, job_id: JobId) -> Result<DeadLetter, DeadLetterError>;

    /// Drop a letter after operator inspection.
    fn discard(&self, tenant_id: TenantId, job_id: JobId) -> Result<(), DeadLetterError>;
}

/// In-memory dead-letter queue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterQueue {
    letters: RwLock<HashMap<JobId, DeadLetter>>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeadLetterQueue for InMemoryDeadLetterQueue {
    fn push(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        let mut letters = self
            .letters
            .write()
            .map_err(|_| DeadLetterError::Storage("lock poisoned".to_string()))?;
        letters.insert(letter.job_id, letter);
        Ok(())
    }

    fn list(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let letters = self
            .letters
            .read()
            .map_err(|_| DeadLetterError::Storage("lock poisoned".to_string()))?;
        let mut result: Vec<_> = letters
            .values()
            .filter(|l| l.tenant_id == tenant_id)
            .cloned()
            .collect();
        result.sort_by_key(|l| l.failed_at);
        result.truncate(limit);
        Ok(result)
    }

    fn take(&self, tenant_id: TenantId, job_id: JobId) -> Result<DeadLetter, DeadLetterError> {
        let mut letters = self
            .letters
            .write()
            .map_err(|_| DeadLetterError::Storage("lock poisoned".to_string()))?;
        match letters.get(&job_id) {
            Some(l) if l.tenant_id != tenant_id => Err(DeadLetterError::TenantIsolation),
            Some(_) => letters
                .remove(&job_id)
                .ok_or(DeadLetterError::NotFound(job_id)),
            None => Err(DeadLetterError::NotFound(job_id)),
        }
    }

    fn discard(&self, tenant_id: TenantId, job_id: JobId) -> Result<(), DeadLetterError> {
        self.take(tenant_id, job_id).map(|_| ())
    }
}
