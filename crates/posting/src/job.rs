//! Persisted posting jobs.
//!
//! A retry is not a requeued broker message with header-encoded attempt
//! counts: it is this record with its attempt field incremented and
//! `scheduled_at` pushed out by the backoff schedule. The queue's poller
//! releases a job only once it is due.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::{DocumentId, EngineError, ErrorClass, JobId, TenantId, UserId};
use keel_resilience::RetryPolicy;

/// Terminal result of a successful posting attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PostingOutcome {
    /// Ledger entries were written.
    Posted { entries: usize },
    /// A high-confidence duplicate of an already-posted document; nothing
    /// was written.
    DuplicateSkipped { matched_document: DocumentId },
    /// The document was already in a terminal state; no-op.
    AlreadyPosted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobStatus {
    /// Waiting to be claimed (or waiting out a backoff delay).
    Pending,
    Running,
    Completed {
        outcome: PostingOutcome,
    },
    /// Failed but will be retried once `scheduled_at` passes.
    Failed {
        error: String,
        class: ErrorClass,
        attempt: u32,
    },
    /// Validation-class failure parked for a human; zero retries.
    ManualReview {
        error: String,
    },
    /// Retries exhausted; routed to the dead-letter queue.
    DeadLettered {
        error: String,
        attempts: u32,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed { .. }
                | JobStatus::ManualReview { .. }
                | JobStatus::DeadLettered { .. }
        )
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed { .. })
    }
}

/// One execution attempt, kept for the dead-letter error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub class: Option<ErrorClass>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingJob {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub actor_id: UserId,
    /// Attempts started so far (incremented on claim).
    pub attempt: u32,
    pub status: JobStatus,
    /// Earliest time the job may be claimed again.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub history: Vec<JobAttemptRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PostingJob {
    pub fn new(tenant_id: TenantId, document_id: DocumentId, actor_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            tenant_id,
            document_id,
            actor_id,
            attempt: 0,
            status: JobStatus::Pending,
            scheduled_at: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the job may be claimed now (claimable and past any backoff).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable()
            && match self.scheduled_at {
                Some(at) => now >= at,
                None => true,
            }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self, outcome: PostingOutcome, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.status = JobStatus::Completed { outcome };
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: true,
            error: None,
            class: None,
        });
    }

    /// Record a failure and transition per the error's class and policy:
    /// validation parks in manual review, otherwise retry with backoff
    /// until attempts are exhausted, then dead-letter.
    pub fn mark_failed(
        &mut self,
        error: &EngineError,
        policy: &RetryPolicy,
        started_at: DateTime<Utc>,
    ) {
        let now = Utc::now();
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: false,
            error: Some(error.to_string()),
            class: Some(error.class),
        });

        if error.class == ErrorClass::Validation {
            self.status = JobStatus::ManualReview {
                error: error.to_string(),
            };
        } else if policy.should_retry(self.attempt) {
            let delay = policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = JobStatus::Failed {
                error: error.to_string(),
                class: error.class,
                attempt: self.attempt,
            };
        } else {
            self.status = JobStatus::DeadLettered {
                error: error.to_string(),
                attempts: self.attempt,
            };
        }
    }

    /// Replayable message body for the dead-letter queue.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "tenant_id": self.tenant_id,
            "document_id": self.document_id,
            "actor_id": self.actor_id,
        })
    }

    /// Error text accumulated across attempts, oldest first.
    pub fn error_history(&self) -> Vec<String> {
        self.history
            .iter()
            .filter_map(|r| r.error.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn job() -> PostingJob {
        PostingJob::new(TenantId::new(), DocumentId::new(), UserId::new())
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(
            max_attempts,
            Duration::from_secs(1),
            Duration::from_secs(10),
            2.0,
        )
    }

    #[test]
    fn success_path_records_history() {
        let mut job = job();
        job.mark_running();
        assert_eq!(job.attempt, 1);

        job.mark_completed(PostingOutcome::Posted { entries: 2 }, Utc::now());
        assert!(job.status.is_terminal());
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
    }

    #[test]
    fn validation_failure_goes_straight_to_manual_review() {
        let mut job = job();
        job.mark_running();
        job.mark_failed(
            &EngineError::validation("no extracted fields"),
            &policy(5),
            Utc::now(),
        );

        assert!(matches!(job.status, JobStatus::ManualReview { .. }));
        // Not claimable again even though the policy allows retries.
        assert!(!job.is_due(Utc::now()));
    }

    #[test]
    fn transient_failure_schedules_a_backoff_retry() {
        let mut job = job();
        job.mark_running();
        job.mark_failed(&EngineError::integration("fx down"), &policy(3), Utc::now());

        match &job.status {
            JobStatus::Failed { class, attempt, .. } => {
                assert_eq!(*class, keel_core::ErrorClass::Integration);
                assert_eq!(*attempt, 1);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        // Backoff has not elapsed yet.
        assert!(!job.is_due(Utc::now()));
        assert!(job.is_due(Utc::now() + chrono::Duration::seconds(2)));
    }

    #[test]
    fn exhausted_retries_dead_letter_with_full_history() {
        let mut job = job();
        let policy = policy(2);

        for _ in 0..2 {
            job.mark_running();
            job.mark_failed(&EngineError::processing("busy"), &policy, Utc::now());
        }

        match &job.status {
            JobStatus::DeadLettered { attempts, .. } => assert_eq!(*attempts, 2),
            other => panic!("expected DeadLettered, got {other:?}"),
        }
        assert_eq!(job.error_history().len(), 2);
    }
}
