//! The posting worker and its polling consumer loop.
//!
//! `PostingWorker::post_document` is the pipeline: lock the document,
//! re-check its status, screen for duplicates, validate extracted fields,
//! convert to the tenant's base currency, build a balanced transaction
//! group and append it atomically. `PostingConsumer` drives the worker off
//! the durable job queue, one claimed job at a time, and routes terminal
//! failures to the dead-letter queue.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};

use keel_core::{
    CurrencyCode, DocumentId, EngineError, EngineResult, Money, TenantId, UserId,
};
use keel_ledger::{
    Document, DocumentLocks, DocumentStatus, DocumentStore, ExtractedFields, FxResolver,
    LedgerStore, LedgerStoreError, RateSource, TenantDirectory, TransactionGroup,
};
use keel_resilience::{
    CircuitBreaker, CircuitKey, CircuitStateStore, CircuitThresholds, DeadLetter, DeadLetterQueue,
    RetryPolicies,
};

use crate::duplicate::{DuplicateClass, DuplicateDetector};
use crate::job::{JobStatus, PostingJob, PostingOutcome};
use crate::queue::JobQueue;

const DEFAULT_EXPENSE_ACCOUNT: (&str, &str) = ("6000", "General Expenses");
const DEFAULT_PAYABLE_ACCOUNT: (&str, &str) = ("2100", "Accounts Payable");
const TAX_ACCOUNT: (&str, &str) = ("1400", "Tax Receivable");

const SOURCE_SERVICE: &str = "posting";

/// [`RateSource`] guarded by the shared circuit breaker.
///
/// While the fx circuit is open, lookups fail fast with an
/// integration-class error and never reach the upstream provider.
pub struct GuardedRateSource {
    inner: Arc<dyn RateSource>,
    breaker: CircuitBreaker,
    key: CircuitKey,
}

impl GuardedRateSource {
    pub fn new(
        inner: Arc<dyn RateSource>,
        circuit_store: Arc<dyn CircuitStateStore>,
        thresholds: CircuitThresholds,
    ) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(circuit_store, thresholds),
            key: CircuitKey::new("fx", "rates"),
        }
    }
}

impl RateSource for GuardedRateSource {
    fn rate(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
    ) -> EngineResult<Decimal> {
        self.breaker
            .call(&self.key, || self.inner.rate(from, to, date))
    }
}

/// Executes posting jobs: one document in, one balanced entry set out.
pub struct PostingWorker {
    documents: Arc<dyn DocumentStore>,
    ledger: Arc<dyn LedgerStore>,
    tenants: Arc<dyn TenantDirectory>,
    fx: FxResolver,
    duplicates: DuplicateDetector,
    locks: Arc<DocumentLocks>,
}

impl PostingWorker {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        ledger: Arc<dyn LedgerStore>,
        tenants: Arc<dyn TenantDirectory>,
        fx: FxResolver,
        locks: Arc<DocumentLocks>,
    ) -> Self {
        let duplicates = DuplicateDetector::new(documents.clone());
        Self {
            documents,
            ledger,
            tenants,
            fx,
            duplicates,
            locks,
        }
    }

    /// Post one document, exactly once.
    ///
    /// Holds the per-document lock for the whole attempt; a concurrent
    /// attempt for the same document blocks here and then observes the
    /// terminal status the first one wrote.
    pub fn post_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        actor_id: UserId,
    ) -> EngineResult<PostingOutcome> {
        let _guard = self.locks.acquire(document_id);

        let document = self
            .documents
            .get(tenant_id, document_id)?
            .ok_or_else(|| EngineError::validation(format!("document not found: {document_id}")))?;

        if document.status.is_terminal() {
            info!(%tenant_id, %document_id, status = ?document.status, "document already settled");
            return Ok(PostingOutcome::AlreadyPosted);
        }

        self.documents
            .set_status(tenant_id, document_id, DocumentStatus::Processing, None)?;

        if let Some(duplicate) = self.posted_duplicate_of(tenant_id, document_id)? {
            self.documents.set_status(
                tenant_id,
                document_id,
                DocumentStatus::DuplicateSkipped,
                None,
            )?;
            info!(%tenant_id, %document_id, matched = %duplicate, "skipped duplicate document");
            return Ok(PostingOutcome::DuplicateSkipped {
                matched_document: duplicate,
            });
        }

        let fields = document.extracted.as_ref().ok_or_else(|| {
            EngineError::validation(format!("document {document_id} has no extracted fields"))
        })?;

        let group = self.build_group(&document, fields, actor_id)?;
        let entries = group.entries().len();

        match self.ledger.append_transaction(&group) {
            Ok(()) => {}
            // Lost a race that the status check could not see (e.g. a
            // replayed dead letter for a document another path settled).
            Err(LedgerStoreError::DocumentAlreadyPosted(_)) => {
                self.documents
                    .set_status(tenant_id, document_id, DocumentStatus::Posted, None)?;
                return Ok(PostingOutcome::AlreadyPosted);
            }
            Err(e) => return Err(e.into()),
        }

        self.documents
            .set_status(tenant_id, document_id, DocumentStatus::Posted, None)?;
        info!(%tenant_id, %document_id, entries, "posted document");
        Ok(PostingOutcome::Posted { entries })
    }

    /// The posted document this one exactly duplicates, if any.
    fn posted_duplicate_of(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> EngineResult<Option<DocumentId>> {
        Ok(self
            .duplicates
            .find_duplicates(tenant_id, document_id)?
            .into_iter()
            .find(|m| {
                m.class == DuplicateClass::Exact && m.document_status == DocumentStatus::Posted
            })
            .map(|m| m.document_id))
    }

    /// Build the balanced group in the tenant's base currency.
    fn build_group(
        &self,
        document: &Document,
        fields: &ExtractedFields,
        actor_id: UserId,
    ) -> EngineResult<TransactionGroup> {
        let base = self.tenants.base_currency(document.tenant_id)?;
        let date = fields.transaction_date;

        let total = self
            .fx
            .convert(&Money::new(fields.total, fields.currency.clone()), &base, date)?;
        let tax = match fields.tax_amount {
            Some(tax) if tax > Decimal::ZERO => Some(
                self.fx
                    .convert(&Money::new(tax, fields.currency.clone()), &base, date)?,
            ),
            _ => None,
        };

        let description = match &fields.invoice_number {
            Some(invoice) => format!("{} invoice {invoice}", fields.vendor),
            None => format!("{} ({})", fields.vendor, document.filename),
        };

        let (expense_code, expense_name) = match &fields.debit_account {
            Some(code) => (code.clone(), code.clone()),
            None => (
                DEFAULT_EXPENSE_ACCOUNT.0.to_string(),
                DEFAULT_EXPENSE_ACCOUNT.1.to_string(),
            ),
        };
        let (payable_code, payable_name) = match &fields.credit_account {
            Some(code) => (code.clone(), code.clone()),
            None => (
                DEFAULT_PAYABLE_ACCOUNT.0.to_string(),
                DEFAULT_PAYABLE_ACCOUNT.1.to_string(),
            ),
        };

        let mut builder = TransactionGroup::builder(
            document.tenant_id,
            document.id,
            actor_id,
            base,
            date,
        )
        .reference(fields.invoice_number.clone());

        builder = match &tax {
            Some(tax) => builder
                .debit(
                    expense_code,
                    expense_name,
                    total.amount - tax.amount,
                    None,
                    description.clone(),
                )
                .debit(
                    TAX_ACCOUNT.0,
                    TAX_ACCOUNT.1,
                    tax.amount,
                    Some(tax.amount),
                    description.clone(),
                ),
            None => builder.debit(expense_code, expense_name, total.amount, None, description.clone()),
        };

        builder
            .credit(payable_code, payable_name, total.amount, None, description)
            .build()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub processed: u64,
    pub completed: u64,
    pub retried: u64,
    pub manual_review: u64,
    pub dead_lettered: u64,
}

impl ConsumerStats {
    fn record(&mut self, status: &JobStatus) {
        self.processed += 1;
        match status {
            JobStatus::Completed { .. } => self.completed += 1,
            JobStatus::Failed { .. } => self.retried += 1,
            JobStatus::ManualReview { .. } => self.manual_review += 1,
            JobStatus::DeadLettered { .. } => self.dead_lettered += 1,
            JobStatus::Pending | JobStatus::Running => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Idle sleep between queue polls.
    pub poll_interval: Duration,
    /// Restrict claims to one tenant (dedicated consumers); `None` claims
    /// across tenants.
    pub tenant: Option<TenantId>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            tenant: None,
        }
    }
}

/// Claims one job at a time and runs it through the worker.
///
/// Prefetch of one on purpose: a slow posting never strands claimed work
/// behind it, and scaling out is just adding consumers.
pub struct PostingConsumer {
    queue: Arc<dyn JobQueue>,
    worker: Arc<PostingWorker>,
    documents: Arc<dyn DocumentStore>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    policies: RetryPolicies,
    config: ConsumerConfig,
}

impl PostingConsumer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        worker: Arc<PostingWorker>,
        documents: Arc<dyn DocumentStore>,
        dead_letters: Arc<dyn DeadLetterQueue>,
        policies: RetryPolicies,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            worker,
            documents,
            dead_letters,
            policies,
            config,
        }
    }

    /// Claim and run one due job. Returns the job's resulting status, or
    /// `None` when nothing was due.
    pub fn run_once(&self) -> EngineResult<Option<JobStatus>> {
        let mut job = match self.queue.claim_next(self.config.tenant)? {
            Some(job) => job,
            None => return Ok(None),
        };
        let started_at = Utc::now();

        match self
            .worker
            .post_document(job.tenant_id, job.document_id, job.actor_id)
        {
            Ok(outcome) => {
                job.mark_completed(outcome, started_at);
            }
            Err(e) => {
                let policy = self.policies.for_class(e.class);
                job.mark_failed(&e, policy, started_at);
                self.settle_failure(&job);
            }
        }

        self.queue.update(&job)?;
        Ok(Some(job.status.clone()))
    }

    /// Post-failure routing: park, retry or dead-letter, and reflect the
    /// terminal state on the document.
    fn settle_failure(&self, job: &PostingJob) {
        match &job.status {
            JobStatus::ManualReview { error } => {
                warn!(
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    document_id = %job.document_id,
                    error,
                    "posting parked for manual review"
                );
                // Validation failures are never silently dropped: besides
                // the document status, operators get a replayable letter.
                self.push_dead_letter(job);
                self.set_document_status(job, DocumentStatus::ManualReview, Some(error.clone()));
            }
            JobStatus::Failed { error, class, attempt } => {
                warn!(
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    %class,
                    attempt,
                    error,
                    "posting failed, retry scheduled"
                );
            }
            JobStatus::DeadLettered { error, attempts } => {
                error!(
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    document_id = %job.document_id,
                    attempts,
                    error,
                    "posting exhausted retries, dead-lettering"
                );
                self.push_dead_letter(job);
                self.set_document_status(job, DocumentStatus::Error, Some(error.clone()));
            }
            JobStatus::Pending | JobStatus::Running | JobStatus::Completed { .. } => {}
        }
    }

    fn push_dead_letter(&self, job: &PostingJob) {
        let letter = DeadLetter {
            job_id: job.id,
            tenant_id: job.tenant_id,
            payload: job.payload(),
            error_history: job.error_history(),
            attempts: job.attempt,
            failed_at: Utc::now(),
            source_service: SOURCE_SERVICE.to_string(),
        };
        if let Err(e) = self.dead_letters.push(letter) {
            error!(job_id = %job.id, error = %e, "failed to push dead letter");
        }
    }

    fn set_document_status(
        &self,
        job: &PostingJob,
        status: DocumentStatus,
        error_message: Option<String>,
    ) {
        if let Err(e) =
            self.documents
                .set_status(job.tenant_id, job.document_id, status, error_message)
        {
            warn!(
                job_id = %job.id,
                document_id = %job.document_id,
                error = %e,
                "failed to update document status"
            );
        }
    }

    /// Run the consumer on a dedicated thread until the handle is stopped.
    pub fn spawn(self: &Arc<Self>) -> ConsumerHandle {
        let consumer = Arc::clone(self);
        let stats = Arc::new(Mutex::new(ConsumerStats::default()));
        let thread_stats = Arc::clone(&stats);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let poll_interval = self.config.poll_interval;

        let thread = std::thread::spawn(move || {
            loop {
                // Drain everything due before going back to sleep.
                loop {
                    match consumer.run_once() {
                        Ok(Some(status)) => {
                            let mut stats =
                                thread_stats.lock().unwrap_or_else(|e| e.into_inner());
                            stats.record(&status);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!(error = %e, "consumer poll failed");
                            break;
                        }
                    }
                }
                match shutdown_rx.recv_timeout(poll_interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        });

        ConsumerHandle {
            shutdown_tx,
            thread,
            stats,
        }
    }
}

pub struct ConsumerHandle {
    shutdown_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl ConsumerHandle {
    pub fn stats(&self) -> ConsumerStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Signal shutdown and wait for the consumer thread to finish.
    pub fn stop(self) -> ConsumerStats {
        let _ = self.shutdown_tx.send(());
        let _ = self.thread.join();
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}
