//! `keel-posting` — the durable posting pipeline.
//!
//! Turns classified documents into balanced ledger entries: persisted
//! posting jobs, the duplicate detector guarding the pipeline, and the
//! worker plus its polling consumer loop.

pub mod duplicate;
pub mod job;
pub mod queue;
pub mod worker;

pub use duplicate::{DuplicateClass, DuplicateDetector, DuplicateMatch, SignalScores};
pub use job::{JobAttemptRecord, JobStatus, PostingJob, PostingOutcome};
pub use queue::{InMemoryJobQueue, JobQueue, QueueError, QueueStats};
pub use worker::{
    ConsumerConfig, ConsumerHandle, ConsumerStats, GuardedRateSource, PostingConsumer,
    PostingWorker,
};
