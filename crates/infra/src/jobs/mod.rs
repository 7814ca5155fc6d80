//! Durable job system: store, worker pool and built-in handlers.
//!
//! ## Lifecycle
//!
//! `pending -> claimed -> running -> completed | failed | dead_letter`
//!
//! - Claims are leases; a worker that stops heartbeating loses the job to the
//!   next claimer, which resumes from the last persisted run state
//! - A retryable failure returns the job to `pending` with backoff until its
//!   retry budget is spent, then it is dead-lettered with full history
//! - Capacity rejections and in-flight duplicates re-delay the job without
//!   consuming an attempt
//! - Dead letters leave the queue only through an explicit re-drive

pub mod handlers;
pub mod notify;
pub mod postgres;
pub mod store;
pub mod types;
pub mod worker;

pub use handlers::{CleanupPayload, JobHandlers, NotifyPayload, StartRunPayload};
pub use notify::{JobNotification, Notifier};
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    AttemptRecord, Claimed, FailOutcome, HeartbeatOutcome, JobEnvelope, JobError, JobRecord, JobResult,
    JobStatus, JobType, WorkerId,
};
pub use worker::{JobHandler, ProcessOutcome, Worker, WorkerConfig, WorkerError, WorkerPoolHandle, WorkerStats};
