//! Run orchestration.
//!
//! A run walks its pipeline one step at a time. Each step goes through the
//! resilience executor under the step handler's dependency name, and the
//! result code decides what happens next:
//!
//! - `ok` / `skipped`: advance (or wait for sign-off if the step asks for it)
//! - `retryable`: retried with backoff; exhaustion leaves the run at its cursor
//! - `fatal`: the run fails
//! - `blocked`: the run halts until an approval matching the content hash arrives

pub mod engine;
pub mod postgres;
pub mod run;
pub mod store;

pub use engine::{Orchestrator, OrchestratorError};
pub use postgres::PostgresRunStore;
pub use run::{AcceptedApproval, PendingApproval, RunRecord, RunReport, RunStatus, StepRecord, StepTiming};
pub use store::{InMemoryRunStore, RunStore, RunStoreError};
