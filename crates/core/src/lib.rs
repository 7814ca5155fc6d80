//! `patchflow-core`: shared primitives for the job orchestration stack.
//!
//! Identifiers, the error taxonomy used to decide retry behaviour, and the
//! optimistic-concurrency expectation used by persisted run state. No IO.

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult, ErrorKind};
pub use id::{JobId, RunId, TenantId};
pub use version::ExpectedVersion;
