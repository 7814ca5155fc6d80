//! Domain error model and the failure taxonomy shared by every component.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only (validation, invariants, conflicts).
/// Storage and transport failures live in the component error enums.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed envelope).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A state-machine invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("not found")]
    NotFound,

    /// A conflict occurred (e.g. stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    /// Classification of this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Conflict(_) => ErrorKind::Transient,
            DomainError::Validation(_) | DomainError::InvalidId(_) => ErrorKind::Validation,
            DomainError::InvariantViolation(_) | DomainError::NotFound => ErrorKind::Fatal,
        }
    }
}

/// Failure classes that drive retry, dead-letter and re-delay decisions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input. Never retried.
    Validation,
    /// Network failures, timeouts, rate limits. Retried with backoff.
    Transient,
    /// Unrecoverable. The run is aborted.
    Fatal,
    /// Concurrency limit or paused tenant. Re-delayed without consuming an attempt.
    Capacity,
    /// The job or step deadline passed. Terminal.
    DeadlineExceeded,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Capacity => "capacity",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(ErrorKind::Validation),
            "transient" => Ok(ErrorKind::Transient),
            "fatal" => Ok(ErrorKind::Fatal),
            "capacity" => Ok(ErrorKind::Capacity),
            "deadline_exceeded" => Ok(ErrorKind::DeadlineExceeded),
            other => Err(DomainError::validation(format!("unknown error kind: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        for kind in [
            ErrorKind::Validation,
            ErrorKind::Fatal,
            ErrorKind::Capacity,
            ErrorKind::DeadlineExceeded,
        ] {
            assert!(!kind.is_retryable(), "{kind} must not be retried");
        }
    }

    #[test]
    fn kind_string_form_parses_back() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::Transient,
            ErrorKind::Fatal,
            ErrorKind::Capacity,
            ErrorKind::DeadlineExceeded,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
            assert_eq!(serde_json::to_value(kind).unwrap(), serde_json::json!(kind.as_str()));
        }
    }

    #[test]
    fn conflicts_classify_as_transient() {
        assert_eq!(DomainError::conflict("stale").kind(), ErrorKind::Transient);
        assert_eq!(DomainError::validation("bad").kind(), ErrorKind::Validation);
    }
}
