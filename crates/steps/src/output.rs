use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use patchflow_core::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Outcome class of a step execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    /// Step succeeded; advance.
    Ok,
    /// Transient failure; retry with backoff.
    Retryable,
    /// Unrecoverable; abort the run.
    Fatal,
    /// Halted until an external approval arrives.
    Blocked,
    /// Nothing to do; advance without side effects.
    Skipped,
}

/// Error detail attached to non-ok outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
    /// Dependency-provided hint, overrides computed backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

/// Wall-clock breakdown of a step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Timing {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Named sub-phases (e.g. `model_call`, `git_push`) in milliseconds.
    #[serde(default)]
    pub phases: BTreeMap<String, u64>,
}

/// Resource usage reported by a step.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CostAccounting {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Cost in millionths of a US dollar.
    pub usd_micros: u64,
}

impl CostAccounting {
    pub fn add(&mut self, other: &CostAccounting) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.usd_micros += other.usd_micros;
    }
}

/// Something a step produced (patch, log, test report).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub kind: String,
    pub uri: String,
}

/// Output envelope returned by a step handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub result_code: ResultCode,
    pub summary: String,
    /// Step-specific structured payload; the approval content hash covers this.
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub cost: CostAccounting,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

/// A handler returned an output that breaks the contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("retryable output must carry error detail")]
    RetryableWithoutError,

    #[error("fatal output must carry error detail")]
    FatalWithoutError,

    #[error("successful output carries an error: {0}")]
    OkWithError(String),
}

impl StepOutput {
    fn with_code(result_code: ResultCode, summary: impl Into<String>) -> Self {
        Self {
            result_code,
            summary: summary.into(),
            data: JsonValue::Null,
            timing: Timing::default(),
            cost: CostAccounting::default(),
            artifacts: Vec::new(),
            requires_approval: false,
            error: None,
        }
    }

    pub fn ok(summary: impl Into<String>) -> Self {
        Self::with_code(ResultCode::Ok, summary)
    }

    pub fn skipped(summary: impl Into<String>) -> Self {
        Self::with_code(ResultCode::Skipped, summary)
    }

    pub fn blocked(summary: impl Into<String>) -> Self {
        Self::with_code(ResultCode::Blocked, summary)
    }

    pub fn retryable(error: StepError) -> Self {
        let mut out = Self::with_code(ResultCode::Retryable, error.message.clone());
        out.error = Some(error);
        out
    }

    pub fn fatal(error: StepError) -> Self {
        let mut out = Self::with_code(ResultCode::Fatal, error.message.clone());
        out.error = Some(error);
        out
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = data;
        self
    }

    pub fn with_cost(mut self, cost: CostAccounting) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Check the envelope against the result-code rules.
    pub fn validate(&self) -> Result<(), ContractViolation> {
        match (self.result_code, &self.error) {
            (ResultCode::Retryable, None) => Err(ContractViolation::RetryableWithoutError),
            (ResultCode::Fatal, None) => Err(ContractViolation::FatalWithoutError),
            (ResultCode::Ok | ResultCode::Skipped, Some(err)) => {
                Err(ContractViolation::OkWithError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Whether the pipeline moves past this step.
    pub fn advances(&self) -> bool {
        matches!(self.result_code, ResultCode::Ok | ResultCode::Skipped)
    }
}
