//! Core job types: envelope, durable record, lifecycle.

use core::fmt;
use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use patchflow_core::{DomainError, DomainResult, ErrorKind, JobId, RunId, TenantId};
use patchflow_steps::{Pipeline, StepError, StepType};

/// Longest accepted idempotency / ordering key.
pub const MAX_KEY_LEN: usize = 255;

/// Job type for routing to the appropriate handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    StartRun,
    ResumeRun,
    ExecuteStep,
    RetryStep,
    Cleanup,
    Notify,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::StartRun,
        JobType::ResumeRun,
        JobType::ExecuteStep,
        JobType::RetryStep,
        JobType::Cleanup,
        JobType::Notify,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::StartRun => "start-run",
            JobType::ResumeRun => "resume-run",
            JobType::ExecuteStep => "execute-step",
            JobType::RetryStep => "retry-step",
            JobType::Cleanup => "cleanup",
            JobType::Notify => "notify",
        }
    }

    /// Job types that drive a run and therefore need a tenant admission slot.
    pub fn drives_run(self) -> bool {
        matches!(
            self,
            JobType::StartRun | JobType::ResumeRun | JobType::ExecuteStep | JobType::RetryStep
        )
    }

    fn requires_step(self) -> bool {
        matches!(self, JobType::ExecuteStep | JobType::RetryStep)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Leased by a worker, not started yet
    Claimed,
    /// Currently being executed
    Running,
    Completed,
    /// Terminal without retry (deadline exceeded)
    Failed,
    /// Retry budget exhausted or non-retryable; manual triage only
    DeadLetter,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Claimed,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::DeadLetter,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::DeadLetter
        )
    }

    /// Held under a worker lease.
    pub fn is_leased(self) -> bool {
        matches!(self, JobStatus::Claimed | JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Identity of a worker holding leases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classified failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl JobError {
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

    pub fn deadline_exceeded() -> Self {
        Self::new(ErrorKind::DeadlineExceeded, "deadline exceeded")
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<StepError> for JobError {
    fn from(err: StepError) -> Self {
        Self {
            kind: err.kind,
            message: err.message,
            retry_after_ms: err.retry_after_ms,
        }
    }
}

/// Record of a failed execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub failed_at: DateTime<Utc>,
    pub error_kind: ErrorKind,
    pub error_message: String,
}

/// Unit of work submitted by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepType>,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub payload: JsonValue,
    /// 1-based number of the current (or next) execution.
    pub attempt: u32,
    /// Total executions allowed.
    pub max_retries: u32,
    #[serde(default)]
    pub previous_attempts: Vec<AttemptRecord>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;

impl JobEnvelope {
    pub fn new(tenant_id: TenantId, run_id: RunId, job_type: JobType, payload: JsonValue) -> Self {
        Self {
            job_id: JobId::new(),
            tenant_id,
            run_id,
            step_id: None,
            job_type,
            payload,
            attempt: 1,
            max_retries: DEFAULT_MAX_RETRIES,
            previous_attempts: Vec::new(),
            priority: 0,
            ordering_key: None,
            deadline: None,
            delay_until: None,
            idempotency_key: None,
            created_at: Utc::now(),
            source: "internal".to_string(),
            trace_id: None,
            span_id: None,
        }
    }

    pub fn with_step(mut self, step: StepType) -> Self {
        self.step_id = Some(step);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Hold the job back until `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.delay_until = Some(at);
        self
    }

    /// Hold the job back for `delay` from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay_until = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// Reject malformed envelopes before they reach the store.
    pub fn validate(&self) -> DomainResult<()> {
        if self.max_retries == 0 {
            return Err(DomainError::validation("max_retries must be at least 1"));
        }
        if self.attempt == 0 || self.attempt > self.max_retries {
            return Err(DomainError::validation(format!(
                "attempt {} outside 1..={}",
                self.attempt, self.max_retries
            )));
        }
        check_key("idempotency_key", self.idempotency_key.as_deref())?;
        check_key("ordering_key", self.ordering_key.as_deref())?;
        if self.source.trim().is_empty() {
            return Err(DomainError::validation("source must not be empty"));
        }
        if !(self.payload.is_object() || self.payload.is_null()) {
            return Err(DomainError::validation("payload must be a JSON object"));
        }
        if self.job_type.requires_step() && self.step_id.is_none() {
            return Err(DomainError::validation(format!(
                "{} requires step_id",
                self.job_type
            )));
        }

        match self.job_type {
            JobType::StartRun => {
                if let Some(pipeline) = self.payload.get("pipeline").filter(|p| !p.is_null()) {
                    let names: Vec<String> = serde_json::from_value(pipeline.clone())
                        .map_err(|e| DomainError::validation(format!("pipeline: {e}")))?;
                    Pipeline::from_names(&names)?;
                }
                if let Some(context) = self.payload.get("context") {
                    serde_json::from_value::<patchflow_steps::RunContext>(context.clone())
                        .map_err(|e| DomainError::validation(format!("context: {e}")))?;
                }
            }
            JobType::Cleanup => {
                if let Some(retention) = self.payload.get("retention_secs") {
                    if !retention.as_u64().is_some_and(|s| s > 0) {
                        return Err(DomainError::validation(
                            "retention_secs must be a positive integer",
                        ));
                    }
                }
            }
            JobType::Notify => {
                if !self.payload.get("event").is_some_and(JsonValue::is_string) {
                    return Err(DomainError::validation("notify requires a string `event`"));
                }
            }
            JobType::ResumeRun | JobType::ExecuteStep | JobType::RetryStep => {}
        }
        Ok(())
    }
}

fn check_key(name: &str, key: Option<&str>) -> DomainResult<()> {
    match key {
        Some(k) if k.trim().is_empty() => {
            Err(DomainError::validation(format!("{name} must not be empty")))
        }
        Some(k) if k.len() > MAX_KEY_LEN => Err(DomainError::validation(format!(
            "{name} longer than {MAX_KEY_LEN} bytes"
        ))),
        _ => Ok(()),
    }
}

/// Durable job record: envelope plus lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub envelope: JobEnvelope,
    pub status: JobStatus,
    pub claimed_by: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<JobError>,
    pub result: Option<JsonValue>,
    /// Times the job was taken over after a lapsed lease.
    pub reclaim_count: u32,
    /// Store-assigned enqueue order.
    pub seq: u64,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(envelope: JobEnvelope, seq: u64, now: DateTime<Utc>) -> Self {
        Self {
            envelope,
            status: JobStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            heartbeat_at: None,
            lease_expires_at: None,
            last_error: None,
            result: None,
            reclaim_count: 0,
            seq,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.envelope.job_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.envelope.tenant_id
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_leased() && self.lease_expires_at.is_some_and(|at| at < now)
    }

    /// Pending and due, or leased by a worker whose lease lapsed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => self.envelope.delay_until.is_none_or(|at| at <= now),
            JobStatus::Claimed | JobStatus::Running => self.lease_expired(now),
            _ => false,
        }
    }

    pub fn is_held_by(&self, worker: &WorkerId) -> bool {
        self.status.is_leased() && self.claimed_by.as_ref() == Some(worker)
    }

    /// Take (or retake) the lease.
    pub fn mark_claimed(&mut self, worker: &WorkerId, lease: Duration, now: DateTime<Utc>) -> bool {
        let reclaimed = self.status.is_leased();
        if reclaimed {
            self.reclaim_count += 1;
        }
        self.status = JobStatus::Claimed;
        self.claimed_by = Some(worker.clone());
        self.claimed_at = Some(now);
        self.heartbeat_at = Some(now);
        self.lease_expires_at = Some(now + chrono_duration(lease));
        self.updated_at = now;
        reclaimed
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.updated_at = now;
    }

    pub fn extend_lease(&mut self, lease: Duration, now: DateTime<Utc>) {
        self.heartbeat_at = Some(now);
        self.lease_expires_at = Some(now + chrono_duration(lease));
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, result: JsonValue, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.finish(now);
    }

    /// Record the failure in history, then either requeue or dead-letter.
    ///
    /// `retry_delay` is `Some` when the failure is retryable and budget remains.
    pub fn mark_failed(&mut self, error: JobError, retry_delay: Option<Duration>, now: DateTime<Utc>) {
        self.envelope.previous_attempts.push(AttemptRecord {
            attempt_number: self.envelope.attempt,
            failed_at: now,
            error_kind: error.kind,
            error_message: error.message.clone(),
        });
        self.last_error = Some(error);

        match retry_delay {
            Some(delay) => {
                self.envelope.attempt += 1;
                self.envelope.delay_until = Some(now + chrono_duration(delay));
                self.release_lease(now);
                self.status = JobStatus::Pending;
            }
            None => {
                self.status = JobStatus::DeadLetter;
                self.finish(now);
            }
        }
    }

    /// Terminal without retry.
    pub fn mark_expired(&mut self, now: DateTime<Utc>) {
        self.last_error = Some(JobError::deadline_exceeded());
        self.status = JobStatus::Failed;
        self.finish(now);
    }

    /// Back to pending without consuming an attempt.
    pub fn mark_deferred(&mut self, until: DateTime<Utc>, now: DateTime<Utc>) {
        self.envelope.delay_until = Some(until);
        self.release_lease(now);
        self.status = JobStatus::Pending;
    }

    /// Explicit operator re-drive of a dead-lettered job. History is kept.
    pub fn mark_redriven(&mut self, now: DateTime<Utc>) {
        self.envelope.attempt = 1;
        self.envelope.delay_until = None;
        self.status = JobStatus::Pending;
        self.finished_at = None;
        self.release_lease(now);
    }

    fn release_lease(&mut self, now: DateTime<Utc>) {
        self.claimed_by = None;
        self.claimed_at = None;
        self.heartbeat_at = None;
        self.lease_expires_at = None;
        self.updated_at = now;
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.release_lease(now);
        self.finished_at = Some(now);
    }
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Result of job execution, returned by handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// Job completed; value is stored as the job result
    Success(JsonValue),
    /// Job failed; the error kind decides retry vs dead-letter
    Failure(JobError),
    /// Not now (capacity, duplicate in flight); does not consume an attempt
    Defer(Duration),
}

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying {
        next_attempt: u32,
        delay_until: DateTime<Utc>,
    },
    DeadLettered,
    Failed,
}

/// Outcome of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Extended { lease_expires_at: DateTime<Utc> },
    /// Another worker took the job over (or it already finished).
    LostLease,
}

/// A successfully claimed job.
#[derive(Debug, Clone, PartialEq)]
pub struct Claimed {
    pub job: JobRecord,
    /// The previous holder's lease had lapsed.
    pub reclaimed: bool,
}
