use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use patchflow_core::{ErrorKind, JobId, RunId, TenantId};
use patchflow_infra::admission::{PlanTier, TenantConcurrencyState};
use patchflow_infra::jobs::{AttemptRecord, JobEnvelope, JobError, JobRecord, JobStatus, JobType};
use patchflow_infra::orchestrator::{PendingApproval, RunRecord, RunReport, RunStatus};
use patchflow_steps::{RunContext, StepType};

// -------------------------
// Request DTOs
// -------------------------

/// `POST /jobs`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueJobRequest {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub step_id: Option<StepType>,
    #[serde(default)]
    pub payload: JsonValue,
    pub idempotency_key: Option<String>,
    pub priority: Option<i32>,
    pub ordering_key: Option<String>,
    pub delay_until: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub source: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl EnqueueJobRequest {
    pub fn into_envelope(self, default_max_retries: u32) -> JobEnvelope {
        let mut envelope = JobEnvelope::new(self.tenant_id, self.run_id, self.job_type, self.payload)
            .with_max_retries(self.max_retries.unwrap_or(default_max_retries))
            .with_source(self.source.unwrap_or_else(|| "api".to_string()));
        if let Some(step) = self.step_id {
            envelope = envelope.with_step(step);
        }
        if let Some(key) = self.idempotency_key {
            envelope = envelope.with_idempotency_key(key);
        }
        if let Some(priority) = self.priority {
            envelope = envelope.with_priority(priority);
        }
        if let Some(key) = self.ordering_key {
            envelope = envelope.with_ordering_key(key);
        }
        if let Some(at) = self.delay_until {
            envelope = envelope.scheduled_at(at);
        }
        if let Some(deadline) = self.deadline {
            envelope = envelope.with_deadline(deadline);
        }
        if let (Some(trace_id), Some(span_id)) = (self.trace_id, self.span_id) {
            envelope = envelope.with_trace(trace_id, span_id);
        }
        envelope
    }
}

/// `POST /runs`. The tenant comes from the header.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateRunRequest {
    /// Defaults to a fresh id.
    pub run_id: Option<RunId>,
    /// Defaults to the full six-step pipeline.
    pub pipeline: Option<Vec<StepType>>,
    pub context: RunContext,
    pub idempotency_key: Option<String>,
    pub priority: Option<i32>,
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub approved_by: String,
    pub content_hash: String,
    pub comment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReasonRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    pub plan: PlanTier,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptView {
    pub attempt_number: u32,
    pub failed_at: DateTime<Utc>,
    pub error_kind: ErrorKind,
    pub error_message: String,
}

impl From<&AttemptRecord> for AttemptView {
    fn from(a: &AttemptRecord) -> Self {
        Self {
            attempt_number: a.attempt_number,
            failed_at: a.failed_at,
            error_kind: a.error_kind,
            error_message: a.error_message.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorView {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&JobError> for ErrorView {
    fn from(e: &JobError) -> Self {
        Self {
            kind: e.kind,
            message: e.message.clone(),
            retry_after_ms: e.retry_after().map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepType>,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_retries: u32,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub previous_attempts: Vec<AttemptView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,
    pub reclaim_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&JobRecord> for JobView {
    fn from(job: &JobRecord) -> Self {
        let env = &job.envelope;
        Self {
            job_id: env.job_id,
            tenant_id: env.tenant_id,
            run_id: env.run_id,
            step_id: env.step_id,
            job_type: env.job_type,
            status: job.status,
            attempt: env.attempt,
            max_retries: env.max_retries,
            priority: env.priority,
            idempotency_key: env.idempotency_key.clone(),
            previous_attempts: env.previous_attempts.iter().map(AttemptView::from).collect(),
            last_error: job.last_error.as_ref().map(ErrorView::from),
            result: job.result.clone(),
            claimed_by: job.claimed_by.as_ref().map(|w| w.as_str().to_string()),
            lease_expires_at: job.lease_expires_at,
            delay_until: env.delay_until,
            reclaim_count: job.reclaim_count,
            created_at: env.created_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApprovalView {
    pub step_index: usize,
    pub step_type: StepType,
    pub content_hash: String,
    pub rerun_step: bool,
}

impl From<&PendingApproval> for PendingApprovalView {
    fn from(p: &PendingApproval) -> Self {
        Self {
            step_index: p.step_index,
            step_type: p.step_type,
            content_hash: p.content_hash.clone(),
            rerun_step: p.rerun_step,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub status: RunStatus,
    pub pipeline: Vec<StepType>,
    pub cursor: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<StepType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApprovalView>,
    pub approvals: usize,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub report: RunReport,
}

impl From<&RunRecord> for RunView {
    fn from(run: &RunRecord) -> Self {
        Self {
            run_id: run.run_id,
            tenant_id: run.tenant_id,
            status: run.status,
            pipeline: run.pipeline.steps().to_vec(),
            cursor: run.cursor,
            current_step: run.current_step(),
            pending_approval: run.pending_approval.as_ref().map(PendingApprovalView::from),
            approvals: run.approvals.len(),
            version: run.version,
            created_at: run.created_at,
            updated_at: run.updated_at,
            report: run.report(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConcurrencyView {
    pub tenant_id: TenantId,
    pub plan: PlanTier,
    pub plan_limit: u32,
    pub in_flight_count: u32,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_changed_at: Option<DateTime<Utc>>,
}

impl From<&TenantConcurrencyState> for TenantConcurrencyView {
    fn from(s: &TenantConcurrencyState) -> Self {
        Self {
            tenant_id: s.tenant_id,
            plan: s.plan,
            plan_limit: s.plan_limit,
            in_flight_count: s.in_flight_count,
            status: s.status.as_str().to_string(),
            status_reason: s.status_reason.clone(),
            status_changed_at: s.status_changed_at,
        }
    }
}
