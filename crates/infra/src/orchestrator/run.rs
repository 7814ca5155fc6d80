//! Persisted run state and the report derived from it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use patchflow_core::{DomainError, RunId, TenantId};
use patchflow_steps::{
    ApprovalRecord, Artifact, CostAccounting, Pipeline, ResultCode, RunContext, StepError, StepOutput,
    StepType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    /// A step succeeded but asked for sign-off before the run moves on.
    AwaitingApproval,
    /// A step cannot proceed without external approval; it is re-run once approved.
    Blocked,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Halted until someone approves.
    pub fn is_waiting(self) -> bool {
        matches!(self, RunStatus::AwaitingApproval | RunStatus::Blocked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::AwaitingApproval => "awaiting_approval",
            RunStatus::Blocked => "blocked",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "awaiting_approval" => Ok(RunStatus::AwaitingApproval),
            "blocked" => Ok(RunStatus::Blocked),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(DomainError::validation(format!("unknown run status: {other}"))),
        }
    }
}

/// One executed step (a blocked step that is re-run appears twice).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_index: usize,
    pub step_type: StepType,
    pub output: StepOutput,
    /// Attempts spent inside the resilience executor.
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

/// What an approver has to sign off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub step_index: usize,
    pub step_type: StepType,
    /// SHA-256 of the step's output data.
    pub content_hash: String,
    /// `true` for blocked steps, which run again with the approval attached.
    pub rerun_step: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedApproval {
    pub step_index: usize,
    pub step_type: StepType,
    pub record: ApprovalRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub pipeline: Pipeline,
    pub context: RunContext,
    pub status: RunStatus,
    /// Index of the next step to execute.
    pub cursor: usize,
    pub steps: Vec<StepRecord>,
    pub pending_approval: Option<PendingApproval>,
    pub approvals: Vec<AcceptedApproval>,
    pub error: Option<StepError>,
    /// Bumped by every successful save; 0 until first persisted.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(
        run_id: RunId,
        tenant_id: TenantId,
        pipeline: Pipeline,
        context: RunContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            tenant_id,
            pipeline,
            context,
            status: RunStatus::Pending,
            cursor: 0,
            steps: Vec::new(),
            pending_approval: None,
            approvals: Vec::new(),
            error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current_step(&self) -> Option<StepType> {
        self.pipeline.get(self.cursor)
    }

    /// Output of the step before the cursor, fed to the next step.
    pub fn prior_output(&self) -> Option<&StepOutput> {
        let prev = self.cursor.checked_sub(1)?;
        self.steps
            .iter()
            .rev()
            .find(|s| s.step_index == prev)
            .map(|s| &s.output)
    }

    /// Latest approval given for the step at the cursor.
    pub fn approval_for_cursor(&self) -> Option<&ApprovalRecord> {
        self.approvals
            .iter()
            .rev()
            .find(|a| a.step_index == self.cursor)
            .map(|a| &a.record)
    }

    pub fn report(&self) -> RunReport {
        RunReport::from_run(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTiming {
    pub step_type: StepType,
    pub result_code: ResultCode,
    pub duration_ms: u64,
    pub attempts: u32,
}

/// Summary of a run: per-step timings, total duration, summed cost, artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub status: RunStatus,
    pub steps: Vec<StepTiming>,
    pub total_duration_ms: u64,
    pub cost: CostAccounting,
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApproval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl RunReport {
    pub fn from_run(run: &RunRecord) -> Self {
        let mut cost = CostAccounting::default();
        let mut artifacts = Vec::new();
        let mut total_duration_ms = 0u64;
        let steps = run
            .steps
            .iter()
            .map(|s| {
                cost.add(&s.output.cost);
                artifacts.extend(s.output.artifacts.iter().cloned());
                total_duration_ms = total_duration_ms.saturating_add(s.output.timing.duration_ms);
                StepTiming {
                    step_type: s.step_type,
                    result_code: s.output.result_code,
                    duration_ms: s.output.timing.duration_ms,
                    attempts: s.attempts,
                }
            })
            .collect();

        Self {
            run_id: run.run_id,
            tenant_id: run.tenant_id,
            status: run.status,
            steps,
            total_duration_ms,
            cost,
            artifacts,
            pending_approval: run.pending_approval.clone(),
            error: run.error.clone(),
        }
    }
}
