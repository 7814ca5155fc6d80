use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use patchflow_core::{DomainError, RunId, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::approval::ApprovalRecord;
use crate::output::StepOutput;

/// One stage of the issue → pull request pipeline.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Triage,
    Plan,
    Code,
    Test,
    Review,
    Apply,
}

impl StepType {
    pub const ALL: [StepType; 6] = [
        StepType::Triage,
        StepType::Plan,
        StepType::Code,
        StepType::Test,
        StepType::Review,
        StepType::Apply,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Triage => "triage",
            StepType::Plan => "plan",
            StepType::Code => "code",
            StepType::Test => "test",
            StepType::Review => "review",
            StepType::Apply => "apply",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown step type: {s}")))
    }
}

/// How much autonomy a run has.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskMode {
    /// Steps may propose changes; a human approves before anything is applied.
    #[default]
    Supervised,
    /// Steps may apply changes without approval unless they ask for it.
    Autonomous,
}

/// Repository/issue context shared by every step of a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunContext {
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub issue: Option<String>,
    #[serde(default)]
    pub risk_mode: RiskMode,
    /// Anything else the producer attached (labels, base branch, ...).
    #[serde(default)]
    pub extra: JsonValue,
}

/// Input envelope handed to a step handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub step_type: StepType,
    pub context: RunContext,
    /// Output of the previous step in the pipeline, if any.
    pub prior_output: Option<StepOutput>,
    /// 1-based attempt number of this step within the current job execution.
    pub attempt: u32,
    pub deadline: Option<DateTime<Utc>>,
    /// Present when a blocked step is re-run after approval.
    pub approval: Option<ApprovalRecord>,
}

impl StepInput {
    pub fn new(run_id: RunId, tenant_id: TenantId, step_type: StepType, context: RunContext) -> Self {
        Self {
            run_id,
            tenant_id,
            step_type,
            context,
            prior_output: None,
            attempt: 1,
            deadline: None,
            approval: None,
        }
    }

    pub fn with_prior_output(mut self, prior: Option<StepOutput>) -> Self {
        self.prior_output = prior;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<DateTime<Utc>>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_approval(mut self, approval: Option<ApprovalRecord>) -> Self {
        self.approval = approval;
        self
    }

    pub fn risk_mode(&self) -> RiskMode {
        self.context.risk_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_type_parses_from_wire_name() {
        for t in StepType::ALL {
            assert_eq!(t.as_str().parse::<StepType>().unwrap(), t);
        }
        assert!("deploy".parse::<StepType>().is_err());
    }

    #[test]
    fn run_context_defaults_to_supervised() {
        let ctx: RunContext = serde_json::from_value(serde_json::json!({
            "repository": "acme/widgets"
        }))
        .unwrap();
        assert_eq!(ctx.risk_mode, RiskMode::Supervised);
        assert_eq!(ctx.issue, None);
    }
}
