use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use patchflow_core::{DomainError, ErrorKind, ExpectedVersion, RunId, TenantId};
use patchflow_steps::{
    content_hash, ApprovalRecord, Pipeline, ResultCode, RunContext, StepError, StepInput, StepOutput,
    StepRegistry, StepType,
};

use super::run::{AcceptedApproval, PendingApproval, RunRecord, RunReport, RunStatus, StepRecord};
use super::store::{RunStore, RunStoreError};
use crate::resilience::{ResilienceError, ResilienceExecutor, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error(transparent)]
    Store(#[from] RunStoreError),

    /// Retries exhausted or breaker open; the run stays at its cursor.
    #[error("step {step} unavailable: {error}")]
    StepUnavailable {
        step: StepType,
        error: StepError,
        retry_after: Option<Duration>,
    },

    #[error("deadline exceeded at step {step}")]
    DeadlineExceeded { step: StepType },

    #[error("approval rejected: {0}")]
    ApprovalRejected(String),

    #[error(transparent)]
    Validation(#[from] DomainError),
}

impl OrchestratorError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::StepUnavailable { .. } => ErrorKind::Transient,
            OrchestratorError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            OrchestratorError::Store(RunStoreError::Conflict { .. } | RunStoreError::Storage(_)) => {
                ErrorKind::Transient
            }
            OrchestratorError::Store(_)
            | OrchestratorError::RunNotFound(_)
            | OrchestratorError::ApprovalRejected(_)
            | OrchestratorError::Validation(_) => ErrorKind::Validation,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            OrchestratorError::StepUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Outcome of one pass of a step through the resilience executor.
enum Executed {
    Output { output: StepOutput, attempts: u32 },
    /// Fatal: abort the run.
    Aborted(StepError),
    Unavailable {
        error: StepError,
        retry_after: Option<Duration>,
    },
    DeadlineExceeded(StepError),
}

/// Drives runs through their pipeline.
///
/// The run is saved after every step with an exact version expectation, so
/// two workers racing on the same run cannot both record a step; the loser
/// gets a transient conflict and its job is retried against the new state.
pub struct Orchestrator {
    runs: Arc<dyn RunStore>,
    registry: StepRegistry,
    executor: ResilienceExecutor,
    step_policy: RetryPolicy,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("step_policy", &self.step_policy)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(runs: Arc<dyn RunStore>, registry: StepRegistry, executor: ResilienceExecutor) -> Self {
        Self {
            runs,
            registry,
            executor,
            step_policy: RetryPolicy::default(),
        }
    }

    pub fn with_step_policy(mut self, policy: RetryPolicy) -> Self {
        self.step_policy = policy;
        self
    }

    pub fn runs(&self) -> &Arc<dyn RunStore> {
        &self.runs
    }

    pub fn executor(&self) -> &ResilienceExecutor {
        &self.executor
    }

    /// Get or create the run. Re-delivered start jobs land on the existing record.
    pub fn create_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        pipeline: Pipeline,
        context: RunContext,
        now: DateTime<Utc>,
    ) -> Result<RunRecord, OrchestratorError> {
        if let Some(run) = self.runs.get(tenant_id, run_id)? {
            return Ok(run);
        }
        match self.runs.create(RunRecord::new(run_id, tenant_id, pipeline, context, now)) {
            Ok(run) => {
                info!(run_id = %run_id, tenant_id = %tenant_id, steps = run.pipeline.len(), "run created");
                Ok(run)
            }
            Err(RunStoreError::AlreadyExists(_)) => self.get_run(tenant_id, run_id),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_run(&self, tenant_id: TenantId, run_id: RunId) -> Result<RunRecord, OrchestratorError> {
        self.runs
            .get(tenant_id, run_id)?
            .ok_or(OrchestratorError::RunNotFound(run_id))
    }

    /// Execute steps from the cursor until the run finishes or halts.
    pub fn advance(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<RunReport, OrchestratorError> {
        self.drive(tenant_id, run_id, deadline, None)
    }

    /// Execute `step` only if it is the run's current step; otherwise a no-op.
    pub fn execute_step(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        step: StepType,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<RunReport, OrchestratorError> {
        self.drive(tenant_id, run_id, deadline, Some(step))
    }

    /// Accept an approval for the change the run is waiting on.
    #[instrument(skip(self, approval), fields(approved_by = %approval.approved_by), err)]
    pub fn approve(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        approval: ApprovalRecord,
    ) -> Result<RunRecord, OrchestratorError> {
        let mut run = self.get_run(tenant_id, run_id)?;
        let pending = match (&run.pending_approval, run.status.is_waiting()) {
            (Some(pending), true) => pending.clone(),
            _ => {
                return Err(OrchestratorError::ApprovalRejected(format!(
                    "run {run_id} is {} and not awaiting approval",
                    run.status
                )));
            }
        };
        if !approval.covers(&pending.content_hash) {
            return Err(OrchestratorError::ApprovalRejected(
                "content hash does not match the pending change".to_string(),
            ));
        }

        info!(
            target: "audit",
            run_id = %run_id,
            tenant_id = %tenant_id,
            step = %pending.step_type,
            approved_by = %approval.approved_by,
            content_hash = %pending.content_hash,
            "run approved"
        );
        run.approvals.push(AcceptedApproval {
            step_index: pending.step_index,
            step_type: pending.step_type,
            record: approval,
        });
        run.pending_approval = None;
        run.status = RunStatus::Running;
        run.updated_at = Utc::now();
        self.save(&run)
    }

    #[instrument(skip(self), fields(status), err)]
    fn drive(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        deadline: Option<DateTime<Utc>>,
        only: Option<StepType>,
    ) -> Result<RunReport, OrchestratorError> {
        let mut run = self.get_run(tenant_id, run_id)?;
        if run.status.is_terminal() || run.status.is_waiting() {
            debug!(status = %run.status, "run not runnable");
            return Ok(run.report());
        }
        if let Some(step) = only {
            if run.current_step() != Some(step) {
                debug!(requested = %step, current = ?run.current_step(), "stale step job");
                return Ok(run.report());
            }
        }
        if run.status == RunStatus::Pending {
            run.status = RunStatus::Running;
            run.updated_at = Utc::now();
            run = self.save(&run)?;
        }

        while let Some(step_type) = run.current_step() {
            let now = Utc::now();
            if deadline.is_some_and(|d| now >= d) {
                let error = StepError::new(ErrorKind::DeadlineExceeded, format!("deadline passed before {step_type}"));
                return Err(self.expire(run, step_type, error)?);
            }

            match self.execute_current(&run, step_type, deadline) {
                Executed::Output { output, attempts } => {
                    self.record_output(&mut run, step_type, output, attempts);
                    run = self.save(&run)?;
                    if run.status != RunStatus::Running {
                        break;
                    }
                }
                Executed::Aborted(error) => {
                    warn!(step = %step_type, error = %error, "run aborted");
                    run.status = RunStatus::Failed;
                    run.error = Some(error);
                    run.updated_at = Utc::now();
                    run = self.save(&run)?;
                    break;
                }
                Executed::Unavailable { error, retry_after } => {
                    warn!(step = %step_type, error = %error, "step unavailable, run left resumable");
                    return Err(OrchestratorError::StepUnavailable {
                        step: step_type,
                        error,
                        retry_after,
                    });
                }
                Executed::DeadlineExceeded(error) => {
                    return Err(self.expire(run, step_type, error)?);
                }
            }

            if only.is_some() {
                break;
            }
        }

        if run.status == RunStatus::Running && run.current_step().is_none() {
            run.status = RunStatus::Completed;
            run.updated_at = Utc::now();
            run = self.save(&run)?;
            info!(steps = run.steps.len(), "run completed");
        }

        tracing::Span::current().record("status", run.status.as_str());
        Ok(run.report())
    }

    fn execute_current(&self, run: &RunRecord, step_type: StepType, deadline: Option<DateTime<Utc>>) -> Executed {
        let Some(handler) = self.registry.get(step_type) else {
            return Executed::Aborted(StepError::fatal(format!("no handler registered for step {step_type}")));
        };

        let base = StepInput::new(run.run_id, run.tenant_id, step_type, run.context.clone())
            .with_prior_output(run.prior_output().cloned())
            .with_deadline(deadline)
            .with_approval(run.approval_for_cursor().cloned());
        let attempts = Cell::new(0u32);

        let result = self
            .executor
            .execute_until(handler.dependency(), &self.step_policy, deadline, |attempt| {
                attempts.set(attempt);
                let mut input = base.clone();
                input.attempt = attempt;

                let started_at = Utc::now();
                let clock = Instant::now();
                let mut output = handler.run(&input);
                let timing = &mut output.timing;
                if timing.started_at.is_none() {
                    timing.started_at = Some(started_at);
                }
                if timing.finished_at.is_none() {
                    timing.finished_at = Some(Utc::now());
                }
                if timing.duration_ms == 0 {
                    timing.duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
                }

                match (output.result_code, &output.error) {
                    // Retried whatever kind the detail names.
                    (ResultCode::Retryable, Some(error)) => Err(StepError {
                        kind: ErrorKind::Transient,
                        ..error.clone()
                    }),
                    _ => Ok(output),
                }
            });

        match result {
            Ok(output) => match output.validate() {
                Ok(()) => Executed::Output {
                    output,
                    attempts: attempts.get(),
                },
                Err(violation) => Executed::Aborted(StepError::fatal(format!(
                    "step {step_type} broke the output contract: {violation}"
                ))),
            },
            Err(ResilienceError::NonRetryable { error, .. }) => Executed::Aborted(error),
            Err(ResilienceError::DeadlineExceeded { last, .. }) => Executed::DeadlineExceeded(last),
            Err(err @ (ResilienceError::CircuitOpen { .. } | ResilienceError::Exhausted { .. })) => {
                let retry_after = err.retry_after();
                let error = err
                    .into_inner()
                    .unwrap_or_else(|| StepError::transient(format!("dependency {} unavailable", handler.dependency())));
                Executed::Unavailable { error, retry_after }
            }
        }
    }

    fn record_output(&self, run: &mut RunRecord, step_type: StepType, output: StepOutput, attempts: u32) {
        let now = Utc::now();
        let index = run.cursor;
        let code = output.result_code;
        let requires_approval = output.requires_approval;
        let hash = content_hash(&output.data);
        let error = output.error.clone();

        info!(
            step = %step_type,
            result_code = ?code,
            attempts,
            duration_ms = output.timing.duration_ms,
            "step finished"
        );
        run.steps.push(StepRecord {
            step_index: index,
            step_type,
            output,
            attempts,
            recorded_at: now,
        });
        run.updated_at = now;

        match code {
            ResultCode::Ok | ResultCode::Skipped => {
                run.cursor += 1;
                if requires_approval {
                    run.status = RunStatus::AwaitingApproval;
                    run.pending_approval = Some(PendingApproval {
                        step_index: index,
                        step_type,
                        content_hash: hash,
                        rerun_step: false,
                    });
                }
            }
            ResultCode::Blocked => {
                run.status = RunStatus::Blocked;
                run.pending_approval = Some(PendingApproval {
                    step_index: index,
                    step_type,
                    content_hash: hash,
                    rerun_step: true,
                });
            }
            ResultCode::Fatal | ResultCode::Retryable => {
                run.status = RunStatus::Failed;
                run.error = error;
            }
        }
    }

    fn expire(&self, mut run: RunRecord, step: StepType, error: StepError) -> Result<OrchestratorError, OrchestratorError> {
        warn!(step = %step, "deadline exceeded, run failed");
        run.status = RunStatus::Failed;
        run.error = Some(error);
        run.updated_at = Utc::now();
        self.save(&run)?;
        Ok(OrchestratorError::DeadlineExceeded { step })
    }

    fn save(&self, run: &RunRecord) -> Result<RunRecord, OrchestratorError> {
        Ok(self.runs.save(run, ExpectedVersion::Exact(run.version))?)
    }
}
