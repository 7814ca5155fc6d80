//! Built-in handlers for every [`JobType`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use patchflow_core::ErrorKind;
use patchflow_steps::{Pipeline, RunContext, StepType};

use super::notify::{JobNotification, Notifier};
use super::store::JobStore;
use super::types::{chrono_duration, JobError, JobRecord, JobResult, JobType};
use super::worker::Worker;
use crate::idempotency::IdempotencyLayer;
use crate::orchestrator::{Orchestrator, OrchestratorError, RunReport, RunStatus};

/// `start-run` payload. An absent pipeline means the default six steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartRunPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Vec<StepType>>,
    pub context: RunContext,
}

/// `cleanup` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupPayload {
    /// Overrides the configured retention for finished jobs and runs.
    pub retention_secs: Option<u64>,
}

/// `notify` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub event: String,
    #[serde(default)]
    pub data: JsonValue,
}

pub struct JobHandlers {
    orchestrator: Arc<Orchestrator>,
    jobs: Arc<dyn JobStore>,
    idempotency: IdempotencyLayer,
    retention: Duration,
    notifier: Option<Notifier>,
}

impl JobHandlers {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        jobs: Arc<dyn JobStore>,
        idempotency: IdempotencyLayer,
        retention: Duration,
    ) -> Self {
        Self {
            orchestrator,
            jobs,
            idempotency,
            retention,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Register a handler for every job type on `worker`.
    pub fn register(self: Arc<Self>, worker: &mut Worker) {
        for job_type in JobType::ALL {
            let handlers = self.clone();
            worker.register_handler(job_type, move |job| handlers.handle(job));
        }
    }

    pub fn handle(&self, job: &JobRecord) -> JobResult {
        let envelope = &job.envelope;
        match envelope.job_type {
            JobType::StartRun => self.start_run(job),
            JobType::ResumeRun => run_result(self.orchestrator.advance(
                envelope.tenant_id,
                envelope.run_id,
                envelope.deadline,
            )),
            JobType::ExecuteStep | JobType::RetryStep => match envelope.step_id {
                Some(step) => run_result(self.orchestrator.execute_step(
                    envelope.tenant_id,
                    envelope.run_id,
                    step,
                    envelope.deadline,
                )),
                None => invalid("step job without a step id"),
            },
            JobType::Cleanup => self.cleanup(job),
            JobType::Notify => self.notify(job),
        }
    }

    fn start_run(&self, job: &JobRecord) -> JobResult {
        let envelope = &job.envelope;
        let payload: StartRunPayload = match parse_payload(&envelope.payload) {
            Ok(payload) => payload,
            Err(result) => return result,
        };
        let pipeline = match payload.pipeline {
            Some(steps) => match Pipeline::new(steps) {
                Ok(pipeline) => pipeline,
                Err(e) => return invalid(e.to_string()),
            },
            None => Pipeline::default(),
        };

        if let Err(e) = self.orchestrator.create_run(
            envelope.tenant_id,
            envelope.run_id,
            pipeline,
            payload.context,
            Utc::now(),
        ) {
            return run_result(Err(e));
        }
        run_result(self.orchestrator.advance(envelope.tenant_id, envelope.run_id, envelope.deadline))
    }

    fn cleanup(&self, job: &JobRecord) -> JobResult {
        let payload: CleanupPayload = match parse_payload(&job.envelope.payload) {
            Ok(payload) => payload,
            Err(result) => return result,
        };
        let now = Utc::now();
        let retention = payload.retention_secs.map(Duration::from_secs).unwrap_or(self.retention);
        let older_than = now - chrono_duration(retention);

        let jobs = match self.jobs.cleanup(older_than) {
            Ok(n) => n,
            Err(e) => return JobResult::Failure(JobError::transient(format!("job cleanup: {e}"))),
        };
        let keys = match self.idempotency.cleanup(now) {
            Ok(n) => n,
            Err(e) => return JobResult::Failure(JobError::transient(format!("idempotency cleanup: {e}"))),
        };
        let runs = match self.orchestrator.runs().cleanup(older_than) {
            Ok(n) => n,
            Err(e) => return JobResult::Failure(JobError::transient(format!("run cleanup: {e}"))),
        };

        info!(jobs, idempotency_keys = keys, runs, "cleanup finished");
        JobResult::Success(json!({
            "jobs": jobs,
            "idempotency_keys": keys,
            "runs": runs,
        }))
    }

    fn notify(&self, job: &JobRecord) -> JobResult {
        let payload: NotifyPayload = match parse_payload(&job.envelope.payload) {
            Ok(payload) => payload,
            Err(result) => return result,
        };
        if payload.event.trim().is_empty() {
            return invalid("notify job without an event name");
        }
        let delivered = match &self.notifier {
            Some(notifier) => notifier
                .send(JobNotification {
                    tenant_id: job.tenant_id(),
                    run_id: job.envelope.run_id,
                    job_id: Some(job.id()),
                    event: payload.event.clone(),
                    data: payload.data,
                    at: Utc::now(),
                })
                .unwrap_or(0),
            None => 0,
        };
        debug!(event = %payload.event, delivered, "notification published");
        JobResult::Success(json!({ "event": payload.event, "delivered": delivered }))
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: &JsonValue) -> Result<T, JobResult> {
    // A missing payload is an empty object.
    let payload = if payload.is_null() { json!({}) } else { payload.clone() };
    serde_json::from_value(payload).map_err(|e| invalid(format!("invalid payload: {e}")))
}

fn invalid(message: impl Into<String>) -> JobResult {
    JobResult::Failure(JobError::new(ErrorKind::Validation, message))
}

/// A failed run never recovers by retrying the job; anything else the
/// orchestrator reports keeps its classification.
fn run_result(result: Result<RunReport, OrchestratorError>) -> JobResult {
    match result {
        Ok(report) if report.status == RunStatus::Failed => {
            let message = report
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "run failed".to_string());
            JobResult::Failure(JobError::fatal(message))
        }
        Ok(report) => match serde_json::to_value(&report) {
            Ok(value) => JobResult::Success(value),
            Err(e) => JobResult::Failure(JobError::fatal(format!("encode run report: {e}"))),
        },
        Err(e) => {
            let mut error = JobError::new(e.error_kind(), e.to_string());
            if let Some(delay) = e.retry_after() {
                error = error.with_retry_after(delay);
            }
            JobResult::Failure(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::JobEnvelope;
    use crate::orchestrator::InMemoryRunStore;
    use crate::resilience::{BreakerConfig, BreakerRegistry, ResilienceExecutor};
    use patchflow_core::{RunId, TenantId};
    use patchflow_steps::{StepError, StepOutput, StepRegistry};

    fn handlers(registry: StepRegistry) -> (JobHandlers, Arc<InMemoryJobStore>) {
        let metrics = patchflow_observability::metrics::init().unwrap();
        let executor = ResilienceExecutor::new(Arc::new(BreakerRegistry::new(BreakerConfig::default())));
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(InMemoryRunStore::new()), registry, executor));
        let jobs = Arc::new(InMemoryJobStore::new());
        let idempotency = IdempotencyLayer::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            Duration::from_secs(60),
            Duration::from_secs(60),
            metrics,
        );
        (
            JobHandlers::new(orchestrator, jobs.clone(), idempotency, Duration::from_secs(3600)),
            jobs,
        )
    }

    fn record(envelope: JobEnvelope) -> JobRecord {
        JobRecord::new(envelope, 1, Utc::now())
    }

    #[test]
    fn start_run_returns_report_for_custom_pipeline() {
        let mut registry = StepRegistry::new();
        registry.register_fn(StepType::Triage, "model", |_| StepOutput::ok("triaged"));
        registry.register_fn(StepType::Apply, "github", |_| StepOutput::ok("applied"));
        let (handlers, _) = handlers(registry);

        let job = record(JobEnvelope::new(
            TenantId::new(),
            RunId::new(),
            JobType::StartRun,
            json!({"pipeline": ["triage", "apply"], "context": {"repository": "acme/widgets"}}),
        ));
        let JobResult::Success(report) = handlers.handle(&job) else {
            panic!("start-run failed");
        };
        assert_eq!(report["status"], "completed");
        assert_eq!(report["steps"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn failed_run_is_a_fatal_job_failure() {
        let mut registry = StepRegistry::new();
        registry.register_fn(StepType::Triage, "model", |_| StepOutput::fatal(StepError::fatal("not a bug")));
        let (handlers, _) = handlers(registry);

        let job = record(JobEnvelope::new(TenantId::new(), RunId::new(), JobType::StartRun, JsonValue::Null));
        match handlers.handle(&job) {
            JobResult::Failure(error) => {
                assert_eq!(error.kind, ErrorKind::Fatal);
                assert_eq!(error.message, "not a bug");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_payloads_are_validation_failures() {
        let (handlers, _) = handlers(StepRegistry::new());
        let tenant = TenantId::new();

        let bad_pipeline = record(JobEnvelope::new(tenant, RunId::new(), JobType::StartRun, json!({"pipeline": []})));
        let no_step = record(JobEnvelope::new(tenant, RunId::new(), JobType::ExecuteStep, json!({})));
        let no_event = record(JobEnvelope::new(tenant, RunId::new(), JobType::Notify, json!({"data": 1})));
        let missing_run = record(JobEnvelope::new(tenant, RunId::new(), JobType::ResumeRun, json!({})));

        for job in [bad_pipeline, no_step, no_event, missing_run] {
            match handlers.handle(&job) {
                JobResult::Failure(error) => assert_eq!(error.kind, ErrorKind::Validation, "{}", job.envelope.job_type),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn notify_publishes_to_subscribers() {
        let (handlers, _) = handlers(StepRegistry::new());
        let notifier = crate::jobs::notify::channel(16);
        let mut rx = notifier.subscribe();
        let handlers = handlers.with_notifier(notifier);

        let tenant = TenantId::new();
        let job = record(JobEnvelope::new(
            tenant,
            RunId::new(),
            JobType::Notify,
            json!({"event": "pr.opened", "data": {"number": 7}}),
        ));
        assert!(matches!(handlers.handle(&job), JobResult::Success(v) if v["delivered"] == 1));
        let received = rx.try_recv().unwrap();
        assert_eq!(received.event, "pr.opened");
        assert_eq!(received.tenant_id, tenant);
        assert_eq!(received.data["number"], 7);
    }

    #[test]
    fn cleanup_reports_removed_counts() {
        let (handlers, _jobs) = handlers(StepRegistry::new());
        let job = record(JobEnvelope::new(TenantId::new(), RunId::new(), JobType::Cleanup, json!({"retention_secs": 0})));
        let JobResult::Success(summary) = handlers.handle(&job) else {
            panic!("cleanup failed");
        };
        assert_eq!(summary["jobs"], 0);
        assert_eq!(summary["runs"], 0);
    }
}
