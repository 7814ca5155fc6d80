//! Cross-component scenarios: job store, worker, idempotency, admission and
//! orchestrator wired together with the in-memory backends.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;

use patchflow_core::{JobId, RunId, TenantId};
use patchflow_infra::admission::{AdmissionController, AdmissionPolicy, InMemoryAdmissionController, PlanTier};
use patchflow_infra::idempotency::{
    BeginOutcome, IdempotencyKey, IdempotencyLayer, IdempotencyState, IdempotencyStore, InMemoryIdempotencyStore,
};
use patchflow_infra::jobs::{
    InMemoryJobStore, JobEnvelope, JobError, JobHandlers, JobResult, JobStatus, JobStore, JobStoreError, JobType,
    ProcessOutcome, Worker, WorkerConfig, WorkerId,
};
use patchflow_infra::orchestrator::{InMemoryRunStore, Orchestrator, RunStatus};
use patchflow_infra::resilience::{BreakerConfig, BreakerRegistry, ResilienceExecutor, RetryPolicy};
use patchflow_observability::Metrics;
use patchflow_steps::{StepOutput, StepRegistry, StepType};

struct Harness {
    jobs: Arc<InMemoryJobStore>,
    idempotency: Arc<InMemoryIdempotencyStore>,
    admission: Arc<InMemoryAdmissionController>,
    metrics: Metrics,
}

impl Harness {
    fn new() -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::new().with_retry_policy(RetryPolicy::fixed(10, Duration::ZERO))),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            admission: Arc::new(InMemoryAdmissionController::new(AdmissionPolicy::default())),
            metrics: patchflow_observability::metrics::init().unwrap(),
        }
    }

    fn layer(&self) -> IdempotencyLayer {
        IdempotencyLayer::new(
            self.idempotency.clone(),
            Duration::from_secs(60),
            Duration::from_secs(3600),
            self.metrics.clone(),
        )
    }

    fn worker(&self, config: WorkerConfig) -> Worker {
        Worker::new(self.jobs.clone(), self.layer(), self.admission.clone(), self.metrics.clone()).with_config(config)
    }
}

fn quick_config() -> WorkerConfig {
    WorkerConfig::default().with_lease(Duration::from_secs(30), Duration::from_millis(50))
}

#[test]
fn failed_key_can_be_resubmitted_and_completes_once() {
    let h = Harness::new();
    let mut worker = h.worker(quick_config());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    worker.register_handler(JobType::ExecuteStep, move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            JobResult::Failure(JobError::transient("upstream 503"))
        } else {
            JobResult::Success(json!({"patch": "applied"}))
        }
    });

    let tenant = TenantId::new();
    let run = RunId::new();
    let submit = || {
        JobEnvelope::new(tenant, run, JobType::ExecuteStep, json!({}))
            .with_step(StepType::Apply)
            .with_idempotency_key("k1")
            .with_max_retries(2)
    };
    let w = WorkerId::new("w1");

    let first = h.jobs.enqueue(submit(), Utc::now()).unwrap();
    assert_eq!(worker.process_next(&w).unwrap(), Some(ProcessOutcome::Retrying { next_attempt: 2 }));
    assert_eq!(worker.process_next(&w).unwrap(), Some(ProcessOutcome::DeadLettered));

    let dead = h.jobs.get(tenant, first).unwrap().unwrap();
    assert_eq!(dead.status, JobStatus::DeadLetter);
    assert_eq!(dead.envelope.previous_attempts.len(), 2);

    let key = IdempotencyKey::new(tenant, JobType::ExecuteStep.as_str(), "k1").unwrap();
    assert_eq!(h.idempotency.get(&key).unwrap().unwrap().state, IdempotencyState::Failed);

    // Manual third submission under the same key.
    let second = h.jobs.enqueue(submit(), Utc::now()).unwrap();
    assert_eq!(worker.process_next(&w).unwrap(), Some(ProcessOutcome::Completed));
    let record = h.idempotency.get(&key).unwrap().unwrap();
    assert_eq!(record.state, IdempotencyState::Completed);
    assert_eq!(record.result_snapshot, Some(json!({"patch": "applied"})));

    // Any later duplicate gets the cached result without executing.
    let third = h.jobs.enqueue(submit(), Utc::now()).unwrap();
    assert_eq!(worker.process_next(&w).unwrap(), Some(ProcessOutcome::Cached));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        h.jobs.get(tenant, third).unwrap().unwrap().result,
        h.jobs.get(tenant, second).unwrap().unwrap().result
    );
    assert_eq!(h.metrics.idempotency_counters().duplicates_skipped, 1);
}

#[test]
fn abandoned_job_is_reclaimed_and_completed_exactly_once() {
    let h = Harness::new();
    let lease = Duration::from_millis(100);
    let mut worker = h.worker(WorkerConfig::default().with_lease(lease, Duration::from_millis(20)));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    worker.register_handler(JobType::Notify, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        JobResult::Success(json!({"by": "b"}))
    });

    let tenant = TenantId::new();
    let id = h
        .jobs
        .enqueue(JobEnvelope::new(tenant, RunId::new(), JobType::Notify, json!({"event": "x"})), Utc::now())
        .unwrap();

    // Worker A claims and goes silent.
    let a = WorkerId::new("a");
    h.jobs.claim(&a, lease, None, Utc::now()).unwrap().unwrap();
    h.jobs.start(id, &a, Utc::now()).unwrap();
    assert_eq!(worker.process_next(&WorkerId::new("b")).unwrap(), None);

    thread::sleep(lease * 2);
    assert_eq!(worker.process_next(&WorkerId::new("b")).unwrap(), Some(ProcessOutcome::Completed));

    let record = h.jobs.get(tenant, id).unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.reclaim_count, 1);
    assert_eq!(record.envelope.attempt, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A's late write-back is refused.
    assert!(matches!(
        h.jobs.complete(id, &a, json!({"by": "a"}), Utc::now()),
        Err(JobStoreError::LostLease(_))
    ));
    assert_eq!(h.jobs.get(tenant, id).unwrap().unwrap().result, Some(json!({"by": "b"})));
}

#[test]
fn exhausted_retries_dead_letter_after_exactly_max_retries_attempts() {
    let h = Harness::new();
    let mut worker = h.worker(quick_config());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    worker.register_handler(JobType::ResumeRun, move |job| {
        counter.fetch_add(1, Ordering::SeqCst);
        JobResult::Failure(JobError::transient(format!("attempt {} timed out", job.envelope.attempt)))
    });

    let tenant = TenantId::new();
    let id = h
        .jobs
        .enqueue(
            JobEnvelope::new(tenant, RunId::new(), JobType::ResumeRun, json!({})).with_max_retries(4),
            Utc::now(),
        )
        .unwrap();
    let w = WorkerId::new("w1");

    let mut outcomes = Vec::new();
    while let Some(outcome) = worker.process_next(&w).unwrap() {
        outcomes.push(outcome);
    }
    assert_eq!(outcomes.len(), 4);
    assert_eq!(outcomes.last(), Some(&ProcessOutcome::DeadLettered));
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let dead = h.jobs.list_dead_letters(tenant, 10).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id(), id);
    let history: Vec<_> = dead[0]
        .envelope
        .previous_attempts
        .iter()
        .map(|a| a.attempt_number)
        .collect();
    assert_eq!(history, vec![1, 2, 3, 4]);
    assert_eq!(dead[0].envelope.previous_attempts[3].error_message, "attempt 4 timed out");
    assert_eq!(h.admission.state(tenant).unwrap().in_flight_count, 0);
}

#[test]
fn concurrent_duplicates_execute_at_most_once() {
    let h = Harness::new();
    let layer = h.layer();
    let key = IdempotencyKey::new(TenantId::new(), "start-run", "issue-42").unwrap();
    let threads = 32;
    let barrier = Arc::new(Barrier::new(threads));
    let executions = Arc::new(AtomicU32::new(0));

    let joins: Vec<_> = (0..threads)
        .map(|i| {
            let layer = layer.clone();
            let key = key.clone();
            let barrier = barrier.clone();
            let executions = executions.clone();
            thread::spawn(move || {
                let owner = format!("req-{i}");
                barrier.wait();
                match layer.begin_or_join(&key, &owner, Utc::now()).unwrap() {
                    BeginOutcome::Acquired { .. } => {
                        executions.fetch_add(1, Ordering::SeqCst);
                        layer.finish(&key, &owner, json!({"winner": owner}), Utc::now()).unwrap();
                        true
                    }
                    BeginOutcome::Cached(_) | BeginOutcome::InFlight { .. } => false,
                }
            })
        })
        .collect();
    let winners = joins.into_iter().map(|j| j.join().unwrap()).filter(|won| *won).count();

    assert_eq!(winners, 1);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert!(matches!(
        layer.begin_or_join(&key, "late", Utc::now()).unwrap(),
        BeginOutcome::Cached(_)
    ));
    assert_eq!(h.metrics.idempotency_counters().checks_total, threads as u64 + 1);
}

#[test]
fn burst_admission_never_exceeds_plan_limit() {
    let admission = Arc::new(InMemoryAdmissionController::new(AdmissionPolicy::default()));
    let tenant = TenantId::new();
    let limit = admission.set_plan(tenant, PlanTier::Pro).unwrap().plan_limit;
    let threads = 64;
    let barrier = Arc::new(Barrier::new(threads));

    let joins: Vec<_> = (0..threads)
        .map(|_| {
            let admission = admission.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let holder = JobId::new();
                barrier.wait();
                let granted = admission.try_admit(tenant, holder).unwrap().is_granted();
                let in_flight = admission.state(tenant).unwrap().in_flight_count;
                (granted.then_some(holder), in_flight)
            })
        })
        .collect();
    let results: Vec<_> = joins.into_iter().map(|j| j.join().unwrap()).collect();

    let holders: Vec<JobId> = results.iter().filter_map(|(h, _)| *h).collect();
    assert_eq!(holders.len() as u32, limit);
    assert!(results.iter().all(|(_, in_flight)| *in_flight <= limit));

    for holder in holders {
        assert!(admission.release(tenant, holder).unwrap());
    }
    assert_eq!(admission.state(tenant).unwrap().in_flight_count, 0);
    assert!(admission.try_admit(tenant, JobId::new()).unwrap().is_granted());
}

#[test]
fn long_running_holder_keeps_its_lock_past_the_ttl() {
    let h = Harness::new();
    let lock_ttl = Duration::from_millis(100);
    let layer = IdempotencyLayer::new(h.idempotency.clone(), lock_ttl, Duration::from_secs(3600), h.metrics.clone());
    let mut worker = Worker::new(h.jobs.clone(), layer, h.admission.clone(), h.metrics.clone())
        .with_config(WorkerConfig::default().with_lease(Duration::from_secs(5), Duration::from_millis(20)));
    let executions = Arc::new(AtomicU32::new(0));
    let counter = executions.clone();
    worker.register_handler(JobType::ExecuteStep, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(400));
        JobResult::Success(json!({"patch": "slow"}))
    });

    let tenant = TenantId::new();
    let run = RunId::new();
    let submit = || {
        JobEnvelope::new(tenant, run, JobType::ExecuteStep, json!({}))
            .with_step(StepType::Code)
            .with_idempotency_key("slow")
    };
    let first = h.jobs.enqueue(submit(), Utc::now()).unwrap();
    let duplicate = h.jobs.enqueue(submit(), Utc::now()).unwrap();

    let duplicate_outcomes = thread::scope(|scope| {
        let holder = scope.spawn(|| worker.process_next(&WorkerId::new("holder")).unwrap());

        // Well past the original lock TTL while the holder is still running.
        thread::sleep(lock_ttl * 2 + Duration::from_millis(50));
        let second = WorkerId::new("second");
        let mut outcomes = vec![worker.process_next(&second).unwrap()];

        assert_eq!(holder.join().unwrap(), Some(ProcessOutcome::Completed));
        let deadline = Instant::now() + Duration::from_secs(5);
        while outcomes.last() != Some(&Some(ProcessOutcome::Cached)) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
            if let Some(outcome) = worker.process_next(&second).unwrap() {
                outcomes.push(Some(outcome));
            }
        }
        outcomes
    });

    assert!(matches!(duplicate_outcomes[0], Some(ProcessOutcome::Deferred { .. })));
    assert_eq!(duplicate_outcomes.last(), Some(&Some(ProcessOutcome::Cached)));
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(h.metrics.idempotency_counters().lock_recoveries, 0);
    assert_eq!(
        h.jobs.get(tenant, duplicate).unwrap().unwrap().result,
        h.jobs.get(tenant, first).unwrap().unwrap().result
    );
}

#[test]
fn pool_drives_a_run_to_completion_through_jobs() {
    let h = Harness::new();
    let mut registry = StepRegistry::new();
    let flaky = Arc::new(AtomicU32::new(0));
    let flaky_counter = flaky.clone();
    registry.register_fn(StepType::Triage, "model", |_| StepOutput::ok("bug confirmed"));
    registry.register_fn(StepType::Code, "model", move |_| {
        if flaky_counter.fetch_add(1, Ordering::SeqCst) == 0 {
            StepOutput::retryable(patchflow_steps::StepError::transient("rate limited"))
        } else {
            StepOutput::ok("patch written")
        }
    });
    registry.register_fn(StepType::Apply, "github", |_| StepOutput::ok("pull request opened"));

    let executor = ResilienceExecutor::new(Arc::new(BreakerRegistry::new(BreakerConfig::default())));
    let runs = Arc::new(InMemoryRunStore::new());
    let orchestrator = Arc::new(
        Orchestrator::new(runs.clone(), registry, executor)
            .with_step_policy(RetryPolicy::fixed(3, Duration::from_millis(1))),
    );
    let handlers = Arc::new(JobHandlers::new(
        orchestrator.clone(),
        h.jobs.clone(),
        h.layer(),
        Duration::from_secs(3600),
    ));
    let mut worker = h.worker(quick_config().with_threads(2).with_poll_interval(Duration::from_millis(10)));
    handlers.register(&mut worker);

    let tenant = TenantId::new();
    let run = RunId::new();
    let id = h
        .jobs
        .enqueue(
            JobEnvelope::new(
                tenant,
                run,
                JobType::StartRun,
                json!({"pipeline": ["triage", "code", "apply"], "context": {"repository": "acme/widgets"}}),
            )
            .with_idempotency_key(format!("run-{run}")),
            Utc::now(),
        )
        .unwrap();

    let handle = worker.spawn().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while handle.stats().jobs_succeeded < 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    handle.shutdown();

    let job = h.jobs.get(tenant, id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let report = job.result.unwrap();
    assert_eq!(report["status"], "completed");
    assert_eq!(report["steps"].as_array().unwrap().len(), 3);

    let record = orchestrator.get_run(tenant, run).unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(flaky.load(Ordering::SeqCst), 2);
    assert_eq!(h.admission.state(tenant).unwrap().in_flight_count, 0);
}
