//! Worker pool: claim, guard, execute, write back.
//!
//! Each worker thread loops: claim a job, check its idempotency key, ask the
//! admission controller for a slot (run-driving jobs only), run the handler
//! while a heartbeat thread keeps the lease alive, then record the outcome.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, info_span, warn};

use patchflow_core::{DomainError, TenantId};
use patchflow_observability::Metrics;

use super::notify::{JobNotification, Notifier};
use super::store::{JobStore, JobStoreError};
use super::types::{
    chrono_duration, Claimed, FailOutcome, HeartbeatOutcome, JobError, JobRecord, JobResult, JobType,
    WorkerId,
};
use crate::admission::{Admission, AdmissionController, AdmissionError};
use crate::idempotency::{BeginOutcome, IdempotencyError, IdempotencyKey, IdempotencyLayer};

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&JobRecord) -> JobResult + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Thread name prefix and log field.
    pub name: String,
    pub threads: usize,
    pub lease_duration: Duration,
    /// Must be shorter than `lease_duration`.
    pub heartbeat_interval: Duration,
    /// Sleep between empty claims.
    pub poll_interval: Duration,
    /// Only claim jobs of this tenant.
    pub tenant_id: Option<TenantId>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "patchflow-worker".to_string(),
            threads: 4,
            lease_duration: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            tenant_id: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_lease(mut self, lease: Duration, heartbeat: Duration) -> Self {
        self.lease_duration = lease;
        self.heartbeat_interval = heartbeat;
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll_interval = poll;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Validation(#[from] DomainError),
}

/// What happened to a processed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    /// Duplicate of a completed execution; the cached result was reused.
    Cached,
    Retrying { next_attempt: u32 },
    DeadLettered,
    Failed,
    /// Re-delayed without consuming an attempt.
    Deferred { until: DateTime<Utc> },
    /// Another worker took the job over; nothing was written.
    LostLease,
}

impl ProcessOutcome {
    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::Completed => "completed",
            ProcessOutcome::Cached => "cached",
            ProcessOutcome::Retrying { .. } => "retrying",
            ProcessOutcome::DeadLettered => "dead_letter",
            ProcessOutcome::Failed => "failed",
            ProcessOutcome::Deferred { .. } => "deferred",
            ProcessOutcome::LostLease => "lost_lease",
        }
    }
}

impl From<FailOutcome> for ProcessOutcome {
    fn from(outcome: FailOutcome) -> Self {
        match outcome {
            FailOutcome::Retrying { next_attempt, .. } => ProcessOutcome::Retrying { next_attempt },
            FailOutcome::DeadLettered => ProcessOutcome::DeadLettered,
            FailOutcome::Failed => ProcessOutcome::Failed,
        }
    }
}

/// Runtime statistics across all threads of a pool.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_deferred: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: ProcessOutcome) {
        self.jobs_processed += 1;
        match outcome {
            ProcessOutcome::Completed | ProcessOutcome::Cached => self.jobs_succeeded += 1,
            ProcessOutcome::Retrying { .. } | ProcessOutcome::Failed => self.jobs_failed += 1,
            ProcessOutcome::DeadLettered => {
                self.jobs_failed += 1;
                self.jobs_dead_lettered += 1;
            }
            ProcessOutcome::Deferred { .. } => self.jobs_deferred += 1,
            ProcessOutcome::LostLease => {}
        }
    }
}

fn lock_stats(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for in-flight jobs to finish.
    pub fn shutdown(mut self) {
        for tx in &self.shutdown {
            let _ = tx.send(());
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }

    pub fn threads(&self) -> usize {
        self.joins.len()
    }
}

/// Job worker.
///
/// Owns the handler table and the guards every job passes through. Shared by
/// all threads of the pool.
pub struct Worker {
    store: Arc<dyn JobStore>,
    idempotency: IdempotencyLayer,
    admission: Arc<dyn AdmissionController>,
    metrics: Metrics,
    notifier: Option<Notifier>,
    handlers: HashMap<JobType, JobHandler>,
    config: WorkerConfig,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handlers: Vec<_> = self.handlers.keys().map(|t| t.as_str()).collect();
        handlers.sort_unstable();
        f.debug_struct("Worker")
            .field("handlers", &handlers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        idempotency: IdempotencyLayer,
        admission: Arc<dyn AdmissionController>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            idempotency,
            admission,
            metrics,
            notifier: None,
            handlers: HashMap::new(),
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish lifecycle events (completed, dead-lettered, failed) here.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Register the handler for a job type, replacing any previous one.
    pub fn register_handler<F>(&mut self, job_type: JobType, handler: F)
    where
        F: Fn(&JobRecord) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(job_type, Box::new(handler));
    }

    /// Spawn `config.threads` worker threads.
    pub fn spawn(self) -> std::io::Result<WorkerPoolHandle> {
        let worker = Arc::new(self);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let threads = worker.config.threads.max(1);
        let mut shutdown = Vec::with_capacity(threads);
        let mut joins = Vec::with_capacity(threads);

        for index in 0..threads {
            let (tx, rx) = mpsc::channel::<()>();
            let name = format!("{}-{index}", worker.config.name);
            let worker_id = WorkerId::new(format!("{}-{}", name, uuid::Uuid::now_v7()));
            let worker = worker.clone();
            let stats = stats.clone();
            let join = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(&worker, &worker_id, rx, &stats))?;
            shutdown.push(tx);
            joins.push(join);
        }

        info!(worker = %worker.config.name, threads, "worker pool started");
        Ok(WorkerPoolHandle {
            shutdown,
            joins,
            stats,
        })
    }

    /// Claim and process one job, if any is eligible.
    pub fn process_next(&self, worker_id: &WorkerId) -> Result<Option<ProcessOutcome>, WorkerError> {
        let claimed = self.store.claim(
            worker_id,
            self.config.lease_duration,
            self.config.tenant_id,
            Utc::now(),
        )?;
        match claimed {
            Some(claimed) => self.process(worker_id, claimed).map(Some),
            None => Ok(None),
        }
    }

    /// Process a job this worker has claimed.
    pub fn process(&self, worker_id: &WorkerId, claimed: Claimed) -> Result<ProcessOutcome, WorkerError> {
        let Claimed { job, reclaimed } = claimed;
        let span = info_span!(
            "job",
            job_id = %job.id(),
            tenant_id = %job.tenant_id(),
            job_type = %job.envelope.job_type,
            attempt = job.envelope.attempt,
            worker = %worker_id,
        );
        let _enter = span.enter();

        if reclaimed {
            self.metrics.record_reclaim();
            info!(reclaim_count = job.reclaim_count, "reclaimed job after lease expiry");
        }

        let clock = Instant::now();
        let outcome = self.process_claimed(worker_id, &job)?;
        self.metrics.record_job_finished(
            job.envelope.job_type.as_str(),
            outcome.label(),
            clock.elapsed().as_secs_f64(),
        );
        self.publish_outcome(&job, outcome);
        Ok(outcome)
    }

    fn process_claimed(&self, worker_id: &WorkerId, job: &JobRecord) -> Result<ProcessOutcome, WorkerError> {
        let job_id = job.id();
        let tenant_id = job.tenant_id();
        let job_type = job.envelope.job_type;
        let now = Utc::now();

        if job.envelope.is_past_deadline(now) {
            warn!("deadline passed before start");
            self.release_slot(job);
            let outcome = self.store.fail(job_id, worker_id, JobError::deadline_exceeded(), false, now);
            return settle(outcome.map(ProcessOutcome::from));
        }

        // The job id owns the lock, so a reclaimed job re-enters its own lock.
        let owner = job_id.to_string();
        let idempotency_key = job
            .envelope
            .idempotency_key
            .as_ref()
            .map(|key| IdempotencyKey::new(tenant_id, job_type.as_str(), key.as_str()))
            .transpose()?;

        if let Some(key) = &idempotency_key {
            match self.idempotency.begin_or_join(key, &owner, now)? {
                BeginOutcome::Acquired { .. } => {}
                BeginOutcome::Cached(result) => {
                    info!(key = %key, "duplicate of a completed execution");
                    self.release_slot(job);
                    let outcome = self.store.complete(job_id, worker_id, result, now);
                    return settle(outcome.map(|_| ProcessOutcome::Cached));
                }
                BeginOutcome::InFlight { locked_by, retry_after } => {
                    debug!(key = %key, locked_by = %locked_by, "duplicate in flight, deferring");
                    self.release_slot(job);
                    return self.defer(job, worker_id, retry_after, now);
                }
            }
        }

        let admitted = if job_type.drives_run() {
            match self.admission.try_admit(tenant_id, job_id)? {
                Admission::Granted { in_flight, limit } => {
                    debug!(in_flight, limit, "admitted");
                    true
                }
                Admission::Rejected(rejection) => {
                    self.metrics.record_admission_rejection(rejection.reason());
                    info!(reason = rejection.reason(), detail = %rejection, "admission rejected");
                    if let Some(key) = &idempotency_key {
                        self.idempotency.release(key, &owner, now)?;
                    }
                    return match rejection.retry_after() {
                        Some(delay) => self.defer(job, worker_id, delay, now),
                        None => {
                            let error = JobError::new(rejection.error_kind(), rejection.to_string());
                            settle(
                                self.store
                                    .fail(job_id, worker_id, error, false, now)
                                    .map(ProcessOutcome::from),
                            )
                        }
                    };
                }
            }
        } else {
            false
        };

        let result = match self.store.start(job_id, worker_id, Utc::now()) {
            Ok(_) => self.run_with_heartbeat(
                job,
                worker_id,
                idempotency_key.as_ref().map(|key| (key, owner.as_str())),
            ),
            Err(JobStoreError::LostLease(_)) => None,
            Err(e) => {
                self.release_guards(job, idempotency_key.as_ref(), &owner, admitted);
                return Err(e.into());
            }
        };

        let finished_at = Utc::now();
        // Settle the idempotency record before the job row, so a takeover sees the cached result.
        if let (Some(key), Some(JobResult::Success(value))) = (&idempotency_key, &result) {
            if let Err(e) = self.idempotency.finish(key, &owner, value.clone(), finished_at) {
                warn!(key = %key, error = %e, "could not store idempotent result");
            }
        } else if let Some(key) = &idempotency_key {
            if let Err(e) = self.idempotency.release(key, &owner, finished_at) {
                warn!(key = %key, error = %e, "could not release idempotency lock");
            }
        }
        if admitted {
            if let Err(e) = self.admission.release(tenant_id, job_id) {
                error!(error = %e, "could not release admission slot");
            }
        }

        let Some(result) = result else {
            warn!("lease lost while running, skipping write-back");
            return Ok(ProcessOutcome::LostLease);
        };

        match result {
            JobResult::Success(value) => {
                debug!("job completed");
                settle(
                    self.store
                        .complete(job_id, worker_id, value, finished_at)
                        .map(|_| ProcessOutcome::Completed),
                )
            }
            JobResult::Failure(error) => {
                let retry = error.kind.is_retryable();
                let outcome = settle(
                    self.store
                        .fail(job_id, worker_id, error.clone(), retry, finished_at)
                        .map(ProcessOutcome::from),
                )?;
                match outcome {
                    ProcessOutcome::DeadLettered => warn!(error = %error, "job dead-lettered"),
                    ProcessOutcome::Retrying { next_attempt } => {
                        info!(error = %error, next_attempt, "job failed, retry scheduled")
                    }
                    _ => warn!(error = %error, "job failed"),
                }
                Ok(outcome)
            }
            JobResult::Defer(delay) => self.defer(job, worker_id, delay, finished_at),
        }
    }

    fn defer(
        &self,
        job: &JobRecord,
        worker_id: &WorkerId,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, WorkerError> {
        let until = now + chrono_duration(delay);
        settle(
            self.store
                .defer(job.id(), worker_id, until, now)
                .map(|_| ProcessOutcome::Deferred { until }),
        )
    }

    /// Free a slot taken on the job's behalf before it was claimed (run creation
    /// admits the start job up front). Unknown holders are a no-op.
    fn release_slot(&self, job: &JobRecord) {
        if !job.envelope.job_type.drives_run() {
            return;
        }
        if let Err(e) = self.admission.release(job.tenant_id(), job.id()) {
            error!(error = %e, "could not release admission slot");
        }
    }

    fn release_guards(&self, job: &JobRecord, key: Option<&IdempotencyKey>, owner: &str, admitted: bool) {
        let now = Utc::now();
        if let Some(key) = key {
            if let Err(e) = self.idempotency.release(key, owner, now) {
                warn!(key = %key, error = %e, "could not release idempotency lock");
            }
        }
        if admitted {
            self.release_slot(job);
        }
    }

    /// Run the handler while a scoped thread extends the lease and the
    /// idempotency lock.
    ///
    /// Returns `None` when the lease was lost; the result must not be written.
    /// A panicking handler becomes a fatal failure.
    fn run_with_heartbeat(
        &self,
        job: &JobRecord,
        worker_id: &WorkerId,
        lock: Option<(&IdempotencyKey, &str)>,
    ) -> Option<JobResult> {
        let Some(handler) = self.handlers.get(&job.envelope.job_type) else {
            warn!("no handler registered");
            return Some(JobResult::Failure(JobError::fatal(format!(
                "no handler for job type {}",
                job.envelope.job_type
            ))));
        };

        let lost = AtomicBool::new(false);
        let lost_flag = &lost;
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let result = thread::scope(|scope| {
            scope.spawn(move || {
                loop {
                    match stop_rx.recv_timeout(self.config.heartbeat_interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let now = Utc::now();
                    match self
                        .store
                        .heartbeat(job.id(), worker_id, self.config.lease_duration, now)
                    {
                        Ok(HeartbeatOutcome::Extended { lease_expires_at }) => {
                            debug!(job_id = %job.id(), %lease_expires_at, "lease extended");
                        }
                        Ok(HeartbeatOutcome::LostLease) => {
                            warn!(job_id = %job.id(), "lease lost to another worker");
                            lost_flag.store(true, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => warn!(job_id = %job.id(), error = %e, "heartbeat failed"),
                    }
                    if let Some((key, owner)) = lock {
                        if let Err(e) = self.idempotency.extend(key, owner, now) {
                            warn!(key = %key, error = %e, "could not extend idempotency lock");
                        }
                    }
                }
            });

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(job)));
            drop(stop_tx);
            outcome.unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!(job_id = %job.id(), panic = %message, "job handler panicked");
                JobResult::Failure(JobError::fatal(format!("handler panicked: {message}")))
            })
        });

        if lost.load(Ordering::SeqCst) {
            None
        } else {
            Some(result)
        }
    }

    fn publish_outcome(&self, job: &JobRecord, outcome: ProcessOutcome) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let event = match outcome {
            ProcessOutcome::Completed | ProcessOutcome::Cached => "job.completed",
            ProcessOutcome::DeadLettered => "job.dead_lettered",
            ProcessOutcome::Failed => "job.failed",
            ProcessOutcome::Retrying { .. } => "job.retrying",
            ProcessOutcome::Deferred { .. } | ProcessOutcome::LostLease => return,
        };
        let _ = notifier.send(JobNotification {
            tenant_id: job.tenant_id(),
            run_id: job.envelope.run_id,
            job_id: Some(job.id()),
            event: event.to_string(),
            data: json!({
                "job_type": job.envelope.job_type,
                "attempt": job.envelope.attempt,
            }),
            at: Utc::now(),
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A write rejected because the lease moved on is not an error for this worker.
fn settle(result: Result<ProcessOutcome, JobStoreError>) -> Result<ProcessOutcome, WorkerError> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(JobStoreError::LostLease(job_id)) => {
            warn!(job_id = %job_id, "lease lost before write-back");
            Ok(ProcessOutcome::LostLease)
        }
        Err(e) => Err(e.into()),
    }
}

fn worker_loop(worker: &Worker, worker_id: &WorkerId, shutdown_rx: mpsc::Receiver<()>, stats: &Mutex<WorkerStats>) {
    info!(worker = %worker_id, "worker started");
    let started = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }
        lock_stats(stats).uptime_secs = started.elapsed().as_secs();

        lock_stats(stats).current_running += 1;
        let result = worker.process_next(worker_id);
        {
            let mut s = lock_stats(stats);
            s.current_running = s.current_running.saturating_sub(1);
            if let Ok(Some(outcome)) = &result {
                s.record(*outcome);
            }
        }

        let stop = match result {
            Ok(Some(_)) => false,
            Ok(None) => idle(&shutdown_rx, worker.config.poll_interval),
            Err(e) => {
                error!(worker = %worker_id, error = %e, "job processing failed");
                idle(&shutdown_rx, worker.config.poll_interval)
            }
        };
        if stop {
            break;
        }
    }

    info!(worker = %worker_id, "worker stopped");
}

/// Sleep for `poll`; returns true when shutdown was requested meanwhile.
fn idle(shutdown_rx: &mpsc::Receiver<()>, poll: Duration) -> bool {
    !matches!(shutdown_rx.recv_timeout(poll), Err(RecvTimeoutError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{InMemoryAdmissionController, PlanTier};
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobEnvelope, JobStatus};
    use crate::resilience::RetryPolicy;
    use patchflow_core::{ErrorKind, RunId};
    use patchflow_steps::StepType;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        admission: Arc<InMemoryAdmissionController>,
        worker: Worker,
        metrics: Metrics,
    }

    fn fixture() -> Fixture {
        let metrics = patchflow_observability::metrics::init().unwrap();
        let store = Arc::new(InMemoryJobStore::new().with_retry_policy(RetryPolicy::fixed(10, Duration::ZERO)));
        let admission = Arc::new(InMemoryAdmissionController::default());
        let idempotency = IdempotencyLayer::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            Duration::from_secs(60),
            Duration::from_secs(3600),
            metrics.clone(),
        );
        let worker = Worker::new(store.clone(), idempotency, admission.clone(), metrics.clone())
            .with_config(WorkerConfig::default().with_lease(Duration::from_secs(30), Duration::from_millis(20)));
        Fixture {
            store,
            admission,
            worker,
            metrics,
        }
    }

    fn enqueue(store: &InMemoryJobStore, envelope: JobEnvelope) -> patchflow_core::JobId {
        store.enqueue(envelope, Utc::now()).unwrap()
    }

    #[test]
    fn successful_job_completes_and_frees_its_slot() {
        let mut f = fixture();
        f.worker
            .register_handler(JobType::StartRun, |_| JobResult::Success(json!({"status": "completed"})));
        let tenant = TenantId::new();
        let id = enqueue(&f.store, JobEnvelope::new(tenant, RunId::new(), JobType::StartRun, json!({})));

        let outcome = f.worker.process_next(&WorkerId::new("w1")).unwrap();
        assert_eq!(outcome, Some(ProcessOutcome::Completed));
        let job = f.store.get(tenant, id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"status": "completed"})));
        assert_eq!(f.admission.state(tenant).unwrap().in_flight_count, 0);
        assert_eq!(f.worker.process_next(&WorkerId::new("w1")).unwrap(), None);
    }

    #[test]
    fn fatal_failure_dead_letters_and_transient_retries() {
        let mut f = fixture();
        f.worker.register_handler(JobType::ExecuteStep, |job| {
            if job.envelope.attempt == 1 {
                JobResult::Failure(JobError::transient("provider timeout"))
            } else {
                JobResult::Failure(JobError::fatal("patch does not apply"))
            }
        });
        let tenant = TenantId::new();
        let id = enqueue(&f.store, JobEnvelope::new(tenant, RunId::new(), JobType::ExecuteStep, json!({})).with_step(StepType::Code));
        let w = WorkerId::new("w1");

        assert_eq!(
            f.worker.process_next(&w).unwrap(),
            Some(ProcessOutcome::Retrying { next_attempt: 2 })
        );
        assert_eq!(f.worker.process_next(&w).unwrap(), Some(ProcessOutcome::DeadLettered));
        let job = f.store.get(tenant, id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::DeadLetter);
        assert_eq!(job.envelope.previous_attempts.len(), 2);
        assert_eq!(job.envelope.previous_attempts[1].error_kind, ErrorKind::Fatal);
    }

    #[test]
    fn duplicate_key_reuses_cached_result() {
        let mut f = fixture();
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = calls.clone();
        f.worker.register_handler(JobType::Notify, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            JobResult::Success(json!({"sent": true}))
        });
        let tenant = TenantId::new();
        let run = RunId::new();
        let w = WorkerId::new("w1");

        let first = enqueue(
            &f.store,
            JobEnvelope::new(tenant, run, JobType::Notify, json!({"event": "run.completed"})).with_idempotency_key("notify-1"),
        );
        assert_eq!(f.worker.process_next(&w).unwrap(), Some(ProcessOutcome::Completed));
        let second = enqueue(
            &f.store,
            JobEnvelope::new(tenant, run, JobType::Notify, json!({"event": "run.completed"})).with_idempotency_key("notify-1"),
        );
        assert_eq!(f.worker.process_next(&w).unwrap(), Some(ProcessOutcome::Cached));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.store.get(tenant, second).unwrap().unwrap().result,
            f.store.get(tenant, first).unwrap().unwrap().result
        );
        assert_eq!(f.metrics.idempotency_counters().duplicates_skipped, 1);
    }

    #[test]
    fn slot_taken_at_submission_is_freed_when_duplicate_is_cached() {
        let mut f = fixture();
        f.worker.register_handler(JobType::StartRun, |_| JobResult::Success(json!({"status": "completed"})));
        let tenant = TenantId::new();
        let run = RunId::new();
        let w = WorkerId::new("w1");
        let submit = || JobEnvelope::new(tenant, run, JobType::StartRun, json!({})).with_idempotency_key("run-1");

        enqueue(&f.store, submit());
        assert_eq!(f.worker.process_next(&w).unwrap(), Some(ProcessOutcome::Completed));

        let duplicate = submit();
        assert!(f.admission.try_admit(tenant, duplicate.job_id).unwrap().is_granted());
        enqueue(&f.store, duplicate);
        assert_eq!(f.worker.process_next(&w).unwrap(), Some(ProcessOutcome::Cached));
        assert_eq!(f.admission.state(tenant).unwrap().in_flight_count, 0);
    }

    #[test]
    fn admission_rejection_defers_without_consuming_attempt() {
        let mut f = fixture();
        f.worker.register_handler(JobType::StartRun, |_| JobResult::Success(json!({})));
        let tenant = TenantId::new();
        f.admission.set_plan(tenant, PlanTier::Free).unwrap();
        // Another job already holds the only Free slot.
        assert!(f.admission.try_admit(tenant, patchflow_core::JobId::new()).unwrap().is_granted());
        let id = enqueue(&f.store, JobEnvelope::new(tenant, RunId::new(), JobType::StartRun, json!({})));

        let outcome = f.worker.process_next(&WorkerId::new("w1")).unwrap();
        assert!(matches!(outcome, Some(ProcessOutcome::Deferred { .. })));
        let job = f.store.get(tenant, id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.envelope.attempt, 1);
        assert!(job.envelope.delay_until.is_some());
        assert_eq!(f.metrics.admission_rejections("limit"), 1);
    }

    #[test]
    fn suspended_tenant_fails_without_retry() {
        let mut f = fixture();
        f.worker.register_handler(JobType::ResumeRun, |_| JobResult::Success(json!({})));
        let tenant = TenantId::new();
        f.admission.suspend(tenant, "billing", Utc::now()).unwrap();
        let id = enqueue(&f.store, JobEnvelope::new(tenant, RunId::new(), JobType::ResumeRun, json!({})));

        assert_eq!(
            f.worker.process_next(&WorkerId::new("w1")).unwrap(),
            Some(ProcessOutcome::DeadLettered)
        );
        let job = f.store.get(tenant, id).unwrap().unwrap();
        assert_eq!(job.last_error.unwrap().kind, ErrorKind::Fatal);
    }

    #[test]
    fn heartbeat_keeps_long_job_leased() {
        let mut f = fixture();
        f.worker = f
            .worker
            .with_config(WorkerConfig::default().with_lease(Duration::from_millis(200), Duration::from_millis(20)));
        let store = f.store.clone();
        f.worker.register_handler(JobType::Notify, move |_| {
            thread::sleep(Duration::from_millis(500));
            // The lease outlived its original 200ms, so nobody else can take the job.
            let rival = store
                .claim(&WorkerId::new("w2"), Duration::from_secs(30), None, Utc::now())
                .unwrap();
            assert!(rival.is_none());
            JobResult::Success(json!({}))
        });
        let tenant = TenantId::new();
        let id = enqueue(&f.store, JobEnvelope::new(tenant, RunId::new(), JobType::Notify, json!({"event": "run.completed"})));

        assert_eq!(
            f.worker.process_next(&WorkerId::new("w1")).unwrap(),
            Some(ProcessOutcome::Completed)
        );
        let job = f.store.get(tenant, id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.reclaim_count, 0);
    }

    #[test]
    fn panicking_handler_fails_the_job_and_frees_its_guards() {
        let mut f = fixture();
        f.worker.register_handler(JobType::StartRun, |_| panic!("step exploded"));
        let tenant = TenantId::new();
        let id = enqueue(
            &f.store,
            JobEnvelope::new(tenant, RunId::new(), JobType::StartRun, json!({})).with_idempotency_key("boom"),
        );

        let outcome = f.worker.process_next(&WorkerId::new("w1")).unwrap();
        assert_eq!(outcome, Some(ProcessOutcome::DeadLettered));

        let job = f.store.get(tenant, id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::DeadLetter);
        let error = job.last_error.unwrap();
        assert_eq!(error.kind, ErrorKind::Fatal);
        assert!(error.message.contains("step exploded"), "{}", error.message);
        assert_eq!(f.admission.state(tenant).unwrap().in_flight_count, 0);
    }

    #[test]
    fn pool_survives_panicking_handler_and_shuts_down() {
        let mut f = fixture();
        f.worker.register_handler(JobType::Notify, |_| panic!("notify exploded"));
        let tenant = TenantId::new();
        let id = enqueue(&f.store, JobEnvelope::new(tenant, RunId::new(), JobType::Notify, json!({"event": "run.completed"})));
        let store = f.store.clone();
        let handle = f
            .worker
            .with_config(WorkerConfig::default().with_threads(1).with_lease(Duration::from_millis(200), Duration::from_millis(20)))
            .spawn()
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.get(tenant, id).unwrap().unwrap().status != JobStatus::DeadLetter && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown();
        assert_eq!(store.get(tenant, id).unwrap().unwrap().status, JobStatus::DeadLetter);
    }

    #[test]
    fn pool_drains_queue_and_shuts_down() {
        let mut f = fixture();
        f.worker.register_handler(JobType::Notify, |_| JobResult::Success(json!({})));
        let tenant = TenantId::new();
        for _ in 0..20 {
            enqueue(&f.store, JobEnvelope::new(tenant, RunId::new(), JobType::Notify, json!({"event": "run.completed"})));
        }
        let store = f.store.clone();
        let handle = f
            .worker
            .with_config(WorkerConfig::default().with_threads(4).with_lease(Duration::from_secs(30), Duration::from_secs(5)))
            .spawn()
            .unwrap();
        assert_eq!(handle.threads(), 4);

        let deadline = Instant::now() + Duration::from_secs(10);
        while handle.stats().jobs_succeeded < 20 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = handle.stats();
        handle.shutdown();
        assert_eq!(store.stats(Some(tenant), Utc::now()).unwrap().completed, 20);
        assert_eq!(stats.jobs_succeeded, 20);
    }
}
