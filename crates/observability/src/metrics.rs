//! Prometheus metrics for the job orchestration stack.
//!
//! A [`Metrics`] handle owns its own [`Registry`] so independent instances
//! (tests, embedded use) never collide. Clone it freely; all instruments are
//! reference counted.
//!
//! ```ignore
//! let metrics = patchflow_observability::metrics::init()?;
//! metrics.record_enqueue("start_run");
//! let body = metrics.render()?;
//! ```

use std::sync::Arc;

use prometheus::{
    core::Collector, Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};

/// Job execution duration buckets (seconds). Steps can take minutes.
const JOB_DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 1800.0,
];

/// Content type for the text exposition format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Idempotency
    idempotency_checks: Counter,
    duplicates_skipped: Counter,
    processing_conflicts: Counter,
    lock_recoveries: Counter,
    ttl_cleanups: Counter,

    // Jobs
    jobs_enqueued: CounterVec,
    jobs_finished: CounterVec,
    jobs_reclaimed: Counter,
    job_duration: HistogramVec,
    queue_depth: Gauge,
    oldest_undelivered_age: Gauge,

    // Admission / resilience
    admission_rejections: CounterVec,
    breaker_transitions: CounterVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

/// Point-in-time view of the idempotency counters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct IdempotencyCounters {
    pub checks_total: u64,
    pub duplicates_skipped: u64,
    pub processing_conflicts: u64,
    pub lock_recoveries: u64,
    pub ttl_cleanups: u64,
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_idempotency_check(&self) {
        self.idempotency_checks.inc();
    }

    /// A completed record answered the request; nothing was re-executed.
    pub fn record_duplicate_skipped(&self) {
        self.duplicates_skipped.inc();
    }

    /// Another execution holds the lock.
    pub fn record_processing_conflict(&self) {
        self.processing_conflicts.inc();
    }

    /// An abandoned or released lock was taken over.
    pub fn record_lock_recovery(&self) {
        self.lock_recoveries.inc();
    }

    pub fn record_ttl_cleanups(&self, count: u64) {
        self.ttl_cleanups.inc_by(count as f64);
    }

    pub fn record_enqueue(&self, job_type: &str) {
        self.jobs_enqueued.with_label_values(&[job_type]).inc();
    }

    /// `outcome` is one of `completed`, `retried`, `dead_letter`, `failed`, `deferred`.
    pub fn record_job_finished(&self, job_type: &str, outcome: &str, duration_secs: f64) {
        self.jobs_finished.with_label_values(&[job_type, outcome]).inc();
        self.job_duration
            .with_label_values(&[job_type])
            .observe(duration_secs);
    }

    pub fn record_reclaim(&self) {
        self.jobs_reclaimed.inc();
    }

    /// `reason` is one of `limit`, `paused`, `suspended`.
    pub fn record_admission_rejection(&self, reason: &str) {
        self.admission_rejections.with_label_values(&[reason]).inc();
    }

    pub fn record_breaker_transition(&self, dependency: &str, to: &str) {
        self.breaker_transitions
            .with_label_values(&[dependency, to])
            .inc();
    }

    /// Refresh the queue gauges from a store snapshot.
    pub fn set_queue_state(&self, pending: u64, oldest_undelivered_age_secs: f64) {
        self.queue_depth.set(pending as f64);
        self.oldest_undelivered_age.set(oldest_undelivered_age_secs);
    }

    pub fn idempotency_counters(&self) -> IdempotencyCounters {
        IdempotencyCounters {
            checks_total: self.idempotency_checks.get() as u64,
            duplicates_skipped: self.duplicates_skipped.get() as u64,
            processing_conflicts: self.processing_conflicts.get() as u64,
            lock_recoveries: self.lock_recoveries.get() as u64,
            ttl_cleanups: self.ttl_cleanups.get() as u64,
        }
    }

    pub fn admission_rejections(&self, reason: &str) -> u64 {
        self.admission_rejections.with_label_values(&[reason]).get() as u64
    }

    pub fn breaker_transitions(&self, dependency: &str, to: &str) -> u64 {
        self.breaker_transitions
            .with_label_values(&[dependency, to])
            .get() as u64
    }

    pub fn queue_depth(&self) -> f64 {
        self.queue_depth.get()
    }

    /// Encode every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Build a metrics handle backed by a fresh registry.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let idempotency_checks = register(
        &registry,
        Counter::with_opts(Opts::new(
            "patchflow_idempotency_checks_total",
            "Idempotency key lookups (begin-or-join calls)",
        ))?,
    );
    let duplicates_skipped = register(
        &registry,
        Counter::with_opts(Opts::new(
            "patchflow_idempotency_duplicates_skipped_total",
            "Requests answered from a completed record without re-execution",
        ))?,
    );
    let processing_conflicts = register(
        &registry,
        Counter::with_opts(Opts::new(
            "patchflow_idempotency_processing_conflicts_total",
            "Requests that found the key locked by another execution",
        ))?,
    );
    let lock_recoveries = register(
        &registry,
        Counter::with_opts(Opts::new(
            "patchflow_idempotency_lock_recoveries_total",
            "Abandoned or released locks re-acquired by a new execution",
        ))?,
    );
    let ttl_cleanups = register(
        &registry,
        Counter::with_opts(Opts::new(
            "patchflow_idempotency_ttl_cleanups_total",
            "Idempotency records removed by TTL cleanup",
        ))?,
    );

    let jobs_enqueued = register(
        &registry,
        CounterVec::new(
            Opts::new("patchflow_jobs_enqueued_total", "Jobs accepted into the store"),
            &["type"],
        )?,
    );
    let jobs_finished = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "patchflow_jobs_finished_total",
                "Job executions by outcome (completed, retried, dead_letter, failed, deferred)",
            ),
            &["type", "outcome"],
        )?,
    );
    let jobs_reclaimed = register(
        &registry,
        Counter::with_opts(Opts::new(
            "patchflow_jobs_reclaimed_total",
            "Jobs claimed after the previous holder's lease lapsed",
        ))?,
    );
    let job_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "patchflow_job_duration_seconds",
                "Handler execution time per job type",
            )
            .buckets(JOB_DURATION_BUCKETS.to_vec()),
            &["type"],
        )?,
    );
    let queue_depth = register(
        &registry,
        Gauge::with_opts(Opts::new(
            "patchflow_queue_depth",
            "Jobs waiting to be claimed",
        ))?,
    );
    let oldest_undelivered_age = register(
        &registry,
        Gauge::with_opts(Opts::new(
            "patchflow_oldest_undelivered_age_seconds",
            "Age of the oldest pending job",
        ))?,
    );

    let admission_rejections = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "patchflow_admission_rejections_total",
                "Admission requests rejected (limit, paused, suspended)",
            ),
            &["reason"],
        )?,
    );
    let breaker_transitions = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "patchflow_breaker_transitions_total",
                "Circuit breaker state changes",
            ),
            &["dependency", "to"],
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        idempotency_checks,
        duplicates_skipped,
        processing_conflicts,
        lock_recoveries,
        ttl_cleanups,
        jobs_enqueued,
        jobs_finished,
        jobs_reclaimed,
        job_duration,
        queue_depth,
        oldest_undelivered_age,
        admission_rejections,
        breaker_transitions,
    })
}
