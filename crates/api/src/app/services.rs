use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use chrono::Utc;
use tokio::runtime::Handle;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use patchflow_core::{JobId, TenantId};
use patchflow_infra::admission::{AdmissionController, InMemoryAdmissionController, PostgresAdmissionController};
use patchflow_infra::config::PatchflowConfig;
use patchflow_infra::db::{self, Db};
use patchflow_infra::idempotency::{
    IdempotencyLayer, IdempotencyStore, InMemoryIdempotencyStore, PostgresIdempotencyStore,
};
use patchflow_infra::jobs::{
    self, InMemoryJobStore, JobEnvelope, JobHandlers, JobStore, JobStoreError, Notifier, PostgresJobStore, Worker,
    WorkerConfig, WorkerPoolHandle,
};
use patchflow_infra::orchestrator::{InMemoryRunStore, Orchestrator, PostgresRunStore, RunStore};
use patchflow_infra::resilience::{BreakerRegistry, ResilienceExecutor};
use patchflow_observability::Metrics;
use patchflow_steps::{StepOutput, StepRegistry, StepType};

/// Which storage the services run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    InMemory,
    Postgres,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::InMemory => "in_memory",
            Backend::Postgres => "postgres",
        }
    }
}

/// Everything the HTTP handlers and the worker pool share.
#[derive(Clone)]
pub struct AppServices {
    backend: Backend,
    jobs: Arc<dyn JobStore>,
    idempotency: IdempotencyLayer,
    admission: Arc<dyn AdmissionController>,
    orchestrator: Arc<Orchestrator>,
    metrics: Metrics,
    notifier: Notifier,
    worker_config: WorkerConfig,
    default_max_retries: u32,
    retention: Duration,
}

struct Stores {
    jobs: Arc<dyn JobStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    admission: Arc<dyn AdmissionController>,
    runs: Arc<dyn RunStore>,
}

/// Postgres when `database.url` is set, in-memory otherwise.
///
/// Must be called inside a multi-threaded tokio runtime when a database is configured.
pub async fn build_services(config: &PatchflowConfig, registry: StepRegistry) -> anyhow::Result<AppServices> {
    match &config.database.url {
        Some(url) => build_persistent_services(url, config, registry).await,
        None => build_in_memory_services(config, registry),
    }
}

pub fn build_in_memory_services(config: &PatchflowConfig, registry: StepRegistry) -> anyhow::Result<AppServices> {
    // In-memory wiring (dev/test): nothing survives a restart.
    let stores = Stores {
        jobs: Arc::new(InMemoryJobStore::new().with_retry_policy(config.retry_policy())),
        idempotency: Arc::new(InMemoryIdempotencyStore::new()),
        admission: Arc::new(InMemoryAdmissionController::new(config.admission_policy())),
        runs: Arc::new(InMemoryRunStore::new()),
    };
    AppServices::assemble(Backend::InMemory, stores, config, registry)
}

async fn build_persistent_services(
    url: &str,
    config: &PatchflowConfig,
    registry: StepRegistry,
) -> anyhow::Result<AppServices> {
    let pool = db::connect(url, config.database.max_connections).await?;
    let db = Db::new(pool, Handle::current());
    tracing::info!(max_connections = config.database.max_connections, "connected to postgres");

    let stores = Stores {
        jobs: Arc::new(PostgresJobStore::new(db.clone()).with_retry_policy(config.retry_policy())),
        idempotency: Arc::new(PostgresIdempotencyStore::new(db.clone())),
        admission: Arc::new(PostgresAdmissionController::new(db.clone(), config.admission_policy())),
        runs: Arc::new(PostgresRunStore::new(db)),
    };
    AppServices::assemble(Backend::Postgres, stores, config, registry)
}

impl AppServices {
    fn assemble(
        backend: Backend,
        stores: Stores,
        config: &PatchflowConfig,
        registry: StepRegistry,
    ) -> anyhow::Result<Self> {
        let metrics = patchflow_observability::metrics::init()?;
        let breakers = Arc::new(BreakerRegistry::new(config.breaker_config()).with_metrics(metrics.clone()));
        let orchestrator = Arc::new(
            Orchestrator::new(stores.runs, registry, ResilienceExecutor::new(breakers))
                .with_step_policy(config.retry_policy()),
        );
        let idempotency = IdempotencyLayer::new(
            stores.idempotency,
            config.idempotency.lock_ttl,
            config.idempotency.completed_retention,
            metrics.clone(),
        );

        Ok(Self {
            backend,
            jobs: stores.jobs,
            idempotency,
            admission: stores.admission,
            orchestrator,
            metrics,
            notifier: jobs::notify::channel(256),
            worker_config: config.worker_config(),
            default_max_retries: config.jobs.default_max_retries,
            retention: config.jobs.retention,
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn admission(&self) -> &Arc<dyn AdmissionController> {
        &self.admission
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    pub fn enqueue(&self, envelope: JobEnvelope) -> Result<JobId, JobStoreError> {
        let job_type = envelope.job_type;
        let job_id = self.jobs.enqueue(envelope, Utc::now())?;
        self.metrics.record_enqueue(job_type.as_str());
        Ok(job_id)
    }

    /// Push current queue depth and oldest undelivered age into the gauges.
    pub fn refresh_queue_gauges(&self) -> Result<(), JobStoreError> {
        let now = Utc::now();
        let stats = self.jobs.stats(None, now)?;
        self.metrics
            .set_queue_state(stats.pending as u64, stats.oldest_undelivered_age(now).as_secs_f64());
        Ok(())
    }

    /// Start the worker pool with every built-in job handler registered.
    pub fn spawn_workers(&self) -> std::io::Result<WorkerPoolHandle> {
        let handlers = Arc::new(
            JobHandlers::new(
                self.orchestrator.clone(),
                self.jobs.clone(),
                self.idempotency.clone(),
                self.retention,
            )
            .with_notifier(self.notifier.clone()),
        );
        let mut worker = Worker::new(
            self.jobs.clone(),
            self.idempotency.clone(),
            self.admission.clone(),
            self.metrics.clone(),
        )
        .with_config(self.worker_config.clone())
        .with_notifier(self.notifier.clone());
        handlers.register(&mut worker);
        worker.spawn()
    }
}

/// Registry whose handlers skip every step.
///
/// Step logic lives outside this service; with it the binary still exercises
/// the full job, admission and run lifecycle.
pub fn passthrough_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    for step in StepType::ALL {
        registry.register_fn(step, "passthrough", move |_| {
            StepOutput::skipped(format!("no {step} handler configured"))
        });
    }
    registry
}

/// Job lifecycle notifications of one tenant as server-sent events.
pub fn tenant_sse_stream(
    services: Arc<AppServices>,
    tenant_id: TenantId,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.notifier().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(n) if n.tenant_id == tenant_id => {
            let data = serde_json::to_string(&n).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event(n.event).data(data)))
        }
        _ => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
