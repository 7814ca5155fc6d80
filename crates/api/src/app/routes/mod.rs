use axum::{
    routing::{get, post, put},
    Router,
};

pub mod common;
pub mod jobs;
pub mod runs;
pub mod system;
pub mod tenants;

/// Routes that carry their tenant in the body or path.
pub fn public_router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/metrics", get(system::metrics))
        .route("/jobs", post(jobs::enqueue_job))
        .route("/tenants/:id/concurrency", get(tenants::get_concurrency))
        .route("/tenants/:id/pause", post(tenants::pause))
        .route("/tenants/:id/resume", post(tenants::resume))
        .route("/tenants/:id/suspend", post(tenants::suspend))
        .route("/tenants/:id/plan", put(tenants::set_plan))
}

/// Routes scoped by the `X-Tenant-Id` header.
pub fn tenant_router() -> Router {
    Router::new()
        .route("/stream", get(system::stream))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/dead-letters", get(jobs::list_dead_letters))
        .route("/dead-letters/:id/redrive", post(jobs::redrive_dead_letter))
        .route("/runs", post(runs::create_run))
        .route("/runs/:id", get(runs::get_run))
        .route("/runs/:id/approvals", post(runs::approve_run))
}
