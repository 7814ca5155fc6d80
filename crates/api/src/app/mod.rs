//! HTTP API application wiring.
//!
//! - `services.rs`: store selection and shared service wiring
//! - `routes/`: handlers, one file per area
//! - `dto.rs`: request/response shapes
//! - `errors.rs`: error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{build_in_memory_services, build_services, passthrough_registry, AppServices};

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    // Tenant-scoped routes require the X-Tenant-Id header.
    let scoped = routes::tenant_router().layer(axum::middleware::from_fn(middleware::tenant_middleware));

    Router::new()
        .merge(routes::public_router())
        .merge(scoped)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
