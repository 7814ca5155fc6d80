//! Per-tenant concurrency admission.
//!
//! A job must hold a slot before it runs. Slots are keyed by holder (job id),
//! capped by the tenant's plan, and refused outright while the tenant is
//! paused or suspended. A refused job is re-delayed, not failed.

pub mod postgres;
pub mod store;
pub mod types;

pub use postgres::PostgresAdmissionController;
pub use store::{AdmissionController, InMemoryAdmissionController};
pub use types::{
    Admission, AdmissionError, AdmissionPolicy, PlanLimits, PlanTier, Rejection, TenantConcurrencyState,
    TenantStatus,
};
