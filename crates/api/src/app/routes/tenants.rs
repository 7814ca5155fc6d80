//! Operator controls over per-tenant admission.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    response::IntoResponse,
    Json,
};
use chrono::Utc;

use patchflow_core::TenantId;
use patchflow_infra::admission::{AdmissionController, AdmissionError};

use crate::app::routes::common::parse_id;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// GET /tenants/:id/concurrency
pub async fn get_concurrency(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let tenant_id: TenantId = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.admission().state(tenant_id) {
        Ok(state) => Json(dto::TenantConcurrencyView::from(&state)).into_response(),
        Err(e) => errors::admission_error_to_response(e),
    }
}

/// POST /tenants/:id/pause
pub async fn pause(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<dto::ReasonRequest>>,
) -> axum::response::Response {
    let reason = reason_or_default(body);
    status_change(&services, &id, |admission, tenant_id| {
        admission.pause(tenant_id, &reason, Utc::now())
    })
}

/// POST /tenants/:id/resume
pub async fn resume(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    status_change(&services, &id, |admission, tenant_id| admission.resume(tenant_id, Utc::now()))
}

/// POST /tenants/:id/suspend
pub async fn suspend(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<dto::ReasonRequest>>,
) -> axum::response::Response {
    let reason = reason_or_default(body);
    status_change(&services, &id, |admission, tenant_id| {
        admission.suspend(tenant_id, &reason, Utc::now())
    })
}

/// PUT /tenants/:id/plan
pub async fn set_plan(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Result<Json<dto::PlanRequest>, axum::extract::rejection::JsonRejection>,
) -> axum::response::Response {
    let tenant_id: TenantId = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    match services.admission().set_plan(tenant_id, body.plan) {
        Ok(state) => {
            tracing::info!(target: "audit", tenant_id = %tenant_id, plan = body.plan.as_str(), "tenant plan changed");
            Json(dto::TenantConcurrencyView::from(&state)).into_response()
        }
        Err(e) => errors::admission_error_to_response(e),
    }
}

fn reason_or_default(body: Option<Json<dto::ReasonRequest>>) -> String {
    body.and_then(|Json(b)| b.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "operator request".to_string())
}

/// Apply a status transition; repeating one is a no-op reported as `changed: false`.
fn status_change<F>(services: &AppServices, raw_id: &str, change: F) -> axum::response::Response
where
    F: FnOnce(&dyn AdmissionController, TenantId) -> Result<bool, AdmissionError>,
{
    let tenant_id: TenantId = match parse_id(raw_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let admission = services.admission().as_ref();
    let changed = match change(admission, tenant_id) {
        Ok(changed) => changed,
        Err(e) => return errors::admission_error_to_response(e),
    };
    match admission.state(tenant_id) {
        Ok(state) => Json(serde_json::json!({
            "changed": changed,
            "state": dto::TenantConcurrencyView::from(&state),
        }))
        .into_response(),
        Err(e) => errors::admission_error_to_response(e),
    }
}
