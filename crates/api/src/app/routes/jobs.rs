use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;

use patchflow_core::JobId;

use crate::app::routes::common::parse_id;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::TenantContext;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

/// POST /jobs
///
/// The tenant is part of the envelope, so this route takes no tenant header.
pub async fn enqueue_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::EnqueueJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    let envelope = body.into_envelope(services.default_max_retries());
    let job_type = envelope.job_type;
    let job_id = match services.enqueue(envelope) {
        Ok(id) => id,
        Err(e) => return errors::job_store_error_to_response(e),
    };
    tracing::info!(job_id = %job_id, job_type = %job_type, "job enqueued");

    (
        StatusCode::CREATED,
        Json(serde_json::json!({ "jobId": job_id })),
    )
        .into_response()
}

/// GET /jobs/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.jobs().get(tenant.tenant_id(), job_id) {
        Ok(Some(job)) => Json(dto::JobView::from(&job)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found")),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

/// GET /dead-letters?limit=
///
/// Read-only; each entry carries its full attempt history.
pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Query(query): Query<dto::ListQuery>,
) -> axum::response::Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    match services.jobs().list_dead_letters(tenant.tenant_id(), limit) {
        Ok(jobs) => Json(jobs.iter().map(dto::JobView::from).collect::<Vec<_>>()).into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

/// POST /dead-letters/:id/redrive
pub async fn redrive_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.jobs().redrive(tenant.tenant_id(), job_id, Utc::now()) {
        Ok(job) => {
            tracing::info!(target: "audit", job_id = %job_id, tenant_id = %tenant.tenant_id(), "dead letter re-driven");
            Json(dto::JobView::from(&job)).into_response()
        }
        Err(e) => errors::job_store_error_to_response(e),
    }
}
