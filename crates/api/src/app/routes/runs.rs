use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;

use patchflow_core::{RunId, TenantId};
use patchflow_infra::admission::Admission;
use patchflow_infra::jobs::{JobEnvelope, JobType, StartRunPayload};
use patchflow_steps::{ApprovalRecord, Pipeline};

use crate::app::routes::common::parse_id;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::TenantContext;

/// POST /runs
///
/// Admission happens here so a tenant at its limit gets 429 before anything
/// is queued. The slot is held by the start-run job and released by the worker.
pub async fn create_run(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    body: Result<Json<dto::CreateRunRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };
    let tenant_id = tenant.tenant_id();

    if let Some(steps) = &body.pipeline {
        if let Err(e) = Pipeline::new(steps.clone()) {
            return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string());
        }
    }

    let run_id = body.run_id.unwrap_or_else(RunId::new);
    let payload = StartRunPayload {
        pipeline: body.pipeline,
        context: body.context,
    };
    let payload = match serde_json::to_value(&payload) {
        Ok(v) => v,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
    };

    let mut envelope = run_envelope(&services, tenant_id, run_id, JobType::StartRun, payload);
    if let Some(key) = body.idempotency_key {
        envelope = envelope.with_idempotency_key(key);
    }
    if let Some(priority) = body.priority {
        envelope = envelope.with_priority(priority);
    }
    if let Some(deadline) = body.deadline {
        envelope = envelope.with_deadline(deadline);
    }
    let holder = envelope.job_id;

    match services.admission().try_admit(tenant_id, holder) {
        Ok(Admission::Granted { .. }) => {}
        Ok(Admission::Rejected(rejection)) => {
            services.metrics().record_admission_rejection(rejection.reason());
            tracing::info!(tenant_id = %tenant_id, reason = rejection.reason(), "run rejected at admission");
            return errors::rejection_to_response(&rejection);
        }
        Err(e) => return errors::admission_error_to_response(e),
    }

    let job_id = match services.enqueue(envelope) {
        Ok(id) => id,
        Err(e) => {
            if let Err(release_err) = services.admission().release(tenant_id, holder) {
                tracing::warn!(error = %release_err, "failed to release admission slot");
            }
            return errors::job_store_error_to_response(e);
        }
    };

    (
        StatusCode::ACCEPTED,
        Json(json!({ "runId": run_id, "jobId": job_id })),
    )
        .into_response()
}

/// GET /runs/:id
pub async fn get_run(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let run_id: RunId = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.orchestrator().get_run(tenant.tenant_id(), run_id) {
        Ok(run) => Json(dto::RunView::from(&run)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// POST /runs/:id/approvals
///
/// Records the approval and queues a resume-run job behind any other work on the run.
pub async fn approve_run(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    body: Result<Json<dto::ApprovalRequest>, JsonRejection>,
) -> axum::response::Response {
    let run_id: RunId = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };
    if body.approved_by.trim().is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "approvedBy is required");
    }

    let mut approval = ApprovalRecord::new(body.approved_by, body.content_hash, Utc::now());
    if let Some(comment) = body.comment {
        approval = approval.with_comment(comment);
    }

    let tenant_id = tenant.tenant_id();
    let run = match services.orchestrator().approve(tenant_id, run_id, approval) {
        Ok(run) => run,
        Err(e) => return errors::orchestrator_error_to_response(e),
    };

    let envelope = run_envelope(&services, tenant_id, run_id, JobType::ResumeRun, json!({}));
    match services.enqueue(envelope) {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "runId": run_id, "jobId": job_id, "status": run.status })),
        )
            .into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

/// Run-driving jobs share the run id as ordering key so they execute one at a time.
fn run_envelope(
    services: &AppServices,
    tenant_id: TenantId,
    run_id: RunId,
    job_type: JobType,
    payload: serde_json::Value,
) -> JobEnvelope {
    JobEnvelope::new(tenant_id, run_id, job_type, payload)
        .with_ordering_key(run_id.to_string())
        .with_max_retries(services.default_max_retries())
        .with_source("api")
}
