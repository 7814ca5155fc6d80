use axum::extract::rejection::JsonRejection;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use serde_json::json;

use patchflow_infra::admission::{AdmissionError, Rejection};
use patchflow_infra::jobs::JobStoreError;
use patchflow_infra::orchestrator::{OrchestratorError, RunStoreError};

pub fn job_store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        // Another tenant's job is indistinguishable from a missing one.
        JobStoreError::TenantIsolation => json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        JobStoreError::AlreadyExists(id) => {
            json_error(StatusCode::CONFLICT, "conflict", format!("job {id} already exists"))
        }
        e @ JobStoreError::InvalidTransition { .. } => json_error(StatusCode::CONFLICT, "invalid_transition", e.to_string()),
        JobStoreError::Validation(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        e @ (JobStoreError::LostLease(_) | JobStoreError::Storage(_)) => {
            tracing::error!(error = %e, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn orchestrator_error_to_response(err: OrchestratorError) -> axum::response::Response {
    match err {
        OrchestratorError::RunNotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("run {id} not found"))
        }
        OrchestratorError::Store(RunStoreError::NotFound(id)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("run {id} not found"))
        }
        OrchestratorError::Store(RunStoreError::TenantIsolation) => {
            json_error(StatusCode::NOT_FOUND, "not_found", "run not found")
        }
        OrchestratorError::Store(e @ RunStoreError::Conflict { .. }) => {
            json_error(StatusCode::CONFLICT, "conflict", e.to_string())
        }
        OrchestratorError::ApprovalRejected(msg) => json_error(StatusCode::CONFLICT, "approval_rejected", msg),
        OrchestratorError::Validation(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        e => {
            tracing::error!(error = %e, "orchestrator failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "orchestrator_error", e.to_string())
        }
    }
}

pub fn admission_error_to_response(err: AdmissionError) -> axum::response::Response {
    match err {
        AdmissionError::Validation(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        AdmissionError::Storage(msg) => {
            tracing::error!(error = %msg, "admission store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

/// 429 for an exhausted limit, 503 while paused, 403 while suspended.
pub fn rejection_to_response(rejection: &Rejection) -> axum::response::Response {
    let message = rejection.to_string();
    let (status, body) = match rejection {
        Rejection::LimitExhausted {
            limit,
            current,
            retry_after,
        } => (
            StatusCode::TOO_MANY_REQUESTS,
            json!({
                "error": "concurrency_limit",
                "message": message,
                "limit": limit,
                "current": current,
                "retryAfter": retry_after.as_secs_f64(),
            }),
        ),
        Rejection::Paused { retry_after, .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({
                "error": "tenant_paused",
                "message": message,
                "retryAfter": retry_after.as_secs_f64(),
            }),
        ),
        Rejection::Suspended { .. } => (
            StatusCode::FORBIDDEN,
            json!({
                "error": "tenant_suspended",
                "message": message,
            }),
        ),
    };

    let mut response = (status, axum::Json(body)).into_response();
    if let Some(retry_after) = rejection.retry_after() {
        let secs = retry_after.as_secs().max(1);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

/// Malformed or mistyped JSON bodies are validation errors.
pub fn json_rejection_to_response(rejection: JsonRejection) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
