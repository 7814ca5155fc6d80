use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{header, StatusCode},
    response::{sse::Event as SseEvent, IntoResponse},
    Json,
};

use patchflow_observability::metrics::TEXT_CONTENT_TYPE;

use crate::app::errors;
use crate::app::services::{self, AppServices};
use crate::context::TenantContext;

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "backend": services.backend().as_str(),
    }))
}

/// Prometheus text exposition; queue gauges are refreshed on every scrape.
pub async fn metrics(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    if let Err(e) = services.refresh_queue_gauges() {
        tracing::warn!(error = %e, "could not refresh queue gauges");
    }
    match services.metrics().render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "metrics_error", e.to_string()),
    }
}

pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> axum::response::Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    services::tenant_sse_stream(services, tenant.tenant_id())
}
