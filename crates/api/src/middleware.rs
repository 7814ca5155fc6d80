use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use patchflow_core::TenantId;

use crate::app::errors::json_error;
use crate::context::TenantContext;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Scope the request to the tenant named in `X-Tenant-Id`.
///
/// The header only scopes data; there is no authentication behind it.
pub async fn tenant_middleware(mut req: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    let tenant_id = match extract_tenant(req.headers()) {
        Ok(tenant_id) => tenant_id,
        Err(message) => return json_error(StatusCode::BAD_REQUEST, "missing_tenant", message),
    };

    req.extensions_mut().insert(TenantContext::new(tenant_id));
    next.run(req).await
}

fn extract_tenant(headers: &HeaderMap) -> Result<TenantId, String> {
    let header = headers
        .get(TENANT_HEADER)
        .ok_or_else(|| "X-Tenant-Id header is required".to_string())?;

    let value = header
        .to_str()
        .map_err(|_| "X-Tenant-Id header is not valid text".to_string())?
        .trim();
    if value.is_empty() {
        return Err("X-Tenant-Id header is empty".to_string());
    }

    value.parse::<TenantId>().map_err(|e| e.to_string())
}
