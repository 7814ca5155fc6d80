use std::str::FromStr;

use axum::http::StatusCode;

use patchflow_core::DomainError;

use crate::app::errors;

/// Parse a path identifier, answering 400 when it is malformed.
pub fn parse_id<T>(raw: &str) -> Result<T, axum::response::Response>
where
    T: FromStr<Err = DomainError>,
{
    raw.parse::<T>()
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}
