//! Axum handlers for the inbound RPC surface.

pub mod chat;
pub mod health;
pub mod repos;
pub mod search;
pub mod upload;

use axum::http::{HeaderMap, StatusCode};

use crate::error::Error;
use crate::state::AppState;

/// Map the error taxonomy onto HTTP status codes.
pub fn error_to_http(err: Error) -> (StatusCode, String) {
    let status = match &err {
        Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
        Error::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
        Error::SourceUnreachable(_) | Error::LlmFailed(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

/// Resolve the caller's tenant: explicit request field, `x-tenant-id`
/// header, then the configured default.
pub fn resolve_tenant(explicit: Option<&str>, headers: &HeaderMap, state: &AppState) -> String {
    if let Some(tenant) = explicit {
        if !tenant.is_empty() {
            return tenant.to_string();
        }
    }
    headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| state.config.default_tenant.clone())
}

/// Enforce the per-tenant token bucket.
pub fn check_rate_limit(state: &AppState, tenant: &str) -> Result<(), (StatusCode, String)> {
    if state.rate_limiter.allow(tenant) {
        Ok(())
    } else {
        Err(error_to_http(Error::ResourceExhausted(tenant.to_string())))
    }
}
