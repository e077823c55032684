use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::{check_rate_limit, error_to_http, resolve_tenant};
use crate::error::Error;
use crate::models::Repository;
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub page_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub repositories: Vec<Repository>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TenantParams {
    #[serde(default)]
    pub tenant: Option<String>,
}

/// GET /api/repos — list repositories for the tenant, newest first.
pub async fn list_repositories(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
) -> Result<Json<ListResponse>, (StatusCode, String)> {
    let tenant = resolve_tenant(params.tenant.as_deref(), &headers, &state);
    check_rate_limit(&state, &tenant)?;

    let page_size = params
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = match params.page_token.as_deref() {
        None | Some("") => 0,
        Some(token) => token.parse::<usize>().map_err(|_| {
            error_to_http(Error::invalid_argument("malformed page_token"))
        })?,
    };

    let mut repositories = state.store.list_repository_metadata(&tenant);
    repositories.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let total = repositories.len();
    let page: Vec<Repository> = repositories
        .into_iter()
        .skip(offset)
        .take(page_size)
        .collect();

    let next_page_token = if offset + page.len() < total {
        Some((offset + page.len()).to_string())
    } else {
        None
    };

    Ok(Json(ListResponse {
        repositories: page,
        next_page_token,
    }))
}

/// GET /api/repos/{id} — fetch one repository's metadata.
pub async fn get_repository(
    State(state): State<AppState>,
    Path(repository_id): Path<String>,
    Query(params): Query<TenantParams>,
    headers: HeaderMap,
) -> Result<Json<Repository>, (StatusCode, String)> {
    let tenant = resolve_tenant(params.tenant.as_deref(), &headers, &state);

    let repository = state
        .store
        .get_repository_metadata(&tenant, &repository_id)
        .ok_or_else(|| {
            error_to_http(Error::NotFound(format!(
                "repository {repository_id} not found"
            )))
        })?;

    Ok(Json(repository))
}

/// DELETE /api/repos/{id} — drop the index, working tree, and metadata.
pub async fn delete_repository(
    State(state): State<AppState>,
    Path(repository_id): Path<String>,
    Query(params): Query<TenantParams>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, String)> {
    let tenant = resolve_tenant(params.tenant.as_deref(), &headers, &state);
    check_rate_limit(&state, &tenant)?;

    if state
        .store
        .get_repository_metadata(&tenant, &repository_id)
        .is_none()
    {
        return Err(error_to_http(Error::NotFound(format!(
            "repository {repository_id} not found"
        ))));
    }

    state
        .ingest
        .delete_repository(&tenant, &repository_id)
        .await
        .map_err(error_to_http)?;

    Ok(StatusCode::NO_CONTENT)
}
