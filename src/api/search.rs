use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::{check_rate_limit, error_to_http, resolve_tenant};
use crate::error::Error;
use crate::models::{CodeChunk, IngestState, SearchFilters, SearchStats, SearchTimings};
use crate::search::ContextSearch;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub repository_id: String,
    pub query: String,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub filters: Option<SearchFilters>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub chunks: Vec<CodeChunk>,
    pub timings: SearchTimings,
    pub stats: SearchStats,
}

/// POST /api/search — direct hybrid retrieval over one repository.
pub async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, (StatusCode, String)> {
    let tenant = resolve_tenant(req.tenant.as_deref(), &headers, &state);
    check_rate_limit(&state, &tenant)?;

    let repository = state
        .store
        .get_repository_metadata(&tenant, &req.repository_id)
        .ok_or_else(|| {
            error_to_http(Error::NotFound(format!(
                "repository {} not found",
                req.repository_id
            )))
        })?;
    if repository.ingestion_status.state != IngestState::Ready {
        return Err(error_to_http(Error::FailedPrecondition(format!(
            "repository {} is not ready (state: {:?})",
            req.repository_id, repository.ingestion_status.state
        ))));
    }

    let limit = req.limit.unwrap_or(state.config.search.max_results);
    let filters = req.filters.unwrap_or_default();

    let results = state
        .retriever
        .search(&tenant, &req.repository_id, &req.query, limit, &filters)
        .await
        .map_err(error_to_http)?;

    Ok(Json(SearchResponse {
        chunks: results.chunks,
        timings: results.timings,
        stats: results.stats,
    }))
}
