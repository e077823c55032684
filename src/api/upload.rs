use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{check_rate_limit, error_to_http, resolve_tenant};
use crate::error::Error;
use crate::ingest::IngestRequest;
use crate::models::{
    IngestionProgress, IngestionStatus, RepoSource, Repository, UploadOptions,
};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UploadGitRepositoryRequest {
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub git_repository: GitRepository,
    #[serde(default)]
    pub options: Option<UploadOptions>,
}

#[derive(Debug, Deserialize)]
pub struct GitRepository {
    pub url: String,
    #[serde(rename = "ref", default)]
    pub git_ref: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub upload_id: String,
    pub repository_id: String,
    pub accepted_at: DateTime<Utc>,
    pub status: IngestionStatus,
}

#[derive(Debug, Deserialize)]
pub struct ArchiveParams {
    pub filename: String,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadStatusResponse {
    pub upload_id: String,
    pub repository_id: String,
    pub status: IngestionStatus,
    pub progress: IngestionProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusParams {
    #[serde(default)]
    pub tenant: Option<String>,
}

/// POST /api/repos/git — accept a git repository for ingestion.
pub async fn upload_git(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UploadGitRepositoryRequest>,
) -> Result<(StatusCode, Json<UploadResponse>), (StatusCode, String)> {
    let tenant = resolve_tenant(req.tenant.as_deref(), &headers, &state);
    check_rate_limit(&state, &tenant)?;

    let url = req.git_repository.url.trim().to_string();
    if url.is_empty() {
        return Err(error_to_http(Error::invalid_argument(
            "git_repository.url is required",
        )));
    }
    let git_ref = req
        .git_repository
        .git_ref
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "main".to_string());

    let source = RepoSource::Git {
        url,
        git_ref,
        commit_sha: None,
    };

    accept_upload(&state, tenant, source, req.idempotency_key, req.options).await
}

/// POST /api/repos/archive — accept an uploaded archive for ingestion.
/// The request body is the raw archive bytes; exceeding the configured
/// cumulative size cap is rejected.
pub async fn upload_archive(
    State(state): State<AppState>,
    Query(params): Query<ArchiveParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>), (StatusCode, String)> {
    let tenant = resolve_tenant(params.tenant.as_deref(), &headers, &state);
    check_rate_limit(&state, &tenant)?;

    if body.is_empty() {
        return Err(error_to_http(Error::invalid_argument("empty upload body")));
    }
    if body.len() as u64 > state.config.ingest.max_upload_bytes {
        return Err(error_to_http(Error::InvalidArgument(format!(
            "upload of {} bytes exceeds the {} byte limit",
            body.len(),
            state.config.ingest.max_upload_bytes
        ))));
    }

    // Only the basename is honored; client-supplied directories are not
    let filename = std::path::Path::new(&params.filename)
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_default();
    let supported = [".zip", ".tar", ".tar.gz", ".tgz"];
    if filename.is_empty() || !supported.iter().any(|ext| filename.ends_with(ext)) {
        return Err(error_to_http(Error::InvalidArgument(format!(
            "unsupported archive filename: {}",
            params.filename
        ))));
    }

    // Stage under a unique name so concurrent uploads cannot collide
    let staged_name = format!("{}-{}", Uuid::new_v4(), filename);
    let staged_path = state.config.staging_dir().join(&staged_name);
    tokio::fs::write(&staged_path, &body)
        .await
        .map_err(|e| error_to_http(Error::Internal(format!("failed to stage upload: {e}"))))?;

    let source = RepoSource::Archive {
        filename: staged_name,
        content_hash: None,
    };

    accept_upload(&state, tenant, source, params.idempotency_key, None).await
}

async fn accept_upload(
    state: &AppState,
    tenant: String,
    source: RepoSource,
    idempotency_key: Option<String>,
    options: Option<UploadOptions>,
) -> Result<(StatusCode, Json<UploadResponse>), (StatusCode, String)> {
    let repository_id = format!("repo-{}", Uuid::new_v4());
    let upload_id = idempotency_key
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| format!("upload-{}", Uuid::new_v4()));

    let request = IngestRequest {
        repository_id: repository_id.clone(),
        tenant: tenant.clone(),
        source: source.clone(),
        options: options.unwrap_or_default(),
        idempotency_key: upload_id.clone(),
    };

    let status = state.ingest.submit(request).map_err(error_to_http)?;

    // A duplicate submission returns the original job's repository
    let repository_id = status.repository_id.clone();

    // Make the repository visible to List/Get while ingestion runs
    if state
        .store
        .get_repository_metadata(&tenant, &repository_id)
        .is_none()
    {
        let repository = Repository {
            repository_id: repository_id.clone(),
            name: source.display_name(),
            source,
            ingestion_status: status.status.clone(),
            stats: Default::default(),
            created_at: status.created_at,
            updated_at: status.created_at,
        };
        if let Err(err) = state.store.set_repository_metadata(&tenant, &repository) {
            tracing::warn!(%err, "failed to store preliminary repository metadata");
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            upload_id: status.upload_id,
            repository_id,
            accepted_at: status.created_at,
            status: status.status,
        }),
    ))
}

/// GET /api/uploads/{upload_id} — poll ingestion status.
pub async fn get_upload_status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    Query(params): Query<StatusParams>,
    headers: HeaderMap,
) -> Result<Json<UploadStatusResponse>, (StatusCode, String)> {
    let tenant = resolve_tenant(params.tenant.as_deref(), &headers, &state);

    let status = state
        .store
        .get_upload_status(&tenant, &upload_id)
        .ok_or_else(|| error_to_http(Error::NotFound(format!("upload {upload_id} not found"))))?;

    Ok(Json(UploadStatusResponse {
        upload_id: status.upload_id,
        repository_id: status.repository_id,
        status: status.status,
        progress: status.progress,
        error_message: status.error_message,
    }))
}
