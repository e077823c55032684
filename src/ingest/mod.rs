//! Ingestion pipeline: a monotonic state machine
//! (`Pending → Extracting → Chunking → Embedding → Indexing → Ready`, with
//! any non-terminal state able to fall to `Failed`) driven by a worker with
//! a bounded concurrency budget.
//!
//! Submission enqueues and returns immediately; the published upload status
//! is the only coupling between callers and the running pipeline.

pub mod chunker;
pub mod extract;
pub mod indexer;

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::cache::MetaStore;
use crate::config::IngestConfig;
use crate::error::{Error, Result};
use crate::llm::embeddings::EmbeddingClient;
use crate::models::{
    IngestState, IngestionProgress, IngestionStatus, RepoSource, Repository, UploadOptions,
    UploadStatus,
};
use crate::search::semantic::VectorClient;

/// Phase weights for the composite progress value.
const FILE_WEIGHT: f32 = 0.3;
const EMBED_WEIGHT: f32 = 0.5;
const INDEX_WEIGHT: f32 = 0.2;

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub repository_id: String,
    pub tenant: String,
    pub source: RepoSource,
    pub options: UploadOptions,
    pub idempotency_key: String,
}

/// Composite 0–100 progress weighted across the pipeline phases:
/// files 30%, embeddings 50%, indexing 20%.
pub fn progress_percent(
    total_files: usize,
    processed_files: usize,
    total_chunks: usize,
    embedded_chunks: usize,
    indexed_chunks: usize,
) -> f32 {
    if total_files == 0 {
        return 0.0;
    }

    let file_progress = processed_files as f32 / total_files as f32;
    let embed_progress = if total_chunks > 0 {
        embedded_chunks as f32 / total_chunks as f32
    } else {
        0.0
    };
    let index_progress = if total_chunks > 0 {
        indexed_chunks as f32 / total_chunks as f32
    } else {
        0.0
    };

    (file_progress * FILE_WEIGHT + embed_progress * EMBED_WEIGHT + index_progress * INDEX_WEIGHT)
        * 100.0
}

#[derive(Clone)]
pub struct IngestWorker {
    store: Arc<MetaStore>,
    embeddings: EmbeddingClient,
    vectors: VectorClient,
    config: IngestConfig,
    work_dir: PathBuf,
    staging_dir: PathBuf,
    semaphore: Arc<Semaphore>,
}

impl IngestWorker {
    pub fn new(
        store: Arc<MetaStore>,
        embeddings: EmbeddingClient,
        vectors: VectorClient,
        config: IngestConfig,
        work_dir: PathBuf,
        staging_dir: PathBuf,
    ) -> Self {
        let budget = config.max_concurrent.max(1);
        Self {
            store,
            embeddings,
            vectors,
            config,
            work_dir,
            staging_dir,
            semaphore: Arc::new(Semaphore::new(budget)),
        }
    }

    /// Accept an ingestion job and return its initial status. A repeated
    /// submission with the same `(tenant, idempotency_key)` returns the
    /// existing job's status without starting a second pipeline.
    pub fn submit(&self, request: IngestRequest) -> Result<UploadStatus> {
        if let Some(existing) = self
            .store
            .get_upload_status(&request.tenant, &request.idempotency_key)
        {
            tracing::info!(
                upload_id = %request.idempotency_key,
                repository_id = %existing.repository_id,
                "duplicate submission, returning existing status"
            );
            return Ok(existing);
        }

        let status = UploadStatus {
            upload_id: request.idempotency_key.clone(),
            repository_id: request.repository_id.clone(),
            status: IngestionStatus::new(IngestState::Pending),
            progress: IngestionProgress::default(),
            error_message: None,
            created_at: Utc::now(),
        };
        self.store.set_upload_status(&request.tenant, &status)?;

        // The pipeline runs detached from the caller; the status record is
        // the only way to observe it.
        let worker = self.clone();
        let initial = status.clone();
        tokio::spawn(async move {
            let _permit = worker.semaphore.clone().acquire_owned().await;
            let mut job = JobContext {
                store: worker.store.clone(),
                tenant: request.tenant.clone(),
                status,
            };

            if let Err(err) = worker.run_pipeline(&request, &mut job).await {
                tracing::error!(
                    repository_id = %request.repository_id,
                    %err,
                    "ingestion failed"
                );
                job.fail(err);
            }
        });

        Ok(initial)
    }

    async fn run_pipeline(&self, request: &IngestRequest, job: &mut JobContext) -> Result<()> {
        let repository_id = request.repository_id.clone();
        let target = self.work_dir.join(&repository_id);

        // Extract
        job.set_state(IngestState::Extracting);
        let source = request.source.clone();
        let staging = self.staging_dir.clone();
        let extract_target = target.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            extract::extract_repository(&source, &staging, &extract_target)
        })
        .await??;

        tracing::info!(
            repository_id = %repository_id,
            files = extracted.files.len(),
            "extraction complete"
        );

        // Chunk
        job.set_state(IngestState::Chunking);
        let options = self.chunk_options(&request.options);
        let files = extracted.files.clone();
        let chunk_root = target.clone();
        let chunk_repo = repository_id.clone();
        let chunks = tokio::task::spawn_blocking(move || {
            chunker::chunk_files(&chunk_root, &chunk_repo, &files, &options)
        })
        .await??;

        let total_files = extracted.files.len();
        let total_chunks = chunks.len();
        job.set_counts(total_files, total_files, total_chunks, 0, 0);
        tracing::info!(repository_id = %repository_id, chunks = total_chunks, "chunking complete");

        // Embed
        job.set_state(IngestState::Embedding);
        let embedded = indexer::embed_chunks(&self.embeddings, chunks, |embedded_count| {
            job.set_counts(total_files, total_files, total_chunks, embedded_count, 0);
        })
        .await?;

        // Index
        job.set_state(IngestState::Indexing);
        indexer::index_embeddings(&self.vectors, &repository_id, &embedded, |indexed_count| {
            job.set_counts(
                total_files,
                total_files,
                total_chunks,
                embedded.len(),
                indexed_count,
            );
        })
        .await?;

        // Ready
        job.set_counts(
            total_files,
            total_files,
            total_chunks,
            embedded.len(),
            embedded.len(),
        );
        job.set_state(IngestState::Ready);

        // Persist repository metadata and routing
        let mut source = request.source.clone();
        match &mut source {
            RepoSource::Git { commit_sha, .. } => *commit_sha = Some(extracted.content_hash.clone()),
            RepoSource::Archive { content_hash, .. } => {
                *content_hash = Some(extracted.content_hash.clone())
            }
        }
        let mut stats = extracted.stats.clone();
        stats.total_chunks = total_chunks;

        let repository = Repository {
            repository_id: repository_id.clone(),
            name: source.display_name(),
            ingestion_status: IngestionStatus::new(IngestState::Ready),
            stats,
            created_at: job.status.created_at,
            updated_at: Utc::now(),
            source: source.clone(),
        };
        self.store
            .set_repository_metadata(&request.tenant, &repository)?;
        self.store
            .set_repository_index(&request.tenant, &source.repo_key(), &repository_id);

        tracing::info!(repository_id = %repository_id, "repository ready");
        Ok(())
    }

    fn chunk_options(&self, options: &UploadOptions) -> chunker::ChunkOptions {
        let max_file_mb = options.max_file_size_mb.unwrap_or(self.config.max_file_size_mb);
        chunker::ChunkOptions {
            chunk_size: self.config.chunk_size,
            chunk_overlap: self.config.chunk_overlap,
            exclude_patterns: options.exclude_patterns.clone(),
            include_patterns: options.include_patterns.clone(),
            max_file_bytes: max_file_mb * 1024 * 1024,
        }
    }

    /// Drop a repository's vector collection, working tree, and persisted
    /// metadata. Idempotent.
    pub async fn delete_repository(&self, tenant: &str, repository_id: &str) -> Result<()> {
        indexer::delete_index(&self.vectors, &self.work_dir, repository_id).await?;
        if let Some(repo) = self.store.get_repository_metadata(tenant, repository_id) {
            self.store
                .delete_repository_index(tenant, &repo.source.repo_key());
        }
        self.store.delete_repository_metadata(tenant, repository_id);
        Ok(())
    }
}

/// Mutable view of one job's published status; every mutation is written
/// through to the store.
struct JobContext {
    store: Arc<MetaStore>,
    tenant: String,
    status: UploadStatus,
}

impl JobContext {
    fn set_state(&mut self, state: IngestState) {
        self.status.status = IngestionStatus::new(state);
        self.publish();
    }

    fn set_counts(
        &mut self,
        total_files: usize,
        processed_files: usize,
        total_chunks: usize,
        embedded_chunks: usize,
        indexed_chunks: usize,
    ) {
        self.status.progress = IngestionProgress {
            total_files,
            processed_files,
            total_chunks,
            embedded_chunks,
            indexed_chunks,
            progress_percent: progress_percent(
                total_files,
                processed_files,
                total_chunks,
                embedded_chunks,
                indexed_chunks,
            ),
        };
        self.publish();
    }

    fn fail(&mut self, err: Error) {
        self.status.status = IngestionStatus::new(IngestState::Failed);
        self.status.error_message = Some(err.to_string());
        self.publish();
    }

    fn publish(&mut self) {
        if self.status.status.state == IngestState::Ready {
            self.status.progress.progress_percent = 100.0;
        }
        if let Err(err) = self.store.set_upload_status(&self.tenant, &self.status) {
            tracing::warn!(%err, "failed to publish upload status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_zero_files_is_zero() {
        assert_eq!(progress_percent(0, 0, 0, 0, 0), 0.0);
    }

    #[test]
    fn test_progress_files_only_is_thirty_percent() {
        let p = progress_percent(10, 10, 0, 0, 0);
        assert!((p - 30.0).abs() < 1e-3);
    }

    #[test]
    fn test_progress_after_embedding_is_eighty_percent() {
        let p = progress_percent(10, 10, 100, 100, 0);
        assert!((p - 80.0).abs() < 1e-3);
    }

    #[test]
    fn test_progress_complete_is_hundred() {
        let p = progress_percent(10, 10, 100, 100, 100);
        assert!((p - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_progress_is_monotonic_through_phases() {
        let stages = [
            progress_percent(10, 5, 0, 0, 0),
            progress_percent(10, 10, 100, 0, 0),
            progress_percent(10, 10, 100, 50, 0),
            progress_percent(10, 10, 100, 100, 0),
            progress_percent(10, 10, 100, 100, 50),
            progress_percent(10, 10, 100, 100, 100),
        ];
        for pair in stages.windows(2) {
            assert!(pair[0] <= pair[1], "progress went backwards: {stages:?}");
        }
    }
}
