//! Hybrid retrieval: lexical and semantic backends fanned out in parallel,
//! merged and ranked, with a TTL'd snapshot cache keyed by the normalized
//! query.

pub mod lexical;
pub mod merge;
pub mod semantic;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

use crate::cache::{CachedQueryResult, MetaStore};
use crate::error::{Error, Result};
use crate::llm::embeddings::EmbeddingClient;
use crate::models::{CodeChunk, SearchFilters};
use lexical::LexicalSearch;
use merge::{BackendResults, MergedResults, ResultMerger};
use semantic::VectorClient;

/// Hard ceiling on per-query result counts.
const MAX_LIMIT: usize = 200;

/// The retrieval seam the chat orchestrator depends on.
#[async_trait]
pub trait ContextSearch: Send + Sync {
    async fn search(
        &self,
        tenant: &str,
        repository_id: &str,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<MergedResults>;
}

pub struct Retriever {
    lexical: LexicalSearch,
    semantic: VectorClient,
    embeddings: EmbeddingClient,
    store: Arc<MetaStore>,
    certainty: f32,
}

impl Retriever {
    pub fn new(
        lexical: LexicalSearch,
        semantic: VectorClient,
        embeddings: EmbeddingClient,
        store: Arc<MetaStore>,
        certainty: f32,
    ) -> Self {
        Self {
            lexical,
            semantic,
            embeddings,
            store,
            certainty,
        }
    }

    async fn semantic_search(
        &self,
        repository_id: &str,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<CodeChunk>> {
        let query_vector = self.embeddings.embed_single(query).await?;
        self.semantic
            .search(repository_id, &query_vector, limit, filters, self.certainty)
            .await
    }
}

#[async_trait]
impl ContextSearch for Retriever {
    async fn search(
        &self,
        tenant: &str,
        repository_id: &str,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<MergedResults> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::invalid_argument("query is required"));
        }
        let limit = limit.clamp(1, MAX_LIMIT);

        // Cached snapshots are only valid for unfiltered queries; filters
        // change the candidate set without changing the cache key.
        if filters.is_empty() {
            if let Some(cached) = self
                .store
                .get_query_result(tenant, repository_id, query, limit)
            {
                tracing::debug!(repository_id, "query cache hit");
                let mut timings = cached.timings;
                timings.cache_hit = true;
                return Ok(MergedResults {
                    chunks: cached.chunks,
                    timings,
                    stats: cached.stats,
                });
            }
        }

        // Fan out to both backends concurrently
        let lexical_fut = async {
            let start = Instant::now();
            let result = self.lexical.search(repository_id, query, filters).await;
            (result, start.elapsed().as_millis() as u64)
        };
        let semantic_fut = async {
            let start = Instant::now();
            let result = self
                .semantic_search(repository_id, query, limit, filters)
                .await;
            (result, start.elapsed().as_millis() as u64)
        };
        let ((lexical_result, lexical_ms), (semantic_result, semantic_ms)) =
            tokio::join!(lexical_fut, semantic_fut);

        // Tolerate one backend failing; both failing is a retrieval error.
        let (lexical, semantic) = match (lexical_result, semantic_result) {
            (Err(le), Err(se)) => {
                return Err(Error::RetrieveFailed(format!(
                    "lexical: {le}; semantic: {se}"
                )));
            }
            (lexical, semantic) => (
                lexical
                    .map_err(|e| tracing::warn!(%e, "lexical backend failed"))
                    .ok(),
                semantic
                    .map_err(|e| tracing::warn!(%e, "semantic backend failed"))
                    .ok(),
            ),
        };

        let lexical = lexical.map(|mut chunks| {
            merge::score_lexical_relevance(&mut chunks, query);
            chunks
        });

        let merger = ResultMerger::new(limit);
        let merged = merger.merge_and_rank(BackendResults {
            lexical,
            semantic,
            lexical_ms,
            semantic_ms,
        });

        if filters.is_empty() {
            let snapshot = CachedQueryResult {
                chunks: merged.chunks.clone(),
                timings: merged.timings.clone(),
                stats: merged.stats.clone(),
                cached_at: Utc::now(),
            };
            if let Err(err) = self
                .store
                .set_query_result(tenant, repository_id, query, limit, &snapshot)
            {
                tracing::warn!(%err, "failed to cache query result");
            }
        }

        Ok(merged)
    }
}
