//! Indexing: embed chunk payloads and upsert the vectors into the
//! repository's collection.

use chrono::Utc;
use std::path::Path;

use crate::error::{Error, Result};
use crate::llm::embeddings::EmbeddingClient;
use crate::models::{Chunk, EmbeddedChunk};
use crate::search::semantic::{collection_name, VectorClient, VectorProperties, VectorRecord};

/// Records per upsert batch.
const UPSERT_BATCH_SIZE: usize = 100;
/// Chunks per embedding round-trip.
const EMBED_BATCH_SIZE: usize = 64;

/// Textual payload submitted to the embedding service for one chunk.
pub fn embedding_payload(chunk: &Chunk) -> String {
    format!(
        "File: {}\nLanguage: {}\nContent:\n{}",
        chunk.file_path, chunk.language, chunk.content
    )
}

/// Embed all chunks, reporting the cumulative embedded count after every
/// batch. The embedding client enforces the one-vector-per-input invariant.
pub async fn embed_chunks(
    client: &EmbeddingClient,
    chunks: Vec<Chunk>,
    mut on_progress: impl FnMut(usize),
) -> Result<Vec<EmbeddedChunk>> {
    if chunks.is_empty() {
        return Ok(Vec::new());
    }

    let model = client.model().to_string();
    let mut embedded = Vec::with_capacity(chunks.len());

    for batch in chunks.chunks(EMBED_BATCH_SIZE) {
        let payloads: Vec<String> = batch.iter().map(embedding_payload).collect();
        let vectors = client.embed_batch(&payloads).await?;

        if vectors.len() != batch.len() {
            return Err(Error::Internal(format!(
                "embedding count mismatch: got {}, expected {}",
                vectors.len(),
                batch.len()
            )));
        }

        for (chunk, embedding) in batch.iter().cloned().zip(vectors) {
            embedded.push(EmbeddedChunk {
                chunk,
                embedding,
                model: model.clone(),
            });
        }
        on_progress(embedded.len());
    }

    Ok(embedded)
}

/// Create the per-repository collection (idempotent) and upsert all
/// embedded chunks in batches. Any failed batch fails the job; there is no
/// partial-success resume.
pub async fn index_embeddings(
    client: &VectorClient,
    repository_id: &str,
    embedded: &[EmbeddedChunk],
    mut on_progress: impl FnMut(usize),
) -> Result<()> {
    if embedded.is_empty() {
        return Ok(());
    }

    let dimensions = embedded[0].embedding.len();
    let collection = collection_name(repository_id);
    client.create_collection(&collection, dimensions).await?;

    let created_at = Utc::now().timestamp();
    let mut indexed = 0usize;

    for batch in embedded.chunks(UPSERT_BATCH_SIZE) {
        let records: Vec<VectorRecord> = batch
            .iter()
            .map(|e| VectorRecord {
                id: e.chunk.id.clone(),
                vector: e.embedding.clone(),
                properties: VectorProperties {
                    repository_id: e.chunk.repository_id.clone(),
                    file_path: e.chunk.file_path.clone(),
                    start_line: e.chunk.start_line,
                    end_line: e.chunk.end_line,
                    content: e.chunk.content.clone(),
                    language: e.chunk.language.clone(),
                    size: e.chunk.size,
                    created_at,
                },
            })
            .collect();

        client.upsert_vectors(&collection, records).await?;
        indexed += batch.len();
        on_progress(indexed);
    }

    Ok(())
}

/// Drop the repository's collection and its working tree. Idempotent.
pub async fn delete_index(
    client: &VectorClient,
    work_dir: &Path,
    repository_id: &str,
) -> Result<()> {
    client
        .delete_collection(&collection_name(repository_id))
        .await?;

    let work_path = work_dir.join(repository_id);
    if work_path.exists() {
        std::fs::remove_dir_all(&work_path)
            .map_err(|e| Error::Internal(format!("failed to remove working tree: {e}")))?;
    }

    Ok(())
}
