//! Vector store client: collection lifecycle, batched upserts, and
//! nearest-vector queries over a Weaviate-shaped REST/GraphQL API.
//!
//! Responses are parsed into typed records at this boundary; untyped JSON
//! never propagates inward.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::VectorConfig;
use crate::error::{Error, Result};
use crate::models::{CodeChunk, SearchFilters, SearchSource};

/// One record as stored in a per-repository collection.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub properties: VectorProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorProperties {
    pub repository_id: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub language: String,
    pub size: usize,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct VectorClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

/// Collection names must be PascalCase alphanumeric: `Repo` plus the
/// repository id stripped of its `repo-` prefix and hyphens.
pub fn collection_name(repository_id: &str) -> String {
    let stripped = repository_id.trim_start_matches("repo-").replace('-', "");
    format!("Repo{stripped}")
}

// ─── Wire types ──────────────────────────────────────────

#[derive(Serialize)]
struct ClassDefinition {
    class: String,
    description: String,
    vectorizer: &'static str,
    properties: Vec<PropertyDefinition>,
    #[serde(rename = "vectorIndexConfig")]
    vector_index_config: serde_json::Value,
}

#[derive(Serialize)]
struct PropertyDefinition {
    name: &'static str,
    #[serde(rename = "dataType")]
    data_type: Vec<&'static str>,
}

#[derive(Serialize)]
struct BatchObjectsRequest {
    objects: Vec<BatchObject>,
}

#[derive(Serialize)]
struct BatchObject {
    class: String,
    properties: VectorProperties,
    vector: Vec<f32>,
}

#[derive(Deserialize)]
struct BatchObjectResult {
    #[serde(default)]
    result: Option<BatchResultBody>,
}

#[derive(Deserialize)]
struct BatchResultBody {
    #[serde(default)]
    errors: Option<BatchErrors>,
}

#[derive(Deserialize)]
struct BatchErrors {
    #[serde(default)]
    error: Vec<BatchErrorDetail>,
}

#[derive(Deserialize)]
struct BatchErrorDetail {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<GraphQlData>,
    #[serde(default)]
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Deserialize)]
struct GraphQlData {
    #[serde(rename = "Get", default)]
    get: HashMap<String, Vec<SemanticHit>>,
}

#[derive(Deserialize)]
struct GraphQlError {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct SemanticHit {
    #[serde(default)]
    file_path: String,
    #[serde(default)]
    start_line: usize,
    #[serde(default)]
    end_line: usize,
    #[serde(default)]
    content: String,
    #[serde(default)]
    language: String,
    #[serde(rename = "_additional", default)]
    additional: Option<AdditionalFields>,
}

#[derive(Deserialize)]
struct AdditionalFields {
    #[serde(default)]
    certainty: Option<f32>,
}

impl VectorClient {
    pub fn new(http: reqwest::Client, config: &VectorConfig) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.timeout(self.timeout);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    // ─── Collection lifecycle ────────────────────────────

    /// Create the collection if it does not exist. Idempotent: an existing
    /// collection is left untouched.
    pub async fn create_collection(&self, name: &str, dimensions: usize) -> Result<()> {
        let check_url = format!("{}/v1/schema/{name}", self.base_url);
        let resp = self
            .request(self.http.get(&check_url))
            .send()
            .await
            .map_err(|e| Error::IndexFailed(format!("vector store unreachable: {e}")))?;

        if resp.status().is_success() {
            return Ok(());
        }
        if resp.status().as_u16() != 404 {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::IndexFailed(format!(
                "collection existence check returned {status}: {body}"
            )));
        }

        let class = ClassDefinition {
            class: name.to_string(),
            description: format!("Code chunks for repository collection {name}"),
            // Vectors are supplied by the indexer, never computed by the store
            vectorizer: "none",
            properties: vec![
                PropertyDefinition {
                    name: "repository_id",
                    data_type: vec!["string"],
                },
                PropertyDefinition {
                    name: "file_path",
                    data_type: vec!["string"],
                },
                PropertyDefinition {
                    name: "start_line",
                    data_type: vec!["int"],
                },
                PropertyDefinition {
                    name: "end_line",
                    data_type: vec!["int"],
                },
                PropertyDefinition {
                    name: "content",
                    data_type: vec!["text"],
                },
                PropertyDefinition {
                    name: "language",
                    data_type: vec!["string"],
                },
                PropertyDefinition {
                    name: "size",
                    data_type: vec!["int"],
                },
                PropertyDefinition {
                    name: "created_at",
                    data_type: vec!["int"],
                },
            ],
            vector_index_config: json!({ "distance": "cosine" }),
        };

        tracing::info!(collection = name, dimensions, "creating vector collection");
        let create_url = format!("{}/v1/schema", self.base_url);
        let resp = self
            .request(self.http.post(&create_url).json(&class))
            .send()
            .await
            .map_err(|e| Error::IndexFailed(format!("vector store unreachable: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::IndexFailed(format!(
                "collection create returned {status}: {body}"
            )));
        }

        Ok(())
    }

    /// Drop a collection. Missing collections are not an error.
    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        let url = format!("{}/v1/schema/{name}", self.base_url);
        let resp = self
            .request(self.http.delete(&url))
            .send()
            .await
            .map_err(|e| Error::IndexFailed(format!("vector store unreachable: {e}")))?;

        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::IndexFailed(format!(
                "collection delete returned {status}: {body}"
            )));
        }

        Ok(())
    }

    // ─── Upserts ─────────────────────────────────────────

    /// Upsert one batch of records. The caller controls batch sizing; a
    /// failed batch fails the operation entirely.
    pub async fn upsert_vectors(&self, collection: &str, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let req = BatchObjectsRequest {
            objects: records
                .into_iter()
                .map(|r| BatchObject {
                    class: collection.to_string(),
                    properties: r.properties,
                    vector: r.vector,
                })
                .collect(),
        };

        let url = format!("{}/v1/batch/objects", self.base_url);
        let resp = self
            .request(self.http.post(&url).json(&req))
            .send()
            .await
            .map_err(|e| Error::IndexFailed(format!("vector store unreachable: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::IndexFailed(format!(
                "batch upsert returned {status}: {body}"
            )));
        }

        let results: Vec<BatchObjectResult> = resp
            .json()
            .await
            .map_err(|e| Error::IndexFailed(format!("invalid batch response: {e}")))?;

        for result in &results {
            if let Some(errors) = result.result.as_ref().and_then(|r| r.errors.as_ref()) {
                if let Some(detail) = errors.error.first() {
                    return Err(Error::IndexFailed(format!(
                        "batch upsert rejected object: {}",
                        detail.message
                    )));
                }
            }
        }

        Ok(())
    }

    // ─── Queries ─────────────────────────────────────────

    /// Nearest-vector search with a certainty floor. Hit certainty maps
    /// directly to chunk score.
    pub async fn search(
        &self,
        repository_id: &str,
        query_vector: &[f32],
        limit: usize,
        filters: &SearchFilters,
        certainty: f32,
    ) -> Result<Vec<CodeChunk>> {
        let collection = collection_name(repository_id);
        let query = build_graphql_query(&collection, repository_id, query_vector, limit, filters, certainty)?;

        let url = format!("{}/v1/graphql", self.base_url);
        let resp = self
            .request(self.http.post(&url).json(&json!({ "query": query })))
            .send()
            .await
            .map_err(|e| Error::RetrieveFailed(format!("vector store unreachable: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::RetrieveFailed(format!(
                "vector query returned {status}: {body}"
            )));
        }

        let body: GraphQlResponse = resp
            .json()
            .await
            .map_err(|e| Error::RetrieveFailed(format!("invalid query response: {e}")))?;

        if let Some(errors) = &body.errors {
            if let Some(first) = errors.first() {
                return Err(Error::RetrieveFailed(format!(
                    "vector query error: {}",
                    first.message
                )));
            }
        }

        let hits = body
            .data
            .and_then(|mut d| d.get.remove(&collection))
            .unwrap_or_default();

        Ok(hits
            .into_iter()
            .filter(|h| !h.file_path.is_empty())
            .map(|h| CodeChunk {
                repository_id: repository_id.to_string(),
                file_path: h.file_path,
                start_line: h.start_line,
                end_line: h.end_line,
                content: h.content,
                language: h.language,
                score: h.additional.and_then(|a| a.certainty).unwrap_or(0.0),
                source: SearchSource::Semantic,
            })
            .collect())
    }

    /// Liveness probe: list the schema.
    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/v1/schema", self.base_url);
        let resp = self
            .request(self.http.get(&url))
            .send()
            .await
            .map_err(|e| Error::Internal(format!("vector store unreachable: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::Internal(format!(
                "vector store health check returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Build the nearVector query. Filters compose into one flat `And` operand
/// list rather than nested pairs.
fn build_graphql_query(
    collection: &str,
    repository_id: &str,
    query_vector: &[f32],
    limit: usize,
    filters: &SearchFilters,
    certainty: f32,
) -> Result<String> {
    let vector_json = serde_json::to_string(query_vector)?;
    let where_clause = build_where_clause(repository_id, filters);

    Ok(format!(
        "{{ Get {{ {collection}(nearVector: {{vector: {vector_json}, certainty: {certainty}}}, \
         limit: {limit}{where_clause}) {{ repository_id file_path start_line end_line content \
         language size _additional {{ certainty }} }} }} }}"
    ))
}

fn build_where_clause(repository_id: &str, filters: &SearchFilters) -> String {
    let mut operands = vec![format!(
        "{{path: [\"repository_id\"], operator: Equal, valueText: \"{}\"}}",
        escape_graphql(repository_id)
    )];

    for language in &filters.languages {
        operands.push(format!(
            "{{path: [\"language\"], operator: Equal, valueText: \"{}\"}}",
            escape_graphql(language)
        ));
    }
    if let Some(prefix) = &filters.path_prefix {
        operands.push(format!(
            "{{path: [\"file_path\"], operator: Like, valueText: \"{}*\"}}",
            escape_graphql(prefix)
        ));
    }

    if operands.len() == 1 {
        format!(", where: {}", operands[0])
    } else {
        format!(
            ", where: {{operator: And, operands: [{}]}}",
            operands.join(", ")
        )
    }
}

fn escape_graphql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
