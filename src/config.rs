use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where working trees, staged uploads, and other data live
    pub data_dir: PathBuf,
    /// Server bind address
    pub bind_addr: String,
    /// Tenant assumed when a request carries none
    pub default_tenant: String,
    /// Embedding provider configuration
    pub embedding: EmbeddingConfig,
    /// LLM composer configuration
    pub llm: LlmConfig,
    /// Vector store configuration
    pub vector: VectorConfig,
    /// TTLs for the metadata/cache store
    pub cache: CacheTtlConfig,
    /// Ingestion pipeline knobs
    pub ingest: IngestConfig,
    /// Retrieval knobs
    pub search: SearchConfig,
    /// Chat session knobs
    pub chat: ChatConfig,
    /// Per-tenant rate limiting
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Base URL for the OpenAI-compatible embeddings API
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Explicit vector dimension; required for models outside the known table
    pub dimension: Option<usize>,
    /// Max texts per embedding request
    pub batch_size: usize,
    /// Retries on transient failures (429/5xx/transport)
    pub max_retries: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL for the chat-completions API
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub stream_tokens: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Base URL for the vector store REST/GraphQL API
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTtlConfig {
    /// repo_idx / repo_meta entries
    pub routing_secs: u64,
    /// ctx_res merged-result snapshots
    pub query_secs: u64,
    /// upload_status entries
    pub upload_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Bounded concurrency budget for the ingestion worker
    pub max_concurrent: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Per-file size cap applied by the chunker (MB)
    pub max_file_size_mb: u64,
    /// Cumulative archive upload cap (bytes)
    pub max_upload_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub max_results: usize,
    /// Certainty floor for nearest-vector queries
    pub certainty: f32,
    /// Per-file match cap handed to the text-search tool
    pub max_matches_per_file: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub default_max_results: usize,
    /// Redact likely secrets from chunks before they reach the composer
    pub redact_secrets: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:8080".to_string(),
            default_tenant: "local".to_string(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            vector: VectorConfig::default(),
            cache: CacheTtlConfig::default(),
            ingest: IngestConfig::default(),
            search: SearchConfig::default(),
            chat: ChatConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            model: "text-embedding-3-small".to_string(),
            dimension: None,
            batch_size: 64,
            max_retries: 3,
            timeout_secs: 30,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".to_string(),
            api_key: None,
            model: "deepseek-chat".to_string(),
            temperature: 0.1,
            max_tokens: 4096,
            timeout_secs: 60,
            stream_tokens: true,
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8090".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            routing_secs: 24 * 60 * 60,
            query_secs: 5 * 60,
            upload_secs: 15 * 60,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            chunk_size: 100,
            chunk_overlap: 10,
            max_file_size_mb: 10,
            max_upload_bytes: 100 * 1024 * 1024,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: 20,
            certainty: 0.7,
            max_matches_per_file: 1000,
            timeout_secs: 5,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_max_results: 10,
            redact_secrets: false,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 100,
            burst_size: 200,
        }
    }
}

/// Output dimensionality for known embedding models. Unknown models must
/// configure `dimension` explicitly; there is no runtime fallback.
pub fn known_embedding_dimension(model: &str) -> Option<usize> {
    match model {
        "text-embedding-3-small" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        "text-embedding-ada-002" => Some(1536),
        _ => None,
    }
}

impl EmbeddingConfig {
    /// Resolved vector dimension for the configured model.
    pub fn resolved_dimension(&self) -> Result<usize> {
        self.dimension
            .or_else(|| known_embedding_dimension(&self.model))
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "unknown embedding model '{}' and no EMBEDDING_DIM configured",
                    self.model
                ))
            })
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("REPO_CONTEXT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("REPO_CONTEXT_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(tenant) = std::env::var("DEFAULT_TENANT") {
            config.default_tenant = tenant;
        }

        // Embedding provider
        if let Ok(url) = std::env::var("EMBEDDING_BASE_URL") {
            config.embedding.base_url = url;
        }
        if let Ok(key) = std::env::var("EMBEDDING_API_KEY") {
            config.embedding.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            config.embedding.model = model;
        }
        if let Ok(val) = std::env::var("EMBEDDING_DIM") {
            if let Ok(v) = val.parse() {
                config.embedding.dimension = Some(v);
            }
        }
        if let Ok(val) = std::env::var("EMBEDDING_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                config.embedding.batch_size = v;
            }
        }

        // LLM composer
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.llm.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            config.llm.model = model;
        }
        if let Ok(val) = std::env::var("LLM_MAX_TOKENS") {
            if let Ok(v) = val.parse() {
                config.llm.max_tokens = v;
            }
        }
        if let Ok(val) = std::env::var("LLM_TEMPERATURE") {
            if let Ok(v) = val.parse() {
                config.llm.temperature = v;
            }
        }
        if let Ok(val) = std::env::var("LLM_STREAM_TOKENS") {
            if let Ok(v) = val.parse() {
                config.llm.stream_tokens = v;
            }
        }

        // Vector store
        if let Ok(url) = std::env::var("VECTOR_BASE_URL") {
            config.vector.base_url = url;
        }
        if let Ok(key) = std::env::var("VECTOR_API_KEY") {
            config.vector.api_key = Some(key);
        }

        // Cache TTLs
        if let Ok(val) = std::env::var("CACHE_TTL_ROUTING_SECS") {
            if let Ok(v) = val.parse() {
                config.cache.routing_secs = v;
            }
        }
        if let Ok(val) = std::env::var("CACHE_TTL_QUERY_SECS") {
            if let Ok(v) = val.parse() {
                config.cache.query_secs = v;
            }
        }
        if let Ok(val) = std::env::var("CACHE_TTL_UPLOAD_SECS") {
            if let Ok(v) = val.parse() {
                config.cache.upload_secs = v;
            }
        }

        // Ingestion
        if let Ok(val) = std::env::var("INGEST_MAX_CONCURRENT") {
            if let Ok(v) = val.parse() {
                config.ingest.max_concurrent = v;
            }
        }
        if let Ok(val) = std::env::var("INGEST_CHUNK_SIZE") {
            if let Ok(v) = val.parse() {
                config.ingest.chunk_size = v;
            }
        }
        if let Ok(val) = std::env::var("INGEST_CHUNK_OVERLAP") {
            if let Ok(v) = val.parse() {
                config.ingest.chunk_overlap = v;
            }
        }
        if let Ok(val) = std::env::var("INGEST_MAX_UPLOAD_BYTES") {
            if let Ok(v) = val.parse() {
                config.ingest.max_upload_bytes = v;
            }
        }

        // Retrieval
        if let Ok(val) = std::env::var("SEARCH_MAX_RESULTS") {
            if let Ok(v) = val.parse() {
                config.search.max_results = v;
            }
        }
        if let Ok(val) = std::env::var("SEARCH_CERTAINTY") {
            if let Ok(v) = val.parse() {
                config.search.certainty = v;
            }
        }

        // Chat
        if let Ok(val) = std::env::var("CHAT_REDACT_SECRETS") {
            if let Ok(v) = val.parse() {
                config.chat.redact_secrets = v;
            }
        }

        // Rate limiting
        if let Ok(val) = std::env::var("RATE_LIMIT_RPS") {
            if let Ok(v) = val.parse() {
                config.rate_limit.requests_per_second = v;
            }
        }
        if let Ok(val) = std::env::var("RATE_LIMIT_BURST") {
            if let Ok(v) = val.parse() {
                config.rate_limit.burst_size = v;
            }
        }

        config
    }

    /// Reject configurations that cannot work before the server starts.
    pub fn validate(&self) -> Result<()> {
        // No silent model downgrade: the configured embedding model must be
        // known or carry an explicit dimension.
        self.embedding.resolved_dimension()?;

        if self.ingest.chunk_overlap >= self.ingest.chunk_size {
            return Err(Error::InvalidArgument(format!(
                "chunk overlap {} must be smaller than chunk size {}",
                self.ingest.chunk_overlap, self.ingest.chunk_size
            )));
        }
        if self.ingest.max_upload_bytes == 0 {
            return Err(Error::invalid_argument(
                "INGEST_MAX_UPLOAD_BYTES must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.search.certainty) {
            return Err(Error::invalid_argument(
                "SEARCH_CERTAINTY must be within [0, 1]",
            ));
        }
        Ok(())
    }

    /// Per-repository working trees (lexical search roots).
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("repos")
    }

    /// Staging area for uploaded archives.
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }
}
