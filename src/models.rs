use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a repository came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepoSource {
    Git {
        url: String,
        #[serde(rename = "ref")]
        git_ref: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        commit_sha: Option<String>,
    },
    Archive {
        filename: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        content_hash: Option<String>,
    },
}

impl RepoSource {
    /// Human-readable repository name derived from the source descriptor.
    pub fn display_name(&self) -> String {
        match self {
            RepoSource::Git { url, .. } => url
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or("repository")
                .trim_end_matches(".git")
                .to_string(),
            RepoSource::Archive { filename, .. } => {
                let base = std::path::Path::new(filename)
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .unwrap_or_else(|| filename.clone());
                base.trim_end_matches(".zip")
                    .trim_end_matches(".tgz")
                    .trim_end_matches(".gz")
                    .trim_end_matches(".tar")
                    .to_string()
            }
        }
    }

    /// Routing key used to map a source back to its repository id.
    pub fn repo_key(&self) -> String {
        match self {
            RepoSource::Git {
                url,
                git_ref,
                commit_sha,
            } => match commit_sha {
                Some(sha) => format!("{url}@{sha}"),
                None => format!("{url}@{git_ref}"),
            },
            RepoSource::Archive { filename, .. } => filename.clone(),
        }
    }
}

/// A tracked repository's metadata, persisted once ingestion succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub repository_id: String,
    pub name: String,
    pub source: RepoSource,
    pub ingestion_status: IngestionStatus,
    pub stats: RepoStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoStats {
    pub total_files: usize,
    pub total_lines: usize,
    pub total_chunks: usize,
    pub size_bytes: u64,
    pub languages: Vec<LanguageStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageStats {
    pub language: String,
    pub file_count: usize,
    pub line_count: usize,
}

// ─── Ingestion ───────────────────────────────────────────

/// Ingestion pipeline states. Transitions are monotonic; `Ready` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Pending,
    Extracting,
    Chunking,
    Embedding,
    Indexing,
    Ready,
    Failed,
}

impl IngestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestState::Ready | IngestState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionStatus {
    pub state: IngestState,
    pub updated_at: DateTime<Utc>,
}

impl IngestionStatus {
    pub fn new(state: IngestState) -> Self {
        Self {
            state,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionProgress {
    pub total_files: usize,
    pub processed_files: usize,
    pub total_chunks: usize,
    pub embedded_chunks: usize,
    pub indexed_chunks: usize,
    pub progress_percent: f32,
}

/// The cached record a caller polls while ingestion runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadStatus {
    pub upload_id: String,
    pub repository_id: String,
    pub status: IngestionStatus,
    pub progress: IngestionProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied ingestion knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadOptions {
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub max_file_size_mb: Option<u64>,
}

/// A file discovered in the extracted working tree. Ephemeral; lives for
/// the duration of a single ingestion.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub language: String,
    pub is_text: bool,
    pub is_binary: bool,
    pub line_count: usize,
    pub modified_at: DateTime<Utc>,
}

/// The atomic retrieval unit: a fixed window of lines from one file.
/// `start_line`/`end_line` are 1-based and inclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub repository_id: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub language: String,
    pub size: usize,
    pub hash: String,
}

/// A chunk plus its embedding vector. All embedded chunks for a repository
/// share the same dimensionality.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
    pub model: String,
}

// ─── Retrieval ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchSource {
    Lexical,
    Semantic,
    Merged,
}

/// A retrieval result. `score` is normalized to [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChunk {
    pub repository_id: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub language: String,
    pub score: f32,
    pub source: SearchSource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchTimings {
    pub lexical_ms: u64,
    pub semantic_ms: u64,
    pub merge_ms: u64,
    pub composition_ms: u64,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchStats {
    pub lexical_candidates: usize,
    pub semantic_candidates: usize,
    pub merged_results: usize,
    pub results_truncated: bool,
    pub lexical_failed: bool,
    pub semantic_failed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub file_patterns: Vec<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.languages.is_empty() && self.file_patterns.is_empty() && self.path_prefix.is_none()
    }
}

// ─── Chat ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_true")]
    pub stream_tokens: bool,
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            stream_tokens: true,
            model: None,
        }
    }
}

fn default_max_results() -> usize {
    10
}

fn default_true() -> bool {
    true
}

/// A source reference emitted alongside a composed answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub file_path: String,
    pub line_number: usize,
    pub excerpt: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_source_display_name() {
        let src = RepoSource::Git {
            url: "https://github.com/acme/widgets.git".into(),
            git_ref: "main".into(),
            commit_sha: None,
        };
        assert_eq!(src.display_name(), "widgets");
    }

    #[test]
    fn test_archive_source_display_name() {
        let src = RepoSource::Archive {
            filename: "uploads/widgets.tar.gz".into(),
            content_hash: None,
        };
        assert_eq!(src.display_name(), "widgets");
    }

    #[test]
    fn test_repo_key_prefers_commit_sha() {
        let src = RepoSource::Git {
            url: "https://host/x/y.git".into(),
            git_ref: "main".into(),
            commit_sha: Some("abc123".into()),
        };
        assert_eq!(src.repo_key(), "https://host/x/y.git@abc123");
    }

    #[test]
    fn test_repo_key_falls_back_to_ref() {
        let src = RepoSource::Git {
            url: "https://host/x/y.git".into(),
            git_ref: "develop".into(),
            commit_sha: None,
        };
        assert_eq!(src.repo_key(), "https://host/x/y.git@develop");
    }

    #[test]
    fn test_terminal_states() {
        assert!(IngestState::Ready.is_terminal());
        assert!(IngestState::Failed.is_terminal());
        assert!(!IngestState::Pending.is_terminal());
        assert!(!IngestState::Embedding.is_terminal());
    }

    #[test]
    fn test_chat_options_defaults() {
        let opts: ChatOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.max_results, 10);
        assert!(opts.stream_tokens);
        assert!(opts.model.is_none());
    }

    #[test]
    fn test_ingest_state_serializes_snake_case() {
        let json = serde_json::to_string(&IngestState::Extracting).unwrap();
        assert_eq!(json, "\"extracting\"");
    }
}
