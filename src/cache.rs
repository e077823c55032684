//! Metadata/cache store: a concurrent, TTL'd key-value map with the
//! namespaced key layout shared by the ingestion pipeline, the retriever,
//! and the chat orchestrator.
//!
//! Keys follow `{purpose}:{tenant}:{id...}` with every user-influenced
//! component sanitized before it reaches a key.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::config::CacheTtlConfig;
use crate::error::Result;
use crate::models::{CodeChunk, Repository, SearchStats, SearchTimings, UploadStatus};

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Merged-results snapshot cached per normalized query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedQueryResult {
    pub chunks: Vec<CodeChunk>,
    pub timings: SearchTimings,
    pub stats: SearchStats,
    pub cached_at: DateTime<Utc>,
}

pub struct MetaStore {
    entries: RwLock<HashMap<String, Entry>>,
    routing_ttl: Duration,
    query_ttl: Duration,
    upload_ttl: Duration,
}

impl MetaStore {
    pub fn new(ttl: &CacheTtlConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            routing_ttl: Duration::from_secs(ttl.routing_secs),
            query_ttl: Duration::from_secs(ttl.query_secs),
            upload_ttl: Duration::from_secs(ttl.upload_secs),
        }
    }

    // ─── Raw operations ──────────────────────────────────

    fn set(&self, key: String, value: String, ttl: Duration) {
        let mut entries = self.entries.write();
        // Opportunistic sweep so dead entries don't accumulate unbounded
        if entries.len() % 256 == 0 {
            let now = Instant::now();
            entries.retain(|_, e| e.expires_at > now);
        }
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read();
        entries.get(key).and_then(|e| {
            if e.expires_at > Instant::now() {
                Some(e.value.clone())
            } else {
                None
            }
        })
    }

    fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// List live values whose key starts with `prefix`.
    fn list_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.expires_at > now)
            .map(|(_, e)| e.value.clone())
            .collect()
    }

    /// Liveness probe; the in-process store is always reachable.
    pub fn ping(&self) -> bool {
        true
    }

    // ─── Repository routing ──────────────────────────────

    pub fn set_repository_index(&self, tenant: &str, repo_key: &str, repository_id: &str) {
        let key = repository_index_key(tenant, repo_key);
        self.set(key, repository_id.to_string(), self.routing_ttl);
    }

    pub fn get_repository_index(&self, tenant: &str, repo_key: &str) -> Option<String> {
        self.get(&repository_index_key(tenant, repo_key))
    }

    pub fn delete_repository_index(&self, tenant: &str, repo_key: &str) {
        self.delete(&repository_index_key(tenant, repo_key));
    }

    // ─── Upload status ───────────────────────────────────

    pub fn set_upload_status(&self, tenant: &str, status: &UploadStatus) -> Result<()> {
        let key = upload_status_key(tenant, &status.upload_id);
        self.set(key, serde_json::to_string(status)?, self.upload_ttl);
        Ok(())
    }

    pub fn get_upload_status(&self, tenant: &str, upload_id: &str) -> Option<UploadStatus> {
        self.get(&upload_status_key(tenant, upload_id))
            .and_then(|v| serde_json::from_str(&v).ok())
    }

    pub fn delete_upload_status(&self, tenant: &str, upload_id: &str) {
        self.delete(&upload_status_key(tenant, upload_id));
    }

    // ─── Query results ───────────────────────────────────

    pub fn set_query_result(
        &self,
        tenant: &str,
        repository_id: &str,
        query: &str,
        top_k: usize,
        result: &CachedQueryResult,
    ) -> Result<()> {
        let key = query_result_key(tenant, repository_id, query, top_k);
        self.set(key, serde_json::to_string(result)?, self.query_ttl);
        Ok(())
    }

    pub fn get_query_result(
        &self,
        tenant: &str,
        repository_id: &str,
        query: &str,
        top_k: usize,
    ) -> Option<CachedQueryResult> {
        self.get(&query_result_key(tenant, repository_id, query, top_k))
            .and_then(|v| serde_json::from_str(&v).ok())
    }

    // ─── Repository metadata ─────────────────────────────

    pub fn set_repository_metadata(&self, tenant: &str, repo: &Repository) -> Result<()> {
        let key = repository_metadata_key(tenant, &repo.repository_id);
        self.set(key, serde_json::to_string(repo)?, self.routing_ttl);
        Ok(())
    }

    pub fn get_repository_metadata(&self, tenant: &str, repository_id: &str) -> Option<Repository> {
        self.get(&repository_metadata_key(tenant, repository_id))
            .and_then(|v| serde_json::from_str(&v).ok())
    }

    pub fn list_repository_metadata(&self, tenant: &str) -> Vec<Repository> {
        let prefix = format!("repo_meta:{}:", sanitize_tenant(tenant));
        self.list_prefix(&prefix)
            .into_iter()
            .filter_map(|v| serde_json::from_str(&v).ok())
            .collect()
    }

    pub fn delete_repository_metadata(&self, tenant: &str, repository_id: &str) {
        self.delete(&repository_metadata_key(tenant, repository_id));
    }
}

// ─── Key builders ────────────────────────────────────────

fn repository_index_key(tenant: &str, repo_key: &str) -> String {
    format!(
        "repo_idx:{}:{}",
        sanitize_tenant(tenant),
        sanitize_repo_key(repo_key)
    )
}

fn upload_status_key(tenant: &str, upload_id: &str) -> String {
    format!(
        "upload_status:{}:{}",
        sanitize_tenant(tenant),
        sanitize_id(upload_id)
    )
}

fn query_result_key(tenant: &str, repository_id: &str, query: &str, top_k: usize) -> String {
    let query_hash = hash_prefix(&normalize_query(query));
    format!(
        "ctx_res:{}:{}|{}|k:{}",
        sanitize_tenant(tenant),
        sanitize_id(repository_id),
        query_hash,
        top_k
    )
}

fn repository_metadata_key(tenant: &str, repository_id: &str) -> String {
    format!(
        "repo_meta:{}:{}",
        sanitize_tenant(tenant),
        sanitize_id(repository_id)
    )
}

// ─── Sanitization ────────────────────────────────────────

fn tenant_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9\-]").unwrap())
}

fn id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9\-_]").unwrap())
}

fn repo_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9\-_/@.]").unwrap())
}

pub fn sanitize_tenant(tenant: &str) -> String {
    tenant_re().replace_all(tenant, "_").into_owned()
}

pub fn sanitize_id(id: &str) -> String {
    id_re().replace_all(id, "_").into_owned()
}

pub fn sanitize_repo_key(repo_key: &str) -> String {
    repo_key_re().replace_all(repo_key, "_").into_owned()
}

/// Normalize a query for cache keying: lowercase, collapse whitespace,
/// strip punctuation other than code-relevant symbols.
pub fn normalize_query(query: &str) -> String {
    static WS: OnceLock<Regex> = OnceLock::new();
    static PUNCT: OnceLock<Regex> = OnceLock::new();
    let ws = WS.get_or_init(|| Regex::new(r"\s+").unwrap());
    let punct = PUNCT.get_or_init(|| Regex::new(r"[^\w\s.\-_()\[\]{}]").unwrap());

    let query = query.to_lowercase();
    let query = query.trim();
    let query = ws.replace_all(query, " ");
    punct.replace_all(&query, "").into_owned()
}

/// First 16 hex chars of the SHA-256 of `s`.
pub fn hash_prefix(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IngestState, IngestionProgress, IngestionStatus};

    fn store() -> MetaStore {
        MetaStore::new(&CacheTtlConfig::default())
    }

    fn sample_status(upload_id: &str) -> UploadStatus {
        UploadStatus {
            upload_id: upload_id.to_string(),
            repository_id: "repo-1".to_string(),
            status: IngestionStatus::new(IngestState::Pending),
            progress: IngestionProgress::default(),
            error_message: None,
            created_at: Utc::now(),
        }
    }

    // ─── Sanitization ────────────────────────────────────

    #[test]
    fn test_sanitize_tenant_strips_specials() {
        assert_eq!(sanitize_tenant("acme-corp"), "acme-corp");
        assert_eq!(sanitize_tenant("a:b|c d"), "a_b_c_d");
    }

    #[test]
    fn test_sanitize_repo_key_keeps_url_chars() {
        let key = sanitize_repo_key("https://host/x/y.git@main");
        assert_eq!(key, "https_//host/x/y.git@main");
    }

    #[test]
    fn test_all_keys_match_allowed_charset() {
        let allowed = Regex::new(r"^[A-Za-z0-9\-_/@.:|]+$").unwrap();
        let keys = [
            repository_index_key("t en:ant", "https://h/x.git@main"),
            upload_status_key("tenant", "up load!"),
            query_result_key("tenant", "repo-1", "how does auth work?", 10),
            repository_metadata_key("tenant", "repo-1"),
        ];
        for key in keys {
            assert!(allowed.is_match(&key), "key not sanitized: {key}");
        }
    }

    // ─── Query normalization ─────────────────────────────

    #[test]
    fn test_normalize_query_collapses_whitespace() {
        assert_eq!(normalize_query("  How   does\tAuth  work "), "how does auth work");
    }

    #[test]
    fn test_normalize_query_keeps_code_symbols() {
        assert_eq!(
            normalize_query("what does main() in app.rs do?"),
            "what does main() in app.rs do"
        );
    }

    #[test]
    fn test_hash_prefix_is_16_hex() {
        let h = hash_prefix("hello");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_equivalent_queries_share_cache_key() {
        let a = query_result_key("t", "repo-1", "How does AUTH work?", 10);
        let b = query_result_key("t", "repo-1", "how   does auth work", 10);
        assert_eq!(a, b);
    }

    // ─── Store behavior ──────────────────────────────────

    #[test]
    fn test_upload_status_roundtrip() {
        let store = store();
        let status = sample_status("up-1");
        store.set_upload_status("tenant", &status).unwrap();

        let loaded = store.get_upload_status("tenant", "up-1").unwrap();
        assert_eq!(loaded.upload_id, "up-1");
        assert_eq!(loaded.repository_id, "repo-1");
        assert_eq!(loaded.status.state, IngestState::Pending);
    }

    #[test]
    fn test_upload_status_is_tenant_scoped() {
        let store = store();
        store.set_upload_status("tenant-a", &sample_status("up-1")).unwrap();
        assert!(store.get_upload_status("tenant-b", "up-1").is_none());
    }

    #[test]
    fn test_expired_entries_are_invisible() {
        let ttl = CacheTtlConfig {
            routing_secs: 0,
            query_secs: 0,
            upload_secs: 0,
        };
        let store = MetaStore::new(&ttl);
        store.set_upload_status("t", &sample_status("up-1")).unwrap();
        assert!(store.get_upload_status("t", "up-1").is_none());
    }

    #[test]
    fn test_routing_roundtrip_and_delete() {
        let store = store();
        store.set_repository_index("t", "https://h/x.git@main", "repo-9");
        assert_eq!(
            store.get_repository_index("t", "https://h/x.git@main").as_deref(),
            Some("repo-9")
        );
        store.delete_repository_index("t", "https://h/x.git@main");
        assert!(store.get_repository_index("t", "https://h/x.git@main").is_none());
    }

    #[test]
    fn test_list_repository_metadata_scoped_by_tenant() {
        let store = store();
        let mk = |id: &str| Repository {
            repository_id: id.to_string(),
            name: id.to_string(),
            source: crate::models::RepoSource::Git {
                url: "https://h/x.git".into(),
                git_ref: "main".into(),
                commit_sha: None,
            },
            ingestion_status: IngestionStatus::new(IngestState::Ready),
            stats: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.set_repository_metadata("a", &mk("repo-1")).unwrap();
        store.set_repository_metadata("a", &mk("repo-2")).unwrap();
        store.set_repository_metadata("b", &mk("repo-3")).unwrap();

        let listed = store.list_repository_metadata("a");
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|r| r.repository_id != "repo-3"));
    }
}
