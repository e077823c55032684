//! Chat orchestrator: owns one bidirectional session, fanning search hits
//! and LLM tokens back to the client in a fixed event order.
//!
//! Inbound messages are a tagged sum type; the first must be `Start`. Each
//! `ChatMessage` runs one retrieve-and-compose cycle emitting
//! `SearchStarted`, `SearchHit*` (early hits first), `CompositionStarted`,
//! `CompositionToken*`, `CompositionComplete`, and `Complete`. Recoverable
//! failures surface as in-session `Error` events; the session survives
//! them. Cancellation propagates to in-flight retrieval and composition at
//! their next suspension point.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::MetaStore;
use crate::error::{Error, Result};
use crate::llm::composer::{extract_citations, Composer, CompositionResult};
use crate::models::{
    ChatOptions, Citation, CodeChunk, IngestState, SearchFilters, SearchStats, SearchTimings,
};
use crate::search::merge;
use crate::search::ContextSearch;

// ─── Protocol ────────────────────────────────────────────

/// Inbound session messages. Unknown tags fail deserialization and are
/// rejected with `INVALID_ARGUMENT` by the transport bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatRequest {
    Start {
        repository_id: String,
        #[serde(default)]
        tenant: Option<String>,
        #[serde(default)]
        options: Option<ChatOptions>,
    },
    ChatMessage {
        query: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    Cancel {
        #[serde(default)]
        session_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitPhase {
    Early,
    Final,
}

/// Outbound session events, delivered in the order produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    SessionStarted {
        session_id: String,
        repository_id: String,
    },
    SearchStarted {
        session_id: String,
        query_id: String,
    },
    SearchHit {
        session_id: String,
        query_id: String,
        phase: HitPhase,
        rank: usize,
        chunk: CodeChunk,
    },
    CompositionStarted {
        session_id: String,
        query_id: String,
        context_chunks: usize,
    },
    CompositionToken {
        session_id: String,
        query_id: String,
        text: String,
    },
    CompositionComplete {
        session_id: String,
        query_id: String,
        full_response: String,
        citations: Vec<Citation>,
    },
    Complete {
        session_id: String,
        query_id: String,
        timings: SearchTimings,
        stats: SearchStats,
    },
    Error {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        query_id: Option<String>,
        error_code: crate::error::ErrorCode,
        error_message: String,
    },
}

/// Number of top results relayed early, before the remainder of the list.
const EARLY_HITS: usize = 3;

// ─── Composition seam ────────────────────────────────────

/// The composition seam the orchestrator depends on. When `tokens` is
/// provided the implementation forwards each content delta through it, in
/// order, before returning the full result.
#[async_trait]
pub trait AnswerComposer: Send + Sync {
    async fn compose(
        &self,
        model: Option<&str>,
        query: &str,
        chunks: &[CodeChunk],
        tokens: Option<mpsc::Sender<String>>,
    ) -> Result<CompositionResult>;
}

#[async_trait]
impl AnswerComposer for Composer {
    async fn compose(
        &self,
        model: Option<&str>,
        query: &str,
        chunks: &[CodeChunk],
        tokens: Option<mpsc::Sender<String>>,
    ) -> Result<CompositionResult> {
        let full_response = match tokens {
            Some(tx) => {
                let mut stream = self.stream_answer(model, query, chunks).await?;
                let mut full = String::new();
                while let Some(delta) = stream.next().await {
                    let delta = delta?;
                    full.push_str(&delta);
                    if tx.send(delta).await.is_err() {
                        // Receiver hung up; finish composing for citations
                        break;
                    }
                }
                full
            }
            None => self.compose_answer(model, query, chunks).await?,
        };

        Ok(CompositionResult {
            citations: extract_citations(&full_response, chunks),
            full_response,
        })
    }
}

// ─── Session orchestration ───────────────────────────────

struct Session {
    id: String,
    repository_id: String,
    tenant: String,
    options: ChatOptions,
}

/// Signals that the outbound side is gone; the session just ends.
struct SessionClosed;

pub struct ChatService {
    store: Arc<MetaStore>,
    search: Arc<dyn ContextSearch>,
    composer: Arc<dyn AnswerComposer>,
    default_tenant: String,
    default_max_results: usize,
    redact_secrets: bool,
}

impl ChatService {
    pub fn new(
        store: Arc<MetaStore>,
        search: Arc<dyn ContextSearch>,
        composer: Arc<dyn AnswerComposer>,
        default_tenant: String,
        default_max_results: usize,
        redact_secrets: bool,
    ) -> Self {
        Self {
            store,
            search,
            composer,
            default_tenant,
            default_max_results,
            redact_secrets,
        }
    }

    /// Drive one session until the inbound stream closes, a `Cancel`
    /// arrives, the cancel token fires, or a protocol error occurs.
    ///
    /// A returned error is a protocol-level rejection (wrong ordering,
    /// repository not ready); the transport bridge reports it and closes.
    pub async fn run_session(
        &self,
        mut inbound: mpsc::Receiver<ChatRequest>,
        outbound: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut session: Option<Session> = None;

        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                request = inbound.recv() => match request {
                    Some(request) => request,
                    // Transport closed
                    None => return Ok(()),
                },
            };

            match request {
                ChatRequest::Start {
                    repository_id,
                    tenant,
                    options,
                } => {
                    if session.is_some() {
                        return Err(Error::invalid_argument(
                            "session already started; Start must be the first and only Start message",
                        ));
                    }
                    let started = self.start_session(repository_id, tenant, options)?;
                    let announce = ChatEvent::SessionStarted {
                        session_id: started.id.clone(),
                        repository_id: started.repository_id.clone(),
                    };
                    if outbound.send(announce).await.is_err() {
                        return Ok(());
                    }
                    session = Some(started);
                }

                ChatRequest::ChatMessage { query, .. } => {
                    let Some(session) = session.as_ref() else {
                        return Err(Error::invalid_argument(
                            "ChatMessage before Start; Start must be the first message",
                        ));
                    };

                    let cycle = self.run_query_cycle(session, &query, &outbound);
                    tokio::select! {
                        // Dropping the cycle future cancels retrieval and
                        // composition at their next suspension point.
                        _ = cancel.cancelled() => return Ok(()),
                        result = cycle => {
                            if result.is_err() {
                                // Outbound closed; nothing left to serve
                                return Ok(());
                            }
                        }
                    }
                }

                ChatRequest::Cancel { .. } => {
                    cancel.cancel();
                    return Ok(());
                }
            }
        }
    }

    fn start_session(
        &self,
        repository_id: String,
        tenant: Option<String>,
        options: Option<ChatOptions>,
    ) -> Result<Session> {
        let tenant = tenant
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.default_tenant.clone());

        let repo = self
            .store
            .get_repository_metadata(&tenant, &repository_id)
            .ok_or_else(|| Error::NotFound(format!("repository {repository_id} not found")))?;

        if repo.ingestion_status.state != IngestState::Ready {
            return Err(Error::FailedPrecondition(format!(
                "repository {} is not ready (state: {:?})",
                repository_id, repo.ingestion_status.state
            )));
        }

        let mut options = options.unwrap_or_default();
        if options.max_results == 0 {
            options.max_results = self.default_max_results;
        }

        let session = Session {
            id: format!("session-{}", Uuid::new_v4()),
            repository_id,
            tenant,
            options,
        };
        tracing::info!(
            session_id = %session.id,
            repository_id = %session.repository_id,
            "chat session started"
        );
        Ok(session)
    }

    /// One retrieve-and-compose cycle. Recoverable failures are reported
    /// as `Error` events and the cycle ends; `Err` here only means the
    /// outbound channel is closed.
    async fn run_query_cycle(
        &self,
        session: &Session,
        query: &str,
        outbound: &mpsc::Sender<ChatEvent>,
    ) -> std::result::Result<(), SessionClosed> {
        let query_id = format!("query-{}", Uuid::new_v4());

        send(
            outbound,
            ChatEvent::SearchStarted {
                session_id: session.id.clone(),
                query_id: query_id.clone(),
            },
        )
        .await?;

        let retrieval = self
            .search
            .search(
                &session.tenant,
                &session.repository_id,
                query,
                session.options.max_results,
                &SearchFilters::default(),
            )
            .await;

        let mut results = match retrieval {
            Ok(results) => results,
            Err(err) => {
                tracing::warn!(session_id = %session.id, %err, "retrieval failed");
                self.send_error(outbound, session, Some(query_id), &err)
                    .await?;
                return Ok(());
            }
        };

        if self.redact_secrets {
            merge::redact_secrets(&mut results.chunks);
        }

        // Early hits: the top 3 in rank order, then the remainder. Fewer
        // than 3 results are all final.
        let chunks = &results.chunks;
        let early = if chunks.len() >= EARLY_HITS {
            EARLY_HITS
        } else {
            0
        };
        for (i, chunk) in chunks.iter().enumerate() {
            send(
                outbound,
                ChatEvent::SearchHit {
                    session_id: session.id.clone(),
                    query_id: query_id.clone(),
                    phase: if i < early {
                        HitPhase::Early
                    } else {
                        HitPhase::Final
                    },
                    rank: i + 1,
                    chunk: chunk.clone(),
                },
            )
            .await?;
        }

        send(
            outbound,
            ChatEvent::CompositionStarted {
                session_id: session.id.clone(),
                query_id: query_id.clone(),
                context_chunks: chunks.len(),
            },
        )
        .await?;

        let compose_start = Instant::now();
        let composition = if session.options.stream_tokens {
            self.compose_streaming(session, &query_id, query, chunks, outbound)
                .await?
        } else {
            self.composer
                .compose(session.options.model.as_deref(), query, chunks, None)
                .await
        };

        match composition {
            Ok(result) => {
                send(
                    outbound,
                    ChatEvent::CompositionComplete {
                        session_id: session.id.clone(),
                        query_id: query_id.clone(),
                        full_response: result.full_response,
                        citations: result.citations,
                    },
                )
                .await?;

                results.timings.composition_ms = compose_start.elapsed().as_millis() as u64;
                send(
                    outbound,
                    ChatEvent::Complete {
                        session_id: session.id.clone(),
                        query_id,
                        timings: results.timings,
                        stats: results.stats,
                    },
                )
                .await?;
            }
            Err(err) => {
                tracing::warn!(session_id = %session.id, %err, "composition failed");
                self.send_error(outbound, session, Some(query_id), &err)
                    .await?;
            }
        }

        Ok(())
    }

    /// Run the composer with a token channel, relaying each delta as a
    /// `CompositionToken` the moment it arrives.
    async fn compose_streaming(
        &self,
        session: &Session,
        query_id: &str,
        query: &str,
        chunks: &[CodeChunk],
        outbound: &mpsc::Sender<ChatEvent>,
    ) -> std::result::Result<Result<CompositionResult>, SessionClosed> {
        let (token_tx, mut token_rx) = mpsc::channel::<String>(32);
        let compose = self.composer.compose(
            session.options.model.as_deref(),
            query,
            chunks,
            Some(token_tx),
        );
        tokio::pin!(compose);

        let result = loop {
            tokio::select! {
                Some(text) = token_rx.recv() => {
                    send(
                        outbound,
                        ChatEvent::CompositionToken {
                            session_id: session.id.clone(),
                            query_id: query_id.to_string(),
                            text,
                        },
                    )
                    .await?;
                }
                result = &mut compose => break result,
            }
        };

        // The composer has returned; flush any tokens still buffered so
        // they precede CompositionComplete.
        while let Ok(text) = token_rx.try_recv() {
            send(
                outbound,
                ChatEvent::CompositionToken {
                    session_id: session.id.clone(),
                    query_id: query_id.to_string(),
                    text,
                },
            )
            .await?;
        }

        Ok(result)
    }

    async fn send_error(
        &self,
        outbound: &mpsc::Sender<ChatEvent>,
        session: &Session,
        query_id: Option<String>,
        err: &Error,
    ) -> std::result::Result<(), SessionClosed> {
        send(
            outbound,
            ChatEvent::Error {
                session_id: session.id.clone(),
                query_id,
                error_code: err.code(),
                error_message: err.to_string(),
            },
        )
        .await
    }
}

async fn send(
    outbound: &mpsc::Sender<ChatEvent>,
    event: ChatEvent,
) -> std::result::Result<(), SessionClosed> {
    outbound.send(event).await.map_err(|_| SessionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MetaStore;
    use crate::config::CacheTtlConfig;
    use crate::models::{
        IngestionStatus, RepoSource, Repository, SearchSource,
    };
    use crate::search::merge::MergedResults;
    use chrono::Utc;

    // ─── Mock collaborators ──────────────────────────────

    struct MockSearch {
        chunks: Vec<CodeChunk>,
        fail: bool,
    }

    #[async_trait]
    impl ContextSearch for MockSearch {
        async fn search(
            &self,
            _tenant: &str,
            _repository_id: &str,
            _query: &str,
            limit: usize,
            _filters: &SearchFilters,
        ) -> Result<MergedResults> {
            if self.fail {
                return Err(Error::RetrieveFailed("both backends failed".into()));
            }
            let mut chunks = self.chunks.clone();
            chunks.truncate(limit);
            Ok(MergedResults {
                stats: SearchStats {
                    merged_results: chunks.len(),
                    ..Default::default()
                },
                timings: SearchTimings::default(),
                chunks,
            })
        }
    }

    struct MockComposer {
        response: String,
        tokens: Vec<String>,
        fail: bool,
    }

    #[async_trait]
    impl AnswerComposer for MockComposer {
        async fn compose(
            &self,
            _model: Option<&str>,
            _query: &str,
            chunks: &[CodeChunk],
            tokens: Option<mpsc::Sender<String>>,
        ) -> Result<CompositionResult> {
            if self.fail {
                return Err(Error::LlmFailed("upstream 502".into()));
            }
            if let Some(tx) = tokens {
                for token in &self.tokens {
                    let _ = tx.send(token.clone()).await;
                }
            }
            Ok(CompositionResult {
                full_response: self.response.clone(),
                citations: extract_citations(&self.response, chunks),
            })
        }
    }

    fn make_chunk(path: &str, rank_score: f32) -> CodeChunk {
        CodeChunk {
            repository_id: "repo-1".into(),
            file_path: path.into(),
            start_line: 1,
            end_line: 10,
            content: format!("contents of {path}"),
            language: "go".into(),
            score: rank_score,
            source: SearchSource::Merged,
        }
    }

    fn ready_store() -> Arc<MetaStore> {
        let store = Arc::new(MetaStore::new(&CacheTtlConfig::default()));
        let repo = Repository {
            repository_id: "repo-1".into(),
            name: "demo".into(),
            source: RepoSource::Git {
                url: "https://h/x.git".into(),
                git_ref: "main".into(),
                commit_sha: None,
            },
            ingestion_status: IngestionStatus::new(IngestState::Ready),
            stats: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.set_repository_metadata("local", &repo).unwrap();
        store
    }

    fn service(
        store: Arc<MetaStore>,
        search: MockSearch,
        composer: MockComposer,
    ) -> ChatService {
        ChatService::new(
            store,
            Arc::new(search),
            Arc::new(composer),
            "local".into(),
            10,
            false,
        )
    }

    async fn collect_events(
        service: ChatService,
        requests: Vec<ChatRequest>,
    ) -> (Result<()>, Vec<ChatEvent>) {
        let (req_tx, req_rx) = mpsc::channel(16);
        let (ev_tx, mut ev_rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();

        for request in requests {
            req_tx.send(request).await.unwrap();
        }
        drop(req_tx);

        let result = service.run_session(req_rx, ev_tx, cancel).await;

        let mut events = Vec::new();
        while let Ok(event) = ev_rx.try_recv() {
            events.push(event);
        }
        (result, events)
    }

    fn start_request() -> ChatRequest {
        ChatRequest::Start {
            repository_id: "repo-1".into(),
            tenant: None,
            options: Some(ChatOptions {
                max_results: 10,
                stream_tokens: true,
                model: None,
            }),
        }
    }

    // ─── Protocol ordering ───────────────────────────────

    #[tokio::test]
    async fn test_message_before_start_is_invalid() {
        let svc = service(
            ready_store(),
            MockSearch { chunks: vec![], fail: false },
            MockComposer { response: String::new(), tokens: vec![], fail: false },
        );
        let (result, _) = collect_events(
            svc,
            vec![ChatRequest::ChatMessage {
                query: "q".into(),
                session_id: None,
            }],
        )
        .await;

        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_double_start_is_invalid() {
        let svc = service(
            ready_store(),
            MockSearch { chunks: vec![], fail: false },
            MockComposer { response: String::new(), tokens: vec![], fail: false },
        );
        let (result, _) = collect_events(svc, vec![start_request(), start_request()]).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_start_on_unknown_repository_is_not_found() {
        let store = Arc::new(MetaStore::new(&CacheTtlConfig::default()));
        let svc = service(
            store,
            MockSearch { chunks: vec![], fail: false },
            MockComposer { response: String::new(), tokens: vec![], fail: false },
        );
        let (result, _) = collect_events(svc, vec![start_request()]).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_start_on_not_ready_repository_is_rejected() {
        let store = Arc::new(MetaStore::new(&CacheTtlConfig::default()));
        let repo = Repository {
            repository_id: "repo-1".into(),
            name: "demo".into(),
            source: RepoSource::Git {
                url: "https://h/x.git".into(),
                git_ref: "main".into(),
                commit_sha: None,
            },
            ingestion_status: IngestionStatus::new(IngestState::Chunking),
            stats: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.set_repository_metadata("local", &repo).unwrap();

        let svc = service(
            store,
            MockSearch { chunks: vec![], fail: false },
            MockComposer { response: String::new(), tokens: vec![], fail: false },
        );
        let (result, _) = collect_events(svc, vec![start_request()]).await;
        assert!(matches!(result, Err(Error::FailedPrecondition(_))));
    }

    // ─── Event order ─────────────────────────────────────

    #[tokio::test]
    async fn test_full_cycle_event_order_with_streaming() {
        let chunks: Vec<CodeChunk> = (0..5)
            .map(|i| make_chunk(&format!("file{i}.go"), 0.9 - i as f32 * 0.1))
            .collect();
        let svc = service(
            ready_store(),
            MockSearch { chunks, fail: false },
            MockComposer {
                response: "See file0.go for details".into(),
                tokens: vec!["See ".into(), "file0.go ".into(), "for details".into()],
                fail: false,
            },
        );

        let (result, events) = collect_events(
            svc,
            vec![
                start_request(),
                ChatRequest::ChatMessage {
                    query: "how does it work".into(),
                    session_id: None,
                },
            ],
        )
        .await;
        assert!(result.is_ok());

        // Skip the session announcement, then check the cycle ordering
        let mut iter = events.iter();
        assert!(matches!(iter.next(), Some(ChatEvent::SessionStarted { .. })));
        assert!(matches!(iter.next(), Some(ChatEvent::SearchStarted { .. })));

        // 3 early hits then 2 final, ranks ascending
        let mut ranks = Vec::new();
        for expected_phase in [
            HitPhase::Early,
            HitPhase::Early,
            HitPhase::Early,
            HitPhase::Final,
            HitPhase::Final,
        ] {
            match iter.next() {
                Some(ChatEvent::SearchHit { phase, rank, .. }) => {
                    assert_eq!(*phase, expected_phase);
                    ranks.push(*rank);
                }
                other => panic!("expected SearchHit, got {other:?}"),
            }
        }
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);

        match iter.next() {
            Some(ChatEvent::CompositionStarted { context_chunks, .. }) => {
                assert_eq!(*context_chunks, 5);
            }
            other => panic!("expected CompositionStarted, got {other:?}"),
        }

        let mut token_count = 0;
        loop {
            match iter.next() {
                Some(ChatEvent::CompositionToken { .. }) => token_count += 1,
                Some(ChatEvent::CompositionComplete {
                    full_response,
                    citations,
                    ..
                }) => {
                    assert_eq!(full_response, "See file0.go for details");
                    assert_eq!(citations.len(), 1);
                    assert_eq!(citations[0].file_path, "file0.go");
                    break;
                }
                other => panic!("expected token or complete, got {other:?}"),
            }
        }
        assert!(token_count >= 1);

        assert!(matches!(iter.next(), Some(ChatEvent::Complete { .. })));
        assert!(iter.next().is_none());
    }

    #[tokio::test]
    async fn test_fewer_than_three_results_are_all_final() {
        let chunks = vec![make_chunk("only.go", 0.9), make_chunk("other.go", 0.8)];
        let svc = service(
            ready_store(),
            MockSearch { chunks, fail: false },
            MockComposer {
                response: "answer".into(),
                tokens: vec!["answer".into()],
                fail: false,
            },
        );

        let (_, events) = collect_events(
            svc,
            vec![
                start_request(),
                ChatRequest::ChatMessage {
                    query: "q".into(),
                    session_id: None,
                },
            ],
        )
        .await;

        let phases: Vec<HitPhase> = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::SearchHit { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect();
        assert_eq!(phases, vec![HitPhase::Final, HitPhase::Final]);
    }

    #[tokio::test]
    async fn test_non_streaming_emits_no_tokens() {
        let chunks = vec![make_chunk("a.go", 0.9)];
        let svc = service(
            ready_store(),
            MockSearch { chunks, fail: false },
            MockComposer {
                response: "full answer".into(),
                tokens: vec![],
                fail: false,
            },
        );

        let (_, events) = collect_events(
            svc,
            vec![
                ChatRequest::Start {
                    repository_id: "repo-1".into(),
                    tenant: None,
                    options: Some(ChatOptions {
                        max_results: 10,
                        stream_tokens: false,
                        model: None,
                    }),
                },
                ChatRequest::ChatMessage {
                    query: "q".into(),
                    session_id: None,
                },
            ],
        )
        .await;

        assert!(!events
            .iter()
            .any(|e| matches!(e, ChatEvent::CompositionToken { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ChatEvent::CompositionComplete { .. })));
    }

    // ─── Failure semantics ───────────────────────────────

    #[tokio::test]
    async fn test_retrieval_failure_emits_error_and_session_survives() {
        let svc = service(
            ready_store(),
            MockSearch { chunks: vec![], fail: true },
            MockComposer {
                response: String::new(),
                tokens: vec![],
                fail: false,
            },
        );

        // Two messages: both should produce Error events, meaning the
        // session accepted the second after the first failed.
        let (result, events) = collect_events(
            svc,
            vec![
                start_request(),
                ChatRequest::ChatMessage { query: "one".into(), session_id: None },
                ChatRequest::ChatMessage { query: "two".into(), session_id: None },
            ],
        )
        .await;
        assert!(result.is_ok());

        let error_count = events
            .iter()
            .filter(|e| matches!(e, ChatEvent::Error { .. }))
            .count();
        assert_eq!(error_count, 2);
    }

    #[tokio::test]
    async fn test_llm_failure_emits_error_event() {
        let chunks = vec![make_chunk("a.go", 0.9)];
        let svc = service(
            ready_store(),
            MockSearch { chunks, fail: false },
            MockComposer {
                response: String::new(),
                tokens: vec![],
                fail: true,
            },
        );

        let (result, events) = collect_events(
            svc,
            vec![
                start_request(),
                ChatRequest::ChatMessage { query: "q".into(), session_id: None },
            ],
        )
        .await;
        assert!(result.is_ok());

        assert!(events.iter().any(|e| matches!(
            e,
            ChatEvent::Error {
                error_code: crate::error::ErrorCode::LlmFailed,
                ..
            }
        )));
        // The failed cycle never completes
        assert!(!events.iter().any(|e| matches!(e, ChatEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn test_cancel_ends_session() {
        let svc = service(
            ready_store(),
            MockSearch { chunks: vec![], fail: false },
            MockComposer {
                response: String::new(),
                tokens: vec![],
                fail: false,
            },
        );

        let (result, events) = collect_events(
            svc,
            vec![start_request(), ChatRequest::Cancel { session_id: None }],
        )
        .await;
        assert!(result.is_ok());
        // Only the session announcement; no query cycle ran
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_token_stops_in_flight_cycle() {
        struct SlowSearch;

        #[async_trait]
        impl ContextSearch for SlowSearch {
            async fn search(
                &self,
                _tenant: &str,
                _repository_id: &str,
                _query: &str,
                _limit: usize,
                _filters: &SearchFilters,
            ) -> Result<MergedResults> {
                // Parks until cancelled via future drop
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                unreachable!("search should have been cancelled");
            }
        }

        let svc = ChatService::new(
            ready_store(),
            Arc::new(SlowSearch),
            Arc::new(MockComposer {
                response: String::new(),
                tokens: vec![],
                fail: false,
            }),
            "local".into(),
            10,
            false,
        );

        let (req_tx, req_rx) = mpsc::channel(4);
        let (ev_tx, mut ev_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        req_tx.send(start_request()).await.unwrap();
        req_tx
            .send(ChatRequest::ChatMessage { query: "q".into(), session_id: None })
            .await
            .unwrap();

        let session_cancel = cancel.clone();
        let handle = tokio::spawn(async move { svc.run_session(req_rx, ev_tx, session_cancel).await });

        // Wait for the cycle to start, then cancel
        let started = ev_rx.recv().await;
        assert!(started.is_some());
        cancel.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("session did not observe cancellation")
            .unwrap();
        assert!(result.is_ok());
    }
}
