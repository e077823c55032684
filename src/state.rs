use std::sync::Arc;
use std::time::Duration;

use crate::cache::MetaStore;
use crate::chat::ChatService;
use crate::config::Config;
use crate::error::Result;
use crate::ingest::IngestWorker;
use crate::llm::composer::Composer;
use crate::llm::embeddings::EmbeddingClient;
use crate::ratelimit::{spawn_reaper, RateLimiter};
use crate::search::lexical::LexicalSearch;
use crate::search::semantic::VectorClient;
use crate::search::Retriever;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<MetaStore>,
    pub ingest: Arc<IngestWorker>,
    pub retriever: Arc<Retriever>,
    pub chat: Arc<ChatService>,
    pub vectors: VectorClient,
    pub lexical: LexicalSearch,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        std::fs::create_dir_all(config.work_dir())?;
        std::fs::create_dir_all(config.staging_dir())?;

        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| crate::error::Error::internal(format!("http client: {e}")))?;

        let store = Arc::new(MetaStore::new(&config.cache));
        let embeddings = EmbeddingClient::new(http_client.clone(), config.embedding.clone())?;
        let vectors = VectorClient::new(http_client.clone(), &config.vector);
        let composer = Composer::new(http_client.clone(), config.llm.clone());
        let lexical = LexicalSearch::new(config.work_dir(), config.search.max_matches_per_file);

        let ingest = Arc::new(IngestWorker::new(
            store.clone(),
            embeddings.clone(),
            vectors.clone(),
            config.ingest.clone(),
            config.work_dir(),
            config.staging_dir(),
        ));

        let retriever = Arc::new(Retriever::new(
            lexical.clone(),
            vectors.clone(),
            embeddings,
            store.clone(),
            config.search.certainty,
        ));

        let chat = Arc::new(ChatService::new(
            store.clone(),
            retriever.clone(),
            Arc::new(composer),
            config.default_tenant.clone(),
            config.chat.default_max_results,
            config.chat.redact_secrets,
        ));

        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        spawn_reaper(rate_limiter.clone(), Duration::from_secs(60));

        Ok(Self {
            config,
            store,
            ingest,
            retriever,
            chat,
            vectors,
            lexical,
            rate_limiter,
        })
    }
}
