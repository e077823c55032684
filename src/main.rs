use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tracing_subscriber::EnvFilter;

use repo_context::api;
use repo_context::config::Config;
use repo_context::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!(
        "Embedding model: {} ({})",
        config.embedding.model,
        config.embedding.base_url
    );
    tracing::info!("LLM model: {} ({})", config.llm.model, config.llm.base_url);

    let state = AppState::new(config.clone())?;

    let app = Router::new()
        .route("/api/repos/git", post(api::upload::upload_git))
        .route("/api/repos/archive", post(api::upload::upload_archive))
        .route("/api/uploads/{upload_id}", get(api::upload::get_upload_status))
        .route("/api/repos", get(api::repos::list_repositories))
        .route("/api/repos/{id}", get(api::repos::get_repository))
        .route("/api/repos/{id}", delete(api::repos::delete_repository))
        .route("/api/search", post(api::search::search))
        .route("/api/chat", get(api::chat::chat))
        .route("/api/health", get(api::health::check))
        .route("/api/ping", get(api::health::ping))
        // Archive uploads are bounded by config, not axum's 2 MB default
        .layer(DefaultBodyLimit::max(
            config.ingest.max_upload_bytes as usize + 4096,
        ))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
