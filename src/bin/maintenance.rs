//! Retention sweep, intended for a nightly cron slot: hard-deletes expired
//! soft-deleted documents (vectors first) and prunes old terminal jobs.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use corpus::{
    config::AppConfig,
    embedder::{Embedder, OpenAiEmbedder},
    index::HttpVectorIndex,
    llm::OpenAiChat,
    s3::build_client,
    state::{build_pool, AppState, PoolSettings},
    storage::S3Storage,
    workers::consolidate::run_sweep,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        "loaded configuration"
    );

    let pool = build_pool(&config.database_url, PoolSettings::background(1))?;
    let s3_client = build_client(&config).await?;
    let storage = Arc::new(S3Storage::new(s3_client, config.blob_bucket.clone()));
    let embedder = Arc::new(OpenAiEmbedder::new(
        pool.clone(),
        config.llm_endpoint.clone(),
        config.llm_api_key.clone(),
        config.embed_model.clone(),
        config.embed_batch,
        config.embed_requests_per_minute,
        config.monthly_token_budget,
    ));
    let index = Arc::new(HttpVectorIndex::new(
        config.vector_endpoint.clone(),
        config.vector_api_key.clone(),
        config.vector_index_name.clone(),
        config.vector_environment.clone(),
        embedder.dimension(),
    ));
    let chat = Arc::new(OpenAiChat::new(
        config.llm_endpoint.clone(),
        config.llm_api_key.clone(),
        config.chat_model.clone(),
    ));

    let state = Arc::new(AppState::new(
        pool, config, storage, index, embedder, chat, None,
    ));

    let (documents_removed, jobs_pruned) = run_sweep(&state)
        .await
        .map_err(|err| anyhow::anyhow!("sweep failed: {err}"))?;
    tracing::info!(documents_removed, jobs_pruned, "maintenance sweep complete");

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
