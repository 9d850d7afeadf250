use std::{sync::Arc, time::Duration};

use tokio::signal;
use tracing_subscriber::EnvFilter;

use corpus::{
    config::AppConfig,
    embedder::{Embedder, OpenAiEmbedder},
    default_handlers,
    index::HttpVectorIndex,
    llm::{HttpResearcher, OpenAiChat, Researcher},
    s3::build_client,
    state::{build_pool, AppState, PoolSettings},
    storage::S3Storage,
    Worker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        blob_bucket = %config.blob_bucket,
        vector_index = %config.vector_index_name,
        "loaded configuration"
    );

    let pool = build_pool(&config.database_url, PoolSettings::background(2))?;
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
    let researcher: Option<Arc<dyn Researcher>> = config
        .research_api_key
        .clone()
        .map(|key| Arc::new(HttpResearcher::new(key)) as Arc<dyn Researcher>);

    let state = Arc::new(AppState::new(
        pool, config, storage, index, embedder, chat, researcher,
    ));
    let worker = Worker::new(state, default_handlers(), Duration::from_secs(2));
    let cancel = worker.cancel_flag();

    tokio::select! {
        _ = worker.run() => {}
        _ = signal::ctrl_c() => {
            tracing::info!("worker received shutdown signal");
            cancel.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    }

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
