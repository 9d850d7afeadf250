use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use corpus::{
    config::AppConfig,
    embedder::{Embedder, OpenAiEmbedder},
    index::HttpVectorIndex,
    llm::{HttpResearcher, OpenAiChat, Researcher},
    routes,
    s3::build_client,
    state::{build_pool, AppState, PoolSettings},
    storage::S3Storage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "api",
        database_url = %config.redacted_database_url(),
        blob_bucket = %config.blob_bucket,
        vector_index = %config.vector_index_name,
        embed_model = %config.embed_model,
        chat_model = %config.chat_model,
        research_enabled = config.research_api_key.is_some(),
        "loaded configuration"
    );

    let pool = build_pool(
        &config.database_url,
        PoolSettings::serving(config.database_max_pool_size),
    )?;
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

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let state = AppState::new(pool, config, storage, index, embedder, chat, researcher);
    let router = routes::create_router(state);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "api server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("api server received shutdown signal");
        })
        .await?;

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
