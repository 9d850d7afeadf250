use std::sync::Arc;
use std::time::Duration;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, Pool, PooledConnection},
};

use crate::{
    classifier::OrgContextCache,
    config::AppConfig,
    embedder::Embedder,
    error::{AppError, AppResult},
    index::VectorIndex,
    llm::{ChatModel, Researcher},
    storage::ObjectStorage,
};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

pub const DEFAULT_MAX_POOL_SIZE: u32 = 4;

/// Connection pool shape differs per binary: the API serves many short
/// queries and keeps a connection warm, the worker and maintenance
/// binaries hold a couple of long-lived ones.
#[derive(Clone, Copy, Debug)]
pub struct PoolSettings {
    pub max_size: u32,
    pub min_idle: Option<u32>,
    pub connection_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl PoolSettings {
    pub fn serving(max_size: u32) -> Self {
        Self {
            max_size: max_size.max(1),
            min_idle: Some(1),
            connection_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }

    pub fn background(max_size: u32) -> Self {
        Self {
            max_size: max_size.max(1),
            min_idle: None,
            connection_timeout: Duration::from_secs(10),
            idle_timeout: None,
        }
    }
}

pub fn build_pool(database_url: &str, settings: PoolSettings) -> anyhow::Result<PgPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let mut builder = Pool::builder()
        .max_size(settings.max_size)
        .min_idle(settings.min_idle)
        .connection_timeout(settings.connection_timeout);
    if settings.idle_timeout.is_some() {
        builder = builder.idle_timeout(settings.idle_timeout);
    }
    let pool = builder.build(manager)?;
    Ok(pool)
}

/// Immutable after startup; cloned freely into handlers and workers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStorage>,
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub chat: Arc<dyn ChatModel>,
    pub researcher: Option<Arc<dyn Researcher>>,
    pub org_context: Arc<OrgContextCache>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatModel>,
        researcher: Option<Arc<dyn Researcher>>,
    ) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            storage,
            index,
            embedder,
            chat,
            researcher,
            org_context: Arc::new(OrgContextCache::default()),
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
