use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use chrono::Utc;
use corpus::auth::SessionClaims;
use corpus::config::AppConfig;
use corpus::embedder::{EmbedError, Embedder};
use corpus::index::{IndexError, VectorIndex, VectorMatch, VectorRecord};
use corpus::jobs::JobQueueError;
use corpus::llm::{ChatCompletion, ChatMessage, ChatModel, ChatOptions, LlmError, TokenUsage};
use corpus::models::Job;
use corpus::routes;
use corpus::state::{build_pool, AppState, PgPool, PoolSettings, DEFAULT_MAX_POOL_SIZE};
use corpus::storage::ObjectStorage;
use corpus::workers::default_handlers;
use corpus::Worker;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub const TEST_SESSION_SECRET: &str = "test-secret";
pub const FAKE_DIMENSION: usize = 8;

#[allow(dead_code)]
#[derive(Clone)]
pub struct StoredObject {
    pub key: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, StoredObject>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<()> {
        let stored = StoredObject {
            key: key.to_string(),
            bytes,
            content_type,
        };
        let mut guard = self.objects.lock().await;
        guard.insert(stored.key.clone(), stored);
        Ok(())
    }

    async fn presign_get_object(&self, key: &str, expires_in: Duration) -> Result<String> {
        let guard = self.objects.lock().await;
        ensure!(guard.contains_key(key), "object {key} missing");
        Ok(format!(
            "https://fake-storage/{key}?expires_in={}",
            expires_in.as_secs()
        ))
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let guard = self.objects.lock().await;
        guard
            .get(key)
            .map(|obj| obj.bytes.clone())
            .ok_or_else(|| anyhow!("object {key} missing"))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let mut guard = self.objects.lock().await;
        guard.remove(key);
        Ok(())
    }
}

impl FakeStorage {
    #[allow(dead_code)]
    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }
}

/// Deterministic text embedding: a normalized byte-class histogram. Similar
/// text maps to nearby vectors, so cosine ranking behaves sensibly without
/// any network dependency.
pub fn fake_embedding(text: &str) -> Vec<f32> {
    let mut histogram = vec![0f32; FAKE_DIMENSION];
    for byte in text
        .to_lowercase()
        .bytes()
        .filter(|b| b.is_ascii_alphanumeric())
    {
        histogram[(byte as usize) % FAKE_DIMENSION] += 1.0;
    }
    let norm = histogram.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut histogram {
            *value /= norm;
        }
    }
    histogram
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[derive(Default)]
pub struct FakeEmbedder {
    /// When set, the next embed call fails with this error once.
    pub fail_next: Mutex<Option<EmbedError>>,
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String], _org_id: i64) -> Result<Vec<Vec<f32>>, EmbedError> {
        if let Some(err) = self.fail_next.lock().await.take() {
            return Err(err);
        }
        Ok(texts.iter().map(|text| fake_embedding(text)).collect())
    }

    fn dimension(&self) -> usize {
        FAKE_DIMENSION
    }
}

#[derive(Default)]
pub struct FakeVectorIndex {
    namespaces: Mutex<HashMap<String, HashMap<String, (Vec<f32>, Value)>>>,
}

impl FakeVectorIndex {
    #[allow(dead_code)]
    pub async fn vector_count(&self, namespace: &str) -> usize {
        self.namespaces
            .lock()
            .await
            .get(namespace)
            .map(|ns| ns.len())
            .unwrap_or(0)
    }

    #[allow(dead_code)]
    pub async fn vector_ids(&self, namespace: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .namespaces
            .lock()
            .await
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

fn filter_matches(filter: &Value, metadata: &Value) -> bool {
    let Some(conditions) = filter.as_object() else {
        return true;
    };
    conditions.iter().all(|(key, condition)| {
        let expected = condition.get("$eq").unwrap_or(condition);
        match metadata.get(key) {
            Some(actual) => actual == expected,
            None => false,
        }
    })
}

#[async_trait]
impl VectorIndex for FakeVectorIndex {
    async fn upsert(&self, namespace: &str, records: Vec<VectorRecord>) -> Result<(), IndexError> {
        let mut guard = self.namespaces.lock().await;
        let ns = guard.entry(namespace.to_string()).or_default();
        for record in records {
            ns.insert(record.id, (record.values, record.metadata));
        }
        Ok(())
    }

    async fn search(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
        filter: Option<Value>,
    ) -> Result<Vec<VectorMatch>, IndexError> {
        let guard = self.namespaces.lock().await;
        let Some(ns) = guard.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<VectorMatch> = ns
            .iter()
            .filter(|(_, (_, metadata))| {
                filter
                    .as_ref()
                    .map(|f| filter_matches(f, metadata))
                    .unwrap_or(true)
            })
            .map(|(id, (values, metadata))| VectorMatch {
                id: id.clone(),
                score: cosine(query, values),
                metadata: metadata.clone(),
            })
            .collect();
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete_document(&self, namespace: &str, doc_id: Uuid) -> Result<(), IndexError> {
        let prefix = format!("doc_{doc_id}_chunk_");
        let mut guard = self.namespaces.lock().await;
        if let Some(ns) = guard.get_mut(namespace) {
            ns.retain(|id, _| !id.starts_with(&prefix));
        }
        Ok(())
    }

    async fn delete_vector(&self, namespace: &str, vector_id: &str) -> Result<(), IndexError> {
        let mut guard = self.namespaces.lock().await;
        if let Some(ns) = guard.get_mut(namespace) {
            ns.remove(vector_id);
        }
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), IndexError> {
        self.namespaces.lock().await.remove(namespace);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), IndexError> {
        Ok(())
    }
}

/// Scripted chat model. Without a script it answers by intent: the
/// classifier prompt gets a classification JSON, the planner prompt a plan,
/// everything else a citation-bearing answer.
#[derive(Default)]
pub struct FakeChatModel {
    scripted: Mutex<std::collections::VecDeque<String>>,
}

impl FakeChatModel {
    #[allow(dead_code)]
    pub async fn push_response(&self, response: impl Into<String>) {
        self.scripted.lock().await.push_back(response.into());
    }
}

#[async_trait]
impl ChatModel for FakeChatModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _options: ChatOptions,
    ) -> Result<ChatCompletion, LlmError> {
        let system = messages
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let content = if system.contains("document classifier") {
            if let Some(scripted) = self.scripted.lock().await.pop_front() {
                scripted
            } else {
                json!({
                    "team": "General",
                    "project": null,
                    "doc_type": "report",
                    "time_period": "2024",
                    "confidentiality": "internal",
                    "people": [],
                    "tags": ["test"],
                    "summary": "A test document.",
                    "confidence": {
                        "team": 0.6, "project": 0.5, "doc_type": 0.8,
                        "time_period": 0.7, "confidentiality": 0.7
                    }
                })
                .to_string()
            }
        } else if system.contains("Decide which sources") {
            json!({
                "needs_documents": true,
                "needs_people": false,
                "needs_external": false
            })
            .to_string()
        } else if let Some(scripted) = self.scripted.lock().await.pop_front() {
            scripted
        } else {
            "Based on the provided context, the answer is in [1].".to_string()
        };

        Ok(ChatCompletion {
            content,
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 20,
                total_tokens: 120,
            },
        })
    }
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    storage: Arc<FakeStorage>,
    index: Arc<FakeVectorIndex>,
    embedder: Arc<FakeEmbedder>,
    chat: Arc<FakeChatModel>,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            session_secret: TEST_SESSION_SECRET.to_string(),
            cors_allowed_origin: None,
            blob_endpoint: None,
            blob_region: "us-east-1".to_string(),
            blob_bucket: "test-bucket".to_string(),
            blob_key: None,
            blob_secret: None,
            vector_api_key: "test-vector-key".to_string(),
            vector_environment: "us-east-1".to_string(),
            vector_index_name: "test-index".to_string(),
            vector_endpoint: "http://vector.invalid".to_string(),
            llm_api_key: "test-llm-key".to_string(),
            llm_endpoint: "http://llm.invalid".to_string(),
            embed_model: "fake-embedding".to_string(),
            chat_model: "fake-chat".to_string(),
            research_api_key: None,
            max_upload_bytes: 50 * 1024 * 1024,
            chunk_size: 64,
            chunk_overlap: 16,
            embed_batch: 100,
            retrieval_top_k: 10,
            min_score: 0.05,
            monthly_token_budget: 100.0,
            embed_requests_per_minute: 3000,
            extraction_timeout_secs: 60,
            chat_turn_timeout_secs: 30,
        };

        let pool = build_pool(
            &config.database_url,
            PoolSettings::serving(config.database_max_pool_size),
        )?;
        prepare_database(&pool).await?;

        let storage = Arc::new(FakeStorage::default());
        let index = Arc::new(FakeVectorIndex::default());
        let embedder = Arc::new(FakeEmbedder::default());
        let chat = Arc::new(FakeChatModel::default());

        let state = AppState::new(
            pool.clone(),
            config,
            storage.clone(),
            index.clone(),
            embedder.clone(),
            chat.clone(),
            None,
        );
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            storage,
            index,
            embedder,
            chat,
        })
    }

    #[allow(dead_code)]
    pub fn storage(&self) -> Arc<FakeStorage> {
        self.storage.clone()
    }

    #[allow(dead_code)]
    pub fn index(&self) -> Arc<FakeVectorIndex> {
        self.index.clone()
    }

    #[allow(dead_code)]
    pub fn embedder(&self) -> Arc<FakeEmbedder> {
        self.embedder.clone()
    }

    #[allow(dead_code)]
    pub fn chat(&self) -> Arc<FakeChatModel> {
        self.chat.clone()
    }

    /// Signed session token the external auth service would mint.
    pub fn session_token(&self, user_id: i64, org_id: i64, role: &str) -> String {
        let claims = SessionClaims {
            sub: user_id,
            org_id,
            role: role.to_string(),
            exp: Utc::now().timestamp() + 3600,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(TEST_SESSION_SECRET.as_bytes()),
        )
        .expect("failed to mint session token")
    }

    /// Drains the job queue in-process until no runnable job remains.
    pub async fn run_worker_until_idle(&self) -> Result<()> {
        let worker = Worker::new(
            Arc::new(self.state.clone()),
            default_handlers(),
            Duration::from_millis(10),
        );
        // Retried jobs are scheduled into the future; a bounded number of
        // ticks keeps tests finite.
        for _ in 0..50 {
            match worker.tick().await {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(JobQueueError::Database(err)) => return Err(anyhow!(err)),
            }
        }
        Ok(())
    }

    #[allow(dead_code)]
    pub async fn jobs_by_type(&self, ty: &str) -> Result<Vec<Job>> {
        let ty = ty.to_string();
        self.with_conn(move |conn| {
            use corpus::schema::jobs::dsl::{job_type as job_type_col, jobs as jobs_table};
            let rows = jobs_table
                .filter(job_type_col.eq(&ty))
                .load::<Job>(conn)
                .context("failed to load jobs")?;
            Ok(rows)
        })
        .await
    }

    pub async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let builder = Request::builder().method(Method::DELETE).uri(path);
        let builder = if let Some(token) = token {
            builder.header("authorization", format!("Bearer {token}"))
        } else {
            builder
        };
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    /// Multipart upload matching `POST /api/documents/upload`.
    pub async fn upload_files(
        &self,
        org_id: i64,
        files: &[(&str, &str, &[u8])],
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();

        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(b"Content-Disposition: form-data; name=\"org_id\"\r\n\r\n".as_slice());
        body.extend(org_id.to_string().as_bytes());
        body.extend(b"\r\n");

        for (filename, content_type, data) in files {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(
                format!(
                    "Content-Disposition: form-data; name=\"files\"; filename=\"{filename}\"\r\n"
                )
                .as_bytes(),
            );
            body.extend(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
            body.extend(*data);
            body.extend(b"\r\n");
        }
        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/documents/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body))?;

        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

pub async fn body_to_json(body: Body) -> Result<Value> {
    let bytes = body_to_vec(body).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE messages, conversations, document_chunks, document_classifications, \
         employee_embeddings, documents, jobs, usage_counters RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
