//! Text embedding client with cost accounting.
//!
//! Speaks the OpenAI-compatible `/v1/embeddings` wire format. Every call is
//! metered into `usage_counters` and gated by the tenant's monthly budget.
//! Upstream flakiness is absorbed by exponential backoff and a circuit
//! breaker so a dead provider fails fast instead of tying up workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use diesel::prelude::*;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::schema::usage_counters;
use crate::state::PgPool;

/// USD per 1K tokens for the default embedding model family.
pub const COST_PER_1K_TOKENS: f64 = 0.00013;

pub const MAX_BATCH_SIZE: usize = 100;
const MAX_RETRIES: u32 = 5;
const BACKOFF_BASE_SECS: f64 = 1.0;
const BACKOFF_CAP_SECS: f64 = 60.0;
const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("monthly embedding budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("embedding circuit open: {0}")]
    CircuitOpen(String),
    #[error("embedding upstream error: {0}")]
    Upstream(String),
    #[error("invalid embedding request: {0}")]
    Invalid(String),
    #[error("usage accounting failed: {0}")]
    Accounting(String),
}

impl EmbedError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EmbedError::Upstream(_) | EmbedError::CircuitOpen(_) | EmbedError::Accounting(_)
        )
    }
}

#[async_trait]
pub trait Embedder: Send + Sync + 'static {
    /// Embeds `texts` in order; the result has exactly one vector per input,
    /// each of `dimension()` length.
    async fn embed(&self, texts: &[String], org_id: i64) -> Result<Vec<Vec<f32>>, EmbedError>;

    fn dimension(&self) -> usize;
}

struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    half_open_probe: bool,
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(requests_per_minute: u32) -> Self {
        let capacity = requests_per_minute.max(1) as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    /// Returns how long the caller must wait before the request is admitted.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Duration::ZERO
        } else {
            let deficit = 1.0 - self.tokens;
            self.tokens = 0.0;
            Duration::from_secs_f64(deficit / self.refill_per_sec)
        }
    }
}

pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimension: usize,
    batch_size: usize,
    monthly_budget: f64,
    pool: PgPool,
    breaker: Mutex<BreakerState>,
    bucket: Mutex<TokenBucket>,
}

impl OpenAiEmbedder {
    pub fn new(
        pool: PgPool,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        batch_size: usize,
        requests_per_minute: u32,
        monthly_budget: f64,
    ) -> Self {
        let model = model.into();
        let dimension = model_dimension(&model);
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build embeddings HTTP client"),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model,
            dimension,
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
            monthly_budget,
            pool,
            breaker: Mutex::new(BreakerState {
                consecutive_failures: 0,
                open_until: None,
                half_open_probe: false,
            }),
            bucket: Mutex::new(TokenBucket::new(requests_per_minute)),
        }
    }

    async fn check_breaker(&self) -> Result<(), EmbedError> {
        let mut breaker = self.breaker.lock().await;
        if let Some(open_until) = breaker.open_until {
            if Instant::now() < open_until {
                return Err(EmbedError::CircuitOpen(format!(
                    "cooling down for {}s after {} consecutive failures",
                    open_until.duration_since(Instant::now()).as_secs(),
                    breaker.consecutive_failures
                )));
            }
            // Cool-down elapsed: admit a single probe call.
            if breaker.half_open_probe {
                return Err(EmbedError::CircuitOpen(
                    "half-open probe already in flight".to_string(),
                ));
            }
            breaker.half_open_probe = true;
        }
        Ok(())
    }

    async fn record_success(&self) {
        let mut breaker = self.breaker.lock().await;
        breaker.consecutive_failures = 0;
        breaker.open_until = None;
        breaker.half_open_probe = false;
    }

    async fn record_failure(&self) {
        let mut breaker = self.breaker.lock().await;
        breaker.consecutive_failures += 1;
        breaker.half_open_probe = false;
        if breaker.consecutive_failures >= BREAKER_THRESHOLD {
            warn!(
                failures = breaker.consecutive_failures,
                "embedding circuit opened"
            );
            breaker.open_until = Some(Instant::now() + BREAKER_COOLDOWN);
        }
    }

    async fn check_budget(&self, org_id: i64, estimated_tokens: i64) -> Result<(), EmbedError> {
        let pool = self.pool.clone();
        let budget = self.monthly_budget;
        let estimated_cost = estimated_tokens as f64 / 1000.0 * COST_PER_1K_TOKENS;

        let month_to_date = tokio::task::spawn_blocking(move || -> Result<f64, String> {
            let mut conn = pool.get().map_err(|err| err.to_string())?;
            let today = Utc::now().date_naive();
            let month_start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
                .ok_or_else(|| "invalid month start".to_string())?;
            let spent: Option<f64> = usage_counters::table
                .filter(usage_counters::org_id.eq(org_id))
                .filter(usage_counters::date.ge(month_start))
                .select(diesel::dsl::sum(usage_counters::estimated_cost))
                .first(&mut conn)
                .map_err(|err| err.to_string())?;
            Ok(spent.unwrap_or(0.0))
        })
        .await
        .map_err(|err| EmbedError::Accounting(err.to_string()))?
        .map_err(EmbedError::Accounting)?;

        if month_to_date + estimated_cost > budget {
            return Err(EmbedError::BudgetExceeded(format!(
                "month-to-date ${month_to_date:.2} + ${estimated_cost:.4} exceeds ${budget:.2}"
            )));
        }
        Ok(())
    }

    async fn track_usage(&self, org_id: i64, tokens: i64) {
        let pool = self.pool.clone();
        let cost = tokens as f64 / 1000.0 * COST_PER_1K_TOKENS;
        let outcome = tokio::task::spawn_blocking(move || -> Result<(), String> {
            use diesel::upsert::excluded;

            let mut conn = pool.get().map_err(|err| err.to_string())?;
            diesel::insert_into(usage_counters::table)
                .values((
                    usage_counters::org_id.eq(org_id),
                    usage_counters::date.eq(Utc::now().date_naive()),
                    usage_counters::tokens.eq(tokens),
                    usage_counters::api_calls.eq(1_i64),
                    usage_counters::estimated_cost.eq(cost),
                ))
                .on_conflict((usage_counters::org_id, usage_counters::date))
                .do_update()
                .set((
                    usage_counters::tokens
                        .eq(usage_counters::tokens + excluded(usage_counters::tokens)),
                    usage_counters::api_calls.eq(usage_counters::api_calls + 1_i64),
                    usage_counters::estimated_cost
                        .eq(usage_counters::estimated_cost + excluded(usage_counters::estimated_cost)),
                ))
                .execute(&mut conn)
                .map_err(|err| err.to_string())?;
            Ok(())
        })
        .await;

        if let Err(err) = outcome.unwrap_or_else(|join| Err(join.to_string())) {
            // Accounting is best-effort after the fact; the budget gate ran
            // before the call.
            warn!(error = %err, org_id, "failed to record embedding usage");
        }
    }

    async fn call_with_retries(
        &self,
        batch: &[String],
        org_id: i64,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut last_error = EmbedError::Upstream("no attempts made".to_string());

        for attempt in 0..MAX_RETRIES {
            self.check_breaker().await?;

            let wait = self.bucket.lock().await.reserve();
            if !wait.is_zero() {
                debug!(wait_ms = wait.as_millis() as u64, "embedding rate limited");
                tokio::time::sleep(wait).await;
            }

            match self.call_once(batch).await {
                Ok(response) => {
                    self.record_success().await;
                    self.track_usage(org_id, response.usage.total_tokens).await;

                    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(response.data.len());
                    let mut data = response.data;
                    data.sort_by_key(|item| item.index);
                    for item in data {
                        if item.embedding.len() != self.dimension {
                            return Err(EmbedError::Invalid(format!(
                                "expected {}-dimensional vector, got {}",
                                self.dimension,
                                item.embedding.len()
                            )));
                        }
                        vectors.push(item.embedding);
                    }
                    if vectors.len() != batch.len() {
                        return Err(EmbedError::Invalid(format!(
                            "requested {} embeddings, got {}",
                            batch.len(),
                            vectors.len()
                        )));
                    }
                    return Ok(vectors);
                }
                Err(err) if err.is_transient() => {
                    self.record_failure().await;
                    last_error = err;
                    if attempt + 1 < MAX_RETRIES {
                        let backoff = backoff_with_jitter(attempt);
                        warn!(
                            attempt = attempt + 1,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %last_error,
                            "embedding call failed; backing off"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(err) => {
                    self.record_failure().await;
                    return Err(err);
                }
            }
        }

        Err(last_error)
    }

    async fn call_once(&self, batch: &[String]) -> Result<EmbeddingResponse, EmbedError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: batch,
        };

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| EmbedError::Upstream(err.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Upstream(format!(
                "embeddings endpoint returned {status}: {body}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Invalid(format!(
                "embeddings endpoint returned {status}: {body}"
            )));
        }

        response
            .json::<EmbeddingResponse>()
            .await
            .map_err(|err| EmbedError::Invalid(format!("malformed embeddings response: {err}")))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String], org_id: i64) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let estimated_tokens: i64 = texts.iter().map(|t| (t.len() / 4).max(1) as i64).sum();
        self.check_budget(org_id, estimated_tokens).await?;

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self.call_with_retries(batch, org_id).await?;
            all.extend(vectors);
        }
        Ok(all)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn model_dimension(model: &str) -> usize {
    match model {
        "text-embedding-3-small" => 1536,
        "text-embedding-ada-002" => 1536,
        _ => 3072,
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_SECS * 2_f64.powi(attempt as i32);
    let capped = exp.min(BACKOFF_CAP_SECS);
    let jittered = rand::thread_rng().gen_range(0.0..=capped);
    Duration::from_secs_f64(jittered.max(0.05))
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    usage: EmbeddingUsage,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingUsage {
    total_tokens: i64,
}

pub type SharedEmbedder = Arc<dyn Embedder>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_admits_up_to_capacity_immediately() {
        let mut bucket = TokenBucket::new(60);
        for _ in 0..60 {
            assert_eq!(bucket.reserve(), Duration::ZERO);
        }
        assert!(bucket.reserve() > Duration::ZERO);
    }

    #[test]
    fn backoff_stays_under_cap() {
        for attempt in 0..10 {
            assert!(backoff_with_jitter(attempt) <= Duration::from_secs_f64(BACKOFF_CAP_SECS));
        }
    }

    #[test]
    fn known_models_report_dimensions() {
        assert_eq!(model_dimension("text-embedding-3-large"), 3072);
        assert_eq!(model_dimension("text-embedding-3-small"), 1536);
    }
}
