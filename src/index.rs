//! Vector index adapter.
//!
//! Namespaced cosine index over HTTP, in the style of serverless vector
//! stores: JSON upsert/query/delete endpoints keyed by an API key header.
//! Each tenant owns the `org_{id}` namespace; nothing in this module ever
//! queries across namespaces.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

pub const UPSERT_BATCH_SIZE: usize = 100;
pub const MAX_TOP_K: usize = 100;
/// Strings in vector metadata are clipped to this many characters.
pub const METADATA_TEXT_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector index upstream error: {0}")]
    Upstream(String),
    #[error("invalid vector index request: {0}")]
    Invalid(String),
}

impl IndexError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexError::Upstream(_))
    }
}

pub fn namespace_for_org(org_id: i64) -> String {
    format!("org_{org_id}")
}

pub fn chunk_vector_id(doc_id: Uuid, chunk_index: i32) -> String {
    format!("doc_{doc_id}_chunk_{chunk_index}")
}

pub fn employee_vector_id(user_id: i64) -> String {
    format!("employee_{user_id}")
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Value,
}

#[async_trait]
pub trait VectorIndex: Send + Sync + 'static {
    async fn upsert(&self, namespace: &str, records: Vec<VectorRecord>) -> Result<(), IndexError>;

    /// Top-k cosine search within one namespace, sorted by descending score.
    async fn search(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
        filter: Option<Value>,
    ) -> Result<Vec<VectorMatch>, IndexError>;

    /// Removes every `doc_{id}_chunk_*` vector for the document.
    async fn delete_document(&self, namespace: &str, doc_id: Uuid) -> Result<(), IndexError>;

    async fn delete_vector(&self, namespace: &str, vector_id: &str) -> Result<(), IndexError>;

    async fn delete_namespace(&self, namespace: &str) -> Result<(), IndexError>;

    async fn health_check(&self) -> Result<(), IndexError>;
}

/// Keeps only what the index accepts as metadata: scalars and flat arrays of
/// scalars. Nested objects are JSON-stringified, nulls dropped, long strings
/// clipped to [`METADATA_TEXT_LIMIT`].
pub fn sanitize_metadata(metadata: Value) -> Value {
    let Value::Object(map) = metadata else {
        return json!({});
    };

    let mut sanitized = BTreeMap::new();
    for (key, value) in map {
        let cleaned = match value {
            Value::Null => continue,
            Value::String(text) => Value::String(clip(&text)),
            Value::Bool(_) | Value::Number(_) => value,
            Value::Array(items) => {
                let flat: Vec<Value> = items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::String(text) => Some(Value::String(clip(&text))),
                        Value::Number(_) => Some(item),
                        _ => None,
                    })
                    .collect();
                Value::Array(flat)
            }
            Value::Object(_) => Value::String(clip(&value.to_string())),
        };
        sanitized.insert(key, cleaned);
    }

    Value::Object(sanitized.into_iter().collect())
}

fn clip(text: &str) -> String {
    if text.chars().count() <= METADATA_TEXT_LIMIT {
        text.to_string()
    } else {
        text.chars().take(METADATA_TEXT_LIMIT).collect()
    }
}

pub struct HttpVectorIndex {
    client: Client,
    endpoint: String,
    api_key: String,
    index_name: String,
    environment: String,
    dimension: usize,
    ensured: OnceCell<()>,
}

impl HttpVectorIndex {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        index_name: impl Into<String>,
        environment: impl Into<String>,
        dimension: usize,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("failed to build vector index HTTP client"),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            index_name: index_name.into(),
            environment: environment.into(),
            dimension,
            ensured: OnceCell::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/indexes/{}/{path}", self.endpoint, self.index_name)
    }

    /// Creates the index on first use when the service reports it missing.
    /// Dimension comes from the embedder; metric is always cosine.
    async fn ensure_index(&self) -> Result<(), IndexError> {
        self.ensured
            .get_or_try_init(|| async {
                let describe = self
                    .client
                    .get(format!("{}/indexes/{}", self.endpoint, self.index_name))
                    .header("Api-Key", &self.api_key)
                    .send()
                    .await
                    .map_err(|err| IndexError::Upstream(err.to_string()))?;

                if describe.status().is_success() {
                    return Ok(());
                }
                if describe.status().as_u16() != 404 {
                    return Err(IndexError::Upstream(format!(
                        "describe index returned {}",
                        describe.status()
                    )));
                }

                info!(index = %self.index_name, dimension = self.dimension, "creating vector index");
                let response = self
                    .client
                    .post(format!("{}/indexes", self.endpoint))
                    .header("Api-Key", &self.api_key)
                    .json(&json!({
                        "name": self.index_name,
                        "dimension": self.dimension,
                        "metric": "cosine",
                        "region": self.environment,
                    }))
                    .send()
                    .await
                    .map_err(|err| IndexError::Upstream(err.to_string()))?;

                if response.status().is_success() || response.status().as_u16() == 409 {
                    Ok(())
                } else {
                    Err(IndexError::Upstream(format!(
                        "create index returned {}",
                        response.status()
                    )))
                }
            })
            .await
            .map(|_| ())
    }

    async fn post_json(&self, url: &str, body: Value) -> Result<Value, IndexError> {
        let response = self
            .client
            .post(url)
            .header("Api-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| IndexError::Upstream(err.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            let text = response.text().await.unwrap_or_default();
            return Err(IndexError::Upstream(format!(
                "vector index returned {status}: {text}"
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(IndexError::Invalid(format!(
                "vector index returned {status}: {text}"
            )));
        }

        response
            .json()
            .await
            .map_err(|err| IndexError::Invalid(format!("malformed index response: {err}")))
    }
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    async fn upsert(&self, namespace: &str, records: Vec<VectorRecord>) -> Result<(), IndexError> {
        if records.is_empty() {
            return Ok(());
        }
        self.ensure_index().await?;

        for record in &records {
            if record.values.len() != self.dimension {
                return Err(IndexError::Invalid(format!(
                    "vector {} has dimension {}, index expects {}",
                    record.id,
                    record.values.len(),
                    self.dimension
                )));
            }
        }

        let total = records.len();
        for (batch_no, batch) in records.chunks(UPSERT_BATCH_SIZE).enumerate() {
            let sanitized: Vec<Value> = batch
                .iter()
                .map(|record| {
                    json!({
                        "id": record.id,
                        "values": record.values,
                        "metadata": sanitize_metadata(record.metadata.clone()),
                    })
                })
                .collect();

            self.post_json(
                &self.url("vectors/upsert"),
                json!({ "namespace": namespace, "vectors": sanitized }),
            )
            .await?;
            debug!(namespace, batch = batch_no + 1, total, "upserted vector batch");
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
        if query.len() != self.dimension {
            return Err(IndexError::Invalid(format!(
                "query vector has dimension {}, index expects {}",
                query.len(),
                self.dimension
            )));
        }

        let top_k = top_k.min(MAX_TOP_K).max(1);
        let mut body = json!({
            "namespace": namespace,
            "vector": query,
            "topK": top_k,
            "includeMetadata": true,
        });
        if let Some(filter) = filter {
            body["filter"] = filter;
        }

        let response = self.post_json(&self.url("query"), body).await?;
        let matches: Vec<VectorMatch> = response
            .get("matches")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| IndexError::Invalid(format!("malformed matches: {err}")))?
            .unwrap_or_default();

        let mut matches = matches;
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(matches)
    }

    async fn delete_document(&self, namespace: &str, doc_id: Uuid) -> Result<(), IndexError> {
        self.post_json(
            &self.url("vectors/delete"),
            json!({
                "namespace": namespace,
                "filter": { "doc_id": { "$eq": doc_id.to_string() } },
            }),
        )
        .await
        .map(|_| ())
    }

    async fn delete_vector(&self, namespace: &str, vector_id: &str) -> Result<(), IndexError> {
        self.post_json(
            &self.url("vectors/delete"),
            json!({ "namespace": namespace, "ids": [vector_id] }),
        )
        .await
        .map(|_| ())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), IndexError> {
        self.post_json(
            &self.url("vectors/delete"),
            json!({ "namespace": namespace, "deleteAll": true }),
        )
        .await
        .map(|_| ())
    }

    async fn health_check(&self) -> Result<(), IndexError> {
        let response = self
            .client
            .get(format!("{}/indexes/{}", self.endpoint, self.index_name))
            .header("Api-Key", &self.api_key)
            .send()
            .await
            .map_err(|err| IndexError::Upstream(err.to_string()))?;
        if response.status().is_success() || response.status().as_u16() == 404 {
            Ok(())
        } else {
            Err(IndexError::Upstream(format!(
                "describe index returned {}",
                response.status()
            )))
        }
    }
}
