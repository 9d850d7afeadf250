//! Single-shot retrieval-augmented answering with inline citations.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::embedder::Embedder as _;
use crate::index::{namespace_for_org, VectorIndex as _};
use crate::llm::{ChatMessage, ChatModel as _, ChatOptions, TokenUsage};
use crate::schema::{document_chunks, documents};
use crate::state::AppState;

pub const NO_EVIDENCE_ANSWER: &str = "I don't know based on the available documents.";

const SYSTEM_PROMPT: &str = "You are an assistant for an organization's knowledge base. \
Answer only from the provided context. Cite filenames inline using the bracketed \
citation tokens, e.g. [1]. If the context does not contain the answer, say so.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagSource {
    pub doc_id: Uuid,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    pub score: f32,
    pub chunk_index: i32,
    pub chunk_text: String,
}

#[derive(Debug, Clone)]
pub struct RagAnswer {
    pub answer: String,
    pub sources: Vec<RagSource>,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct RagRequest {
    pub query: String,
    pub top_k: usize,
    pub min_score: f32,
    pub doc_type: Option<String>,
}

impl RagRequest {
    pub fn new(state: &AppState, query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: state.config.retrieval_top_k,
            min_score: state.config.min_score,
            doc_type: None,
        }
    }
}

/// Retrieval only: embed the query, search the tenant namespace, hydrate
/// hits from the relational store. Shared by the RAG path, the document
/// search endpoint, and the data-query agent.
pub async fn retrieve(
    state: &AppState,
    org_id: i64,
    request: &RagRequest,
) -> AppResult<Vec<RagSource>> {
    let embeddings = state
        .embedder
        .embed(std::slice::from_ref(&request.query), org_id)
        .await?;
    let query_vector = embeddings
        .into_iter()
        .next()
        .ok_or_else(|| AppError::internal("embedder returned no vector for query"))?;

    let filter = request
        .doc_type
        .as_ref()
        .map(|doc_type| json!({ "doc_type": { "$eq": doc_type } }));

    let matches = state
        .index
        .search(
            &namespace_for_org(org_id),
            &query_vector,
            request.top_k,
            filter,
        )
        .await?;

    let mut hits: Vec<(Uuid, i32, f32, Value)> = Vec::new();
    for m in matches {
        if m.score < request.min_score {
            continue;
        }
        let Some((doc_id, chunk_index)) = parse_chunk_id(&m.id) else {
            continue;
        };
        hits.push((doc_id, chunk_index, m.score, m.metadata));
    }

    if hits.is_empty() {
        return Ok(Vec::new());
    }

    hydrate(state, org_id, hits)
}

fn hydrate(
    state: &AppState,
    org_id: i64,
    hits: Vec<(Uuid, i32, f32, Value)>,
) -> AppResult<Vec<RagSource>> {
    let mut conn = state.db()?;

    let doc_ids: Vec<Uuid> = hits.iter().map(|(doc_id, ..)| *doc_id).collect();
    let rows: Vec<(Uuid, String, i64)> = documents::table
        .filter(documents::id.eq_any(&doc_ids))
        .filter(documents::org_id.eq(org_id))
        .filter(documents::is_deleted.eq(false))
        .select((documents::id, documents::filename, documents::org_id))
        .load(&mut conn)?;
    let filenames: std::collections::HashMap<Uuid, String> = rows
        .into_iter()
        .map(|(id, filename, _)| (id, filename))
        .collect();

    let mut sources = Vec::with_capacity(hits.len());
    for (doc_id, chunk_index, score, metadata) in hits {
        // A vector may outlive its document inside the deletion convergence
        // window; those hits are dropped here.
        let Some(filename) = filenames.get(&doc_id) else {
            continue;
        };

        let chunk_text: String = document_chunks::table
            .filter(document_chunks::document_id.eq(doc_id))
            .filter(document_chunks::chunk_index.eq(chunk_index))
            .select(document_chunks::chunk_text)
            .first(&mut conn)
            .optional()?
            .unwrap_or_else(|| {
                metadata
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            });

        sources.push(RagSource {
            doc_id,
            filename: filename.clone(),
            page: metadata.get("page").and_then(Value::as_i64),
            score,
            chunk_index,
            chunk_text,
        });
    }

    sources.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    Ok(sources)
}

/// Full pipeline: retrieve, augment, generate.
pub async fn answer(state: &AppState, org_id: i64, request: RagRequest) -> AppResult<RagAnswer> {
    let sources = retrieve(state, org_id, &request).await?;

    if sources.is_empty() {
        return Ok(RagAnswer {
            answer: NO_EVIDENCE_ANSWER.to_string(),
            sources: Vec::new(),
            usage: TokenUsage::default(),
        });
    }

    let prompt = augment(&request.query, &sources);
    let completion = state
        .chat
        .complete(
            &[ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)],
            ChatOptions::default(),
        )
        .await?;

    Ok(RagAnswer {
        answer: completion.content,
        sources,
        usage: completion.usage,
    })
}

/// Builds the context block with stable `[n]` citation tokens followed by
/// the user question.
fn augment(query: &str, sources: &[RagSource]) -> String {
    let mut parts = vec!["=== CONTEXT ===".to_string()];
    for (idx, source) in sources.iter().enumerate() {
        let mut heading = format!("[{}] {}", idx + 1, source.filename);
        if let Some(page) = source.page {
            heading.push_str(&format!(", page {page}"));
        }
        heading.push_str(&format!(" (relevance: {:.2})", source.score));
        parts.push(heading);
        parts.push(source.chunk_text.clone());
        parts.push(String::new());
    }
    parts.push("=== QUESTION ===".to_string());
    parts.push(query.to_string());
    parts.join("\n")
}

pub fn parse_chunk_id(vector_id: &str) -> Option<(Uuid, i32)> {
    let rest = vector_id.strip_prefix("doc_")?;
    let (doc_part, chunk_part) = rest.split_once("_chunk_")?;
    let doc_id = Uuid::parse_str(doc_part).ok()?;
    let chunk_index = chunk_part.parse().ok()?;
    Some((doc_id, chunk_index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_parse_round_trip() {
        let doc = Uuid::new_v4();
        let id = crate::index::chunk_vector_id(doc, 5);
        assert_eq!(parse_chunk_id(&id), Some((doc, 5)));
        assert_eq!(parse_chunk_id("employee_12"), None);
        assert_eq!(parse_chunk_id("doc_notauuid_chunk_1"), None);
    }

    #[test]
    fn augmented_prompt_numbers_citations() {
        let sources = vec![
            RagSource {
                doc_id: Uuid::new_v4(),
                filename: "policy.pdf".into(),
                page: Some(2),
                score: 0.91,
                chunk_index: 0,
                chunk_text: "Travel must be approved.".into(),
            },
            RagSource {
                doc_id: Uuid::new_v4(),
                filename: "handbook.md".into(),
                page: None,
                score: 0.82,
                chunk_index: 3,
                chunk_text: "Expenses are reimbursed monthly.".into(),
            },
        ];
        let prompt = augment("what is the travel policy?", &sources);
        assert!(prompt.contains("[1] policy.pdf, page 2"));
        assert!(prompt.contains("[2] handbook.md"));
        assert!(prompt.ends_with("what is the travel policy?"));
    }
}
