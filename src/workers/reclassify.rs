//! Re-runs classification for an already-processed document.

use std::sync::Arc;

use async_trait::async_trait;
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::json;
use tokio::task;
use uuid::Uuid;

use crate::{
    classifier,
    jobs::JOB_RECLASSIFY_DOCUMENT,
    models::{Document, DocumentChunk, Job, NewClassification},
    schema::{document_chunks, documents},
    state::AppState,
};

use super::{
    process_document::{load_org_context, upsert_classification},
    CancelFlag, JobExecution, JobHandler,
};

#[derive(Debug, Deserialize)]
struct ReclassifyPayload {
    document_id: Uuid,
    org_id: i64,
}

pub struct ReclassifyDocumentJob;

impl ReclassifyDocumentJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for ReclassifyDocumentJob {
    fn job_type(&self) -> &'static str {
        JOB_RECLASSIFY_DOCUMENT
    }

    async fn handle(&self, state: Arc<AppState>, job: Job, _cancel: CancelFlag) -> JobExecution {
        let payload: ReclassifyPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid reclassify payload: {err}"),
                }
            }
        };

        let pool = state.pool.clone();
        let document_id = payload.document_id;
        let org_id = payload.org_id;
        let loaded = task::spawn_blocking(
            move || -> Result<Option<(Document, Vec<DocumentChunk>)>, String> {
                let mut conn = pool.get().map_err(|err| err.to_string())?;
                let document: Option<Document> = documents::table
                    .find(document_id)
                    .filter(documents::org_id.eq(org_id))
                    .filter(documents::is_deleted.eq(false))
                    .first(&mut conn)
                    .optional()
                    .map_err(|err| err.to_string())?;

                let Some(document) = document else {
                    return Ok(None);
                };

                let chunks: Vec<DocumentChunk> = document_chunks::table
                    .filter(document_chunks::document_id.eq(document_id))
                    .order(document_chunks::chunk_index.asc())
                    .load(&mut conn)
                    .map_err(|err| err.to_string())?;
                Ok(Some((document, chunks)))
            },
        )
        .await;

        let loaded = match loaded.unwrap_or_else(|join| Err(join.to_string())) {
            Ok(loaded) => loaded,
            Err(err) => {
                return JobExecution::Retry {
                    delay: std::time::Duration::from_secs(30),
                    error: err,
                }
            }
        };

        let Some((document, chunks)) = loaded else {
            return JobExecution::Failed {
                error: "document not found".to_string(),
            };
        };
        if chunks.is_empty() {
            return JobExecution::Failed {
                error: "document has no extracted chunks to classify".to_string(),
            };
        }

        let context = load_org_context(&state, payload.org_id).await;
        let mut sample = String::new();
        for chunk in &chunks {
            if sample.chars().count() >= 6000 {
                break;
            }
            sample.push_str(&chunk.chunk_text);
            sample.push_str("\n\n");
        }

        let result =
            classifier::classify(state.chat.as_ref(), &sample, &document.filename, &context).await;

        let row = NewClassification {
            document_id: document.id,
            org_id: payload.org_id,
            team: result.team.clone(),
            project: result.project.clone(),
            doc_type: result.doc_type.clone(),
            time_period: result.time_period.clone(),
            confidentiality: result.confidentiality.clone(),
            people: result.people.clone(),
            tags: result.tags.clone(),
            summary: result.summary.clone(),
            confidence: classifier::confidence_json(&result),
        };

        let pool = state.pool.clone();
        let written = task::spawn_blocking(move || -> Result<(), String> {
            let mut conn = pool.get().map_err(|err| err.to_string())?;
            upsert_classification(&mut conn, &row).map_err(|err| err.to_string())
        })
        .await;

        match written.unwrap_or_else(|join| Err(join.to_string())) {
            Ok(()) => {
                state.org_context.invalidate(payload.org_id).await;
                JobExecution::Success(Some(json!({
                    "doc_id": document.id,
                    "doc_type": result.doc_type,
                })))
            }
            Err(err) => JobExecution::Retry {
                delay: std::time::Duration::from_secs(30),
                error: err,
            },
        }
    }
}
