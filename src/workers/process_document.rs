//! The document ingestion pipeline.
//!
//! download -> extract -> chunk -> embed -> upsert -> classify, with
//! progress reported at each boundary. The task is idempotent on the
//! document: any chunks or vectors left over from a previous attempt are
//! removed before re-running. Failures at or before the vector upsert roll
//! everything back and fail the document; a classification failure after
//! the upsert still completes it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    chunker::{Chunk, Chunker},
    classifier,
    embedder::Embedder as _,
    extract::{self, FileType},
    index::{chunk_vector_id, namespace_for_org, VectorIndex as _, VectorRecord},
    jobs::{set_job_progress, JOB_PROCESS_DOCUMENT},
    models::{Document, Job, NewClassification, NewDocumentChunk},
    schema::{document_chunks, document_classifications, documents},
    state::AppState,
    storage::ObjectStorage as _,
};

use super::{CancelFlag, JobExecution, JobHandler};

pub const PROGRESS_DOWNLOAD: i32 = 10;
pub const PROGRESS_EXTRACT: i32 = 30;
pub const PROGRESS_CHUNK: i32 = 50;
pub const PROGRESS_EMBED: i32 = 70;
pub const PROGRESS_UPSERT: i32 = 85;
pub const PROGRESS_CLASSIFY: i32 = 95;

#[derive(Debug, Clone, Deserialize)]
struct ProcessPayload {
    document_id: Uuid,
    org_id: i64,
}

enum PipelineFailure {
    Transient(String),
    Permanent(String),
    Cancelled,
}

impl PipelineFailure {
    fn transient(err: impl std::fmt::Display) -> Self {
        PipelineFailure::Transient(err.to_string())
    }

    fn permanent(err: impl std::fmt::Display) -> Self {
        PipelineFailure::Permanent(err.to_string())
    }
}

pub struct ProcessDocumentJob;

impl ProcessDocumentJob {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcessDocumentJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for ProcessDocumentJob {
    fn job_type(&self) -> &'static str {
        JOB_PROCESS_DOCUMENT
    }

    async fn handle(&self, state: Arc<AppState>, job: Job, cancel: CancelFlag) -> JobExecution {
        let payload: ProcessPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid process-document payload: {err}"),
                }
            }
        };

        match run_pipeline(&state, &job, &payload, &cancel).await {
            Ok(result) => JobExecution::Success(Some(result)),
            Err(failure) => {
                let error = match &failure {
                    PipelineFailure::Transient(message) => message.clone(),
                    PipelineFailure::Permanent(message) => message.clone(),
                    PipelineFailure::Cancelled => "job cancelled".to_string(),
                };
                warn!(job_id = %job.id, document_id = %payload.document_id, %error, "pipeline failed; rolling back");

                if let Err(rollback_err) = rollback(&state, &payload).await {
                    warn!(
                        job_id = %job.id,
                        document_id = %payload.document_id,
                        error = %rollback_err,
                        "rollback incomplete"
                    );
                }

                match failure {
                    PipelineFailure::Transient(message) => JobExecution::Retry {
                        delay: Duration::from_secs(30),
                        error: message,
                    },
                    PipelineFailure::Permanent(message) => {
                        mark_document_failed(&state, payload.document_id);
                        JobExecution::Failed { error: message }
                    }
                    PipelineFailure::Cancelled => JobExecution::Retry {
                        delay: Duration::from_secs(60),
                        error: "job cancelled before completion".to_string(),
                    },
                }
            }
        }
    }
}

async fn run_pipeline(
    state: &Arc<AppState>,
    job: &Job,
    payload: &ProcessPayload,
    cancel: &CancelFlag,
) -> Result<serde_json::Value, PipelineFailure> {
    let document = load_document(state, payload).await?;
    let Some(document) = document else {
        // Deleted while queued; nothing to do.
        return Ok(json!({ "skipped": "document deleted" }));
    };

    let file_type = FileType::parse(&document.file_type).ok_or_else(|| {
        PipelineFailure::Permanent(format!("unsupported file type: {}", document.file_type))
    })?;

    set_document_status(state, document.id, "processing").await?;

    // Idempotency: a prior partial attempt may have left chunks or vectors
    // behind. Clear both before re-running.
    clear_previous_state(state, payload).await?;
    check_cancel(cancel)?;

    let bytes = state
        .storage
        .get_object(&document.storage_key)
        .await
        .map_err(PipelineFailure::transient)?;
    progress(state, job.id, PROGRESS_DOWNLOAD).await;
    check_cancel(cancel)?;

    let extraction = {
        let timeout = Duration::from_secs(state.config.extraction_timeout_secs);
        let extract_task = task::spawn_blocking(move || extract::extract(&bytes, file_type));
        match tokio::time::timeout(timeout, extract_task).await {
            Err(_) => return Err(PipelineFailure::Permanent("extraction_timeout".to_string())),
            Ok(Err(join_err)) => {
                return Err(PipelineFailure::Transient(format!(
                    "extraction task panicked: {join_err}"
                )))
            }
            Ok(Ok(Err(err))) => return Err(PipelineFailure::permanent(err)),
            Ok(Ok(Ok(extraction))) => extraction,
        }
    };
    progress(state, job.id, PROGRESS_EXTRACT).await;
    check_cancel(cancel)?;

    let chunker = Chunker::new(state.config.chunk_size, state.config.chunk_overlap)
        .map_err(PipelineFailure::permanent)?;
    let chunk_metadata = json!({
        "filename": document.filename,
        "doc_type": document.file_type,
    });
    let chunks = chunker.chunk(&extraction.text, &chunk_metadata);
    if chunks.is_empty() {
        return Err(PipelineFailure::Permanent(
            "document is empty after extraction".to_string(),
        ));
    }
    progress(state, job.id, PROGRESS_CHUNK).await;
    check_cancel(cancel)?;

    let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
    let embeddings = state
        .embedder
        .embed(&texts, payload.org_id)
        .await
        .map_err(|err| {
            if matches!(err, crate::embedder::EmbedError::BudgetExceeded(_)) {
                PipelineFailure::Permanent(format!("BudgetExceeded: {err}"))
            } else if err.is_transient() {
                PipelineFailure::transient(err)
            } else {
                PipelineFailure::permanent(err)
            }
        })?;
    progress(state, job.id, PROGRESS_EMBED).await;
    check_cancel(cancel)?;

    let records: Vec<VectorRecord> = chunks
        .iter()
        .zip(embeddings.iter())
        .map(|(chunk, embedding)| VectorRecord {
            id: chunk_vector_id(document.id, chunk.index as i32),
            values: embedding.clone(),
            metadata: json!({
                "doc_id": document.id.to_string(),
                "org_id": payload.org_id,
                "chunk_index": chunk.index,
                "tokens": chunk.token_count,
                "text": chunk.text,
                "filename": document.filename,
                "doc_type": document.file_type,
            }),
        })
        .collect();

    state
        .index
        .upsert(&namespace_for_org(payload.org_id), records)
        .await
        .map_err(|err| {
            if err.is_transient() {
                PipelineFailure::transient(err)
            } else {
                PipelineFailure::permanent(err)
            }
        })?;
    progress(state, job.id, PROGRESS_UPSERT).await;

    // Atomic: all chunk rows plus the status flip land in one transaction.
    persist_chunks(state, &document, &chunks, &extraction.metadata).await?;

    // From here on the document stays completed; classification is
    // best-effort.
    if let Err(err) = classify_document(state, &document, &chunks, payload.org_id).await {
        warn!(document_id = %document.id, error = %err, "classification failed; document completed without it");
    }
    progress(state, job.id, PROGRESS_CLASSIFY).await;

    info!(
        document_id = %document.id,
        org_id = payload.org_id,
        chunks = chunks.len(),
        "document processed"
    );

    Ok(json!({
        "doc_id": document.id,
        "filename": document.filename,
        "chunks_created": chunks.len(),
        "extraction_method": extraction.metadata.extraction_method,
        "char_count": extraction.metadata.char_count,
    }))
}

fn check_cancel(cancel: &CancelFlag) -> Result<(), PipelineFailure> {
    if cancel.load(Ordering::Relaxed) {
        Err(PipelineFailure::Cancelled)
    } else {
        Ok(())
    }
}

async fn progress(state: &Arc<AppState>, job_id: Uuid, value: i32) {
    let pool = state.pool.clone();
    let outcome = task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        set_job_progress(&mut conn, job_id, value).map_err(|err| err.to_string())
    })
    .await;
    if let Err(err) = outcome.unwrap_or_else(|join| Err(join.to_string())) {
        warn!(job_id = %job_id, error = %err, "failed to report job progress");
    }
}

async fn load_document(
    state: &Arc<AppState>,
    payload: &ProcessPayload,
) -> Result<Option<Document>, PipelineFailure> {
    let pool = state.pool.clone();
    let document_id = payload.document_id;
    let org_id = payload.org_id;

    task::spawn_blocking(move || -> Result<Option<Document>, String> {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        let document: Option<Document> = documents::table
            .find(document_id)
            .filter(documents::org_id.eq(org_id))
            .first(&mut conn)
            .optional()
            .map_err(|err| err.to_string())?;
        Ok(document.filter(|doc| !doc.is_deleted))
    })
    .await
    .map_err(|join| PipelineFailure::Transient(join.to_string()))?
    .map_err(PipelineFailure::Transient)
}

async fn set_document_status(
    state: &Arc<AppState>,
    document_id: Uuid,
    status: &'static str,
) -> Result<(), PipelineFailure> {
    let pool = state.pool.clone();
    task::spawn_blocking(move || -> Result<(), String> {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        diesel::update(documents::table.find(document_id))
            .set(documents::status.eq(status))
            .execute(&mut conn)
            .map_err(|err| err.to_string())?;
        Ok(())
    })
    .await
    .map_err(|join| PipelineFailure::Transient(join.to_string()))?
    .map_err(PipelineFailure::Transient)
}

async fn clear_previous_state(
    state: &Arc<AppState>,
    payload: &ProcessPayload,
) -> Result<(), PipelineFailure> {
    state
        .index
        .delete_document(&namespace_for_org(payload.org_id), payload.document_id)
        .await
        .map_err(PipelineFailure::transient)?;

    let pool = state.pool.clone();
    let document_id = payload.document_id;
    task::spawn_blocking(move || -> Result<(), String> {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        diesel::delete(document_chunks::table.filter(document_chunks::document_id.eq(document_id)))
            .execute(&mut conn)
            .map_err(|err| err.to_string())?;
        Ok(())
    })
    .await
    .map_err(|join| PipelineFailure::Transient(join.to_string()))?
    .map_err(PipelineFailure::Transient)
}

async fn persist_chunks(
    state: &Arc<AppState>,
    document: &Document,
    chunks: &[Chunk],
    extraction_metadata: &crate::extract::ExtractionMetadata,
) -> Result<(), PipelineFailure> {
    let pool = state.pool.clone();
    let document_id = document.id;
    let rows: Vec<NewDocumentChunk> = chunks
        .iter()
        .map(|chunk| NewDocumentChunk {
            id: Uuid::new_v4(),
            document_id,
            chunk_index: chunk.index as i32,
            chunk_text: chunk.text.clone(),
            token_count: chunk.token_count as i32,
            embedding_key: chunk_vector_id(document_id, chunk.index as i32),
            metadata: json!({ "paragraph_index": chunk.paragraph_index }),
        })
        .collect();
    // Extraction metadata merges over the upload-time metadata (checksum)
    // instead of replacing it.
    let mut metadata_value = document.metadata.clone();
    if let (Some(target), Ok(Value::Object(extracted))) = (
        metadata_value.as_object_mut(),
        serde_json::to_value(extraction_metadata),
    ) {
        target.extend(extracted);
    }

    task::spawn_blocking(move || -> Result<(), String> {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            diesel::insert_into(document_chunks::table)
                .values(&rows)
                .execute(conn)?;
            diesel::update(documents::table.find(document_id))
                .set((
                    documents::status.eq("completed"),
                    documents::metadata.eq(metadata_value),
                ))
                .execute(conn)?;
            Ok(())
        })
        .map_err(|err| err.to_string())
    })
    .await
    .map_err(|join| PipelineFailure::Transient(join.to_string()))?
    .map_err(PipelineFailure::Transient)
}

async fn classify_document(
    state: &Arc<AppState>,
    document: &Document,
    chunks: &[Chunk],
    org_id: i64,
) -> Result<(), String> {
    let context = load_org_context(state, org_id).await;

    // Enough leading chunks to fill the classification prompt.
    let mut sample = String::new();
    for chunk in chunks {
        if sample.chars().count() >= 6000 {
            break;
        }
        sample.push_str(&chunk.text);
        sample.push_str("\n\n");
    }

    let result =
        classifier::classify(state.chat.as_ref(), &sample, &document.filename, &context).await;

    let row = NewClassification {
        document_id: document.id,
        org_id,
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
    task::spawn_blocking(move || -> Result<(), String> {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        upsert_classification(&mut conn, &row).map_err(|err| err.to_string())
    })
    .await
    .map_err(|join| join.to_string())??;

    state.org_context.invalidate(org_id).await;
    Ok(())
}

/// Re-classification replaces the row wholesale; at most one per document.
pub fn upsert_classification(
    conn: &mut PgConnection,
    row: &NewClassification,
) -> Result<(), diesel::result::Error> {
    diesel::insert_into(document_classifications::table)
        .values(row)
        .on_conflict(document_classifications::document_id)
        .do_update()
        .set((
            document_classifications::team.eq(&row.team),
            document_classifications::project.eq(&row.project),
            document_classifications::doc_type.eq(&row.doc_type),
            document_classifications::time_period.eq(&row.time_period),
            document_classifications::confidentiality.eq(&row.confidentiality),
            document_classifications::people.eq(&row.people),
            document_classifications::tags.eq(&row.tags),
            document_classifications::summary.eq(&row.summary),
            document_classifications::confidence.eq(&row.confidence),
            document_classifications::classified_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Distinct teams, projects and doc types already assigned in this tenant,
/// via the per-tenant soft cache.
pub async fn load_org_context(state: &Arc<AppState>, org_id: i64) -> classifier::OrgContext {
    if let Some(cached) = state.org_context.get(org_id).await {
        return cached;
    }

    let pool = state.pool.clone();
    let loaded = task::spawn_blocking(move || -> Result<classifier::OrgContext, String> {
        let mut conn = pool.get().map_err(|err| err.to_string())?;

        let teams: Vec<Option<String>> = document_classifications::table
            .filter(document_classifications::org_id.eq(org_id))
            .select(document_classifications::team)
            .distinct()
            .load(&mut conn)
            .map_err(|err| err.to_string())?;
        let projects: Vec<Option<String>> = document_classifications::table
            .filter(document_classifications::org_id.eq(org_id))
            .select(document_classifications::project)
            .distinct()
            .load(&mut conn)
            .map_err(|err| err.to_string())?;
        let doc_types: Vec<String> = document_classifications::table
            .filter(document_classifications::org_id.eq(org_id))
            .select(document_classifications::doc_type)
            .distinct()
            .load(&mut conn)
            .map_err(|err| err.to_string())?;

        Ok(classifier::OrgContext {
            teams: teams.into_iter().flatten().collect(),
            projects: projects.into_iter().flatten().collect(),
            doc_types,
        })
    })
    .await;

    match loaded.unwrap_or_else(|join| Err(join.to_string())) {
        Ok(context) => {
            state.org_context.put(org_id, context.clone()).await;
            context
        }
        Err(err) => {
            // A missing cache load is never an error; classify without it.
            warn!(org_id, error = %err, "failed to load org context");
            classifier::OrgContext::default()
        }
    }
}

/// Best-effort rollback to the pre-run state: vectors first, then chunks.
async fn rollback(state: &Arc<AppState>, payload: &ProcessPayload) -> Result<(), String> {
    state
        .index
        .delete_document(&namespace_for_org(payload.org_id), payload.document_id)
        .await
        .map_err(|err| err.to_string())?;

    let pool = state.pool.clone();
    let document_id = payload.document_id;
    task::spawn_blocking(move || -> Result<(), String> {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        diesel::delete(document_chunks::table.filter(document_chunks::document_id.eq(document_id)))
            .execute(&mut conn)
            .map_err(|err| err.to_string())?;
        Ok(())
    })
    .await
    .map_err(|join| join.to_string())?
}

fn mark_document_failed(state: &Arc<AppState>, document_id: Uuid) {
    if let Ok(mut conn) = state.db() {
        if let Err(err) = diesel::update(documents::table.find(document_id))
            .set(documents::status.eq("failed"))
            .execute(&mut conn)
        {
            warn!(document_id = %document_id, error = %err, "failed to mark document failed");
        }
    }
}
