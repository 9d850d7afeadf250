use std::time::Duration;

use axum::extract::{Json, Multipart, Path, Query, State};
use axum::http::StatusCode;
use chrono::{NaiveDateTime, Utc};
use diesel::{prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::{AppError, AppResult};
use crate::extract::FileType;
use crate::jobs::{enqueue_job, JOB_DELETE_DOCUMENT_VECTORS, JOB_PROCESS_DOCUMENT, JOB_RECLASSIFY_DOCUMENT};
use crate::models::{Classification, Document, NewDocument};
use crate::rag::{self, RagRequest};
use crate::schema::{document_classifications, documents};
use crate::state::AppState;
use crate::storage::{document_storage_key, ObjectStorage as _};

const PRESIGNED_URL_EXPIRY_SECONDS: u64 = 3600;
const MAX_FILES_PER_UPLOAD: usize = 10;
const SEARCH_MAX_TOP_K: i64 = 100;
const SNIPPET_CHARS: usize = 300;

pub fn to_iso(ts: NaiveDateTime) -> String {
    format!("{}Z", ts.format("%Y-%m-%dT%H:%M:%S%.3f"))
}

#[derive(Deserialize)]
pub struct OrgQuery {
    pub org_id: i64,
}

#[derive(Serialize)]
pub struct UploadedFile {
    pub doc_id: Uuid,
    pub filename: String,
    pub file_type: String,
    pub status: String,
    pub job_id: Uuid,
}

#[derive(Serialize)]
pub struct RejectedFile {
    pub filename: String,
    pub reason: String,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub uploaded: Vec<UploadedFile>,
    pub failed: Vec<RejectedFile>,
}

#[derive(Serialize)]
pub struct DocumentListItem {
    pub id: Uuid,
    pub filename: String,
    pub file_type: String,
    pub upload_date: String,
    pub status: String,
}

#[derive(Serialize)]
pub struct ClassificationResponse {
    pub document_id: Uuid,
    pub team: Option<String>,
    pub project: Option<String>,
    pub doc_type: String,
    pub time_period: Option<String>,
    pub confidentiality: String,
    pub people: Vec<String>,
    pub tags: Vec<String>,
    pub summary: String,
    pub confidence: Value,
    pub classified_at: String,
}

impl From<Classification> for ClassificationResponse {
    fn from(row: Classification) -> Self {
        Self {
            document_id: row.document_id,
            team: row.team,
            project: row.project,
            doc_type: row.doc_type,
            time_period: row.time_period,
            confidentiality: row.confidentiality,
            people: row.people,
            tags: row.tags,
            summary: row.summary,
            confidence: row.confidence,
            classified_at: to_iso(row.classified_at),
        }
    }
}

#[derive(Serialize)]
pub struct DocumentDetailResponse {
    pub id: Uuid,
    pub filename: String,
    pub file_type: String,
    pub size_bytes: i64,
    pub upload_date: String,
    pub status: String,
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<ClassificationResponse>,
}

#[derive(Serialize)]
pub struct DownloadResponse {
    pub download_url: String,
    pub expires_in: u64,
}

#[derive(Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub org_id: i64,
    pub top_k: Option<i64>,
    pub doc_type: Option<String>,
    pub min_score: Option<f32>,
}

#[derive(Serialize)]
pub struct SearchResult {
    pub doc_id: Uuid,
    pub filename: String,
    pub file_type: String,
    pub upload_date: String,
    pub snippet: String,
    pub score: f32,
    pub chunk_index: i32,
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub results_count: usize,
    pub results: Vec<SearchResult>,
}

#[derive(Serialize)]
pub struct TaskResponse {
    pub task_id: Uuid,
}

struct PendingUpload {
    filename: String,
    bytes: Vec<u8>,
}

pub async fn upload_documents(
    State(state): State<AppState>,
    identity: Identity,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<UploadResponse>)> {
    let mut org_id: Option<i64> = None;
    let mut files: Vec<PendingUpload> = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("org_id") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(format!("invalid org_id: {err}")))?;
                org_id = Some(
                    value
                        .trim()
                        .parse()
                        .map_err(|_| AppError::bad_request("org_id must be an integer"))?,
                );
            }
            Some("files") | Some("file") => {
                let filename = field
                    .file_name()
                    .map(|n| n.to_string())
                    .ok_or_else(|| AppError::bad_request("file field missing filename"))?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::bad_request(format!("failed to read file: {err}")))?;
                files.push(PendingUpload {
                    filename,
                    bytes: bytes.to_vec(),
                });
            }
            _ => {}
        }
    }

    let org_id = org_id.ok_or_else(|| AppError::bad_request("org_id field is required"))?;
    identity.require_org(org_id)?;

    if files.is_empty() {
        return Err(AppError::bad_request("at least one file is required"));
    }
    if files.len() > MAX_FILES_PER_UPLOAD {
        return Err(AppError::bad_request(format!(
            "at most {MAX_FILES_PER_UPLOAD} files per upload"
        )));
    }

    let mut uploaded = Vec::new();
    let mut failed = Vec::new();

    for file in files {
        match store_one(&state, &identity, org_id, &file).await {
            Ok(entry) => uploaded.push(entry),
            Err(reason) => {
                warn!(filename = %file.filename, %reason, "upload rejected");
                failed.push(RejectedFile {
                    filename: file.filename,
                    reason,
                });
            }
        }
    }

    let status = if uploaded.is_empty() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    Ok((status, Json(UploadResponse { uploaded, failed })))
}

async fn store_one(
    state: &AppState,
    identity: &Identity,
    org_id: i64,
    file: &PendingUpload,
) -> Result<UploadedFile, String> {
    if file.bytes.is_empty() {
        return Err("file is empty".to_string());
    }
    if file.bytes.len() as i64 > state.config.max_upload_bytes {
        return Err(format!(
            "file exceeds the {} byte limit",
            state.config.max_upload_bytes
        ));
    }

    let file_type = FileType::from_filename(&file.filename)
        .ok_or_else(|| "unsupported file type; allowed: pdf, docx, txt, md, csv".to_string())?;
    if !file_type.matches_magic(&file.bytes) {
        return Err(format!(
            "file contents do not match declared type {}",
            file_type.as_str()
        ));
    }

    let doc_id = Uuid::new_v4();
    let storage_key = document_storage_key(org_id, doc_id, &file.filename);
    let checksum = format!("{:x}", Sha256::digest(&file.bytes));

    state
        .storage
        .put_object(
            &storage_key,
            file.bytes.clone(),
            Some(file_type.content_type().to_string()),
        )
        .await
        .map_err(|err| format!("blob store rejected the upload: {err}"))?;

    let pool = state.pool.clone();
    let row = NewDocument {
        id: doc_id,
        org_id,
        filename: file.filename.clone(),
        file_type: file_type.as_str().to_string(),
        size_bytes: file.bytes.len() as i64,
        storage_key,
        uploaded_by: identity.user_id,
        status: "pending".to_string(),
        metadata: json!({ "checksum": checksum }),
    };

    let job_id = tokio::task::spawn_blocking(move || -> Result<Uuid, String> {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        conn.transaction::<Uuid, diesel::result::Error, _>(|conn| {
            diesel::insert_into(documents::table)
                .values(&row)
                .execute(conn)?;
            let job = enqueue_job(
                conn,
                org_id,
                JOB_PROCESS_DOCUMENT,
                json!({ "document_id": doc_id, "org_id": org_id }),
                None,
            )
            .map_err(|err| match err {
                crate::jobs::JobQueueError::Database(db) => db,
            })?;
            Ok(job.id)
        })
        .map_err(|err| err.to_string())
    })
    .await
    .map_err(|join| join.to_string())??;

    info!(document_id = %doc_id, org_id, filename = %file.filename, "document uploaded");

    Ok(UploadedFile {
        doc_id,
        filename: file.filename.clone(),
        file_type: file_type.as_str().to_string(),
        status: "pending".to_string(),
        job_id,
    })
}

pub async fn list_documents(
    State(state): State<AppState>,
    Query(params): Query<OrgQuery>,
    identity: Identity,
) -> AppResult<Json<Vec<DocumentListItem>>> {
    identity.require_org(params.org_id)?;
    let mut conn = state.db()?;

    let docs: Vec<Document> = documents::table
        .filter(documents::org_id.eq(params.org_id))
        .filter(documents::is_deleted.eq(false))
        .order(documents::uploaded_at.desc())
        .load(&mut conn)?;

    Ok(Json(
        docs.into_iter()
            .map(|doc| DocumentListItem {
                id: doc.id,
                filename: doc.filename,
                file_type: doc.file_type,
                upload_date: to_iso(doc.uploaded_at),
                status: doc.status,
            })
            .collect(),
    ))
}

/// Loads a live document, hiding existence from other tenants.
fn load_owned_document(
    conn: &mut PgConnection,
    document_id: Uuid,
    identity: &Identity,
) -> AppResult<Document> {
    let doc: Document = documents::table
        .find(document_id)
        .first(conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    if doc.org_id != identity.org_id {
        return Err(AppError::forbidden());
    }
    if doc.is_deleted {
        return Err(AppError::not_found());
    }
    Ok(doc)
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    identity: Identity,
) -> AppResult<Json<DocumentDetailResponse>> {
    let mut conn = state.db()?;
    let doc = load_owned_document(&mut conn, document_id, &identity)?;

    let classification: Option<Classification> = document_classifications::table
        .find(document_id)
        .first(&mut conn)
        .optional()?;

    Ok(Json(DocumentDetailResponse {
        id: doc.id,
        filename: doc.filename,
        file_type: doc.file_type,
        size_bytes: doc.size_bytes,
        upload_date: to_iso(doc.uploaded_at),
        status: doc.status,
        metadata: doc.metadata,
        classification: classification.map(ClassificationResponse::from),
    }))
}

pub async fn download_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    identity: Identity,
) -> AppResult<Json<DownloadResponse>> {
    let mut conn = state.db()?;
    let doc = load_owned_document(&mut conn, document_id, &identity)?;
    drop(conn);

    let url = state
        .storage
        .presign_get_object(
            &doc.storage_key,
            Duration::from_secs(PRESIGNED_URL_EXPIRY_SECONDS),
        )
        .await
        .map_err(AppError::internal)?;

    Ok(Json(DownloadResponse {
        download_url: url,
        expires_in: PRESIGNED_URL_EXPIRY_SECONDS,
    }))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    identity: Identity,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    let doc = load_owned_document(&mut conn, document_id, &identity)?;

    conn.transaction::<_, AppError, _>(|conn| {
        diesel::update(documents::table.find(doc.id))
            .set((
                documents::is_deleted.eq(true),
                documents::deleted_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;

        enqueue_job(
            conn,
            doc.org_id,
            JOB_DELETE_DOCUMENT_VECTORS,
            json!({ "document_id": doc.id, "org_id": doc.org_id }),
            None,
        )
        .map_err(|err| AppError::internal(format!("failed to enqueue vector deletion: {err}")))?;
        Ok(())
    })?;

    info!(document_id = %doc.id, org_id = doc.org_id, "document soft-deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn search_documents(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<SearchRequest>,
) -> AppResult<Json<SearchResponse>> {
    identity.require_org(request.org_id)?;

    if request.query.trim().is_empty() {
        return Err(AppError::bad_request("query must not be empty"));
    }
    let top_k = match request.top_k {
        Some(k) if k <= 0 => return Err(AppError::bad_request("top_k must be positive")),
        Some(k) => k.min(SEARCH_MAX_TOP_K) as usize,
        None => state.config.retrieval_top_k,
    };
    if let Some(min_score) = request.min_score {
        if !(0.0..=1.0).contains(&min_score) {
            return Err(AppError::bad_request("min_score must be within [0, 1]"));
        }
    }

    let rag_request = RagRequest {
        query: request.query.clone(),
        top_k,
        min_score: request.min_score.unwrap_or(state.config.min_score),
        doc_type: request.doc_type.clone(),
    };
    let sources = rag::retrieve(&state, request.org_id, &rag_request).await?;

    let mut conn = state.db()?;
    let doc_ids: Vec<Uuid> = sources.iter().map(|s| s.doc_id).collect();
    let docs: Vec<Document> = documents::table
        .filter(documents::id.eq_any(&doc_ids))
        .load(&mut conn)?;
    let by_id: std::collections::HashMap<Uuid, &Document> =
        docs.iter().map(|doc| (doc.id, doc)).collect();

    let results: Vec<SearchResult> = sources
        .iter()
        .filter_map(|source| {
            let doc = by_id.get(&source.doc_id)?;
            Some(SearchResult {
                doc_id: source.doc_id,
                filename: source.filename.clone(),
                file_type: doc.file_type.clone(),
                upload_date: to_iso(doc.uploaded_at),
                snippet: source.chunk_text.chars().take(SNIPPET_CHARS).collect(),
                score: source.score,
                chunk_index: source.chunk_index,
            })
        })
        .collect();

    Ok(Json(SearchResponse {
        results_count: results.len(),
        results,
    }))
}

pub async fn get_classification(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    identity: Identity,
) -> AppResult<Json<ClassificationResponse>> {
    let mut conn = state.db()?;
    load_owned_document(&mut conn, document_id, &identity)?;

    let classification: Classification = document_classifications::table
        .find(document_id)
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    Ok(Json(ClassificationResponse::from(classification)))
}

pub async fn reclassify_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    identity: Identity,
) -> AppResult<(StatusCode, Json<TaskResponse>)> {
    let mut conn = state.db()?;
    let doc = load_owned_document(&mut conn, document_id, &identity)?;

    if doc.status != "completed" {
        return Err(AppError::conflict(
            "document must finish processing before reclassification",
        ));
    }

    let job = enqueue_job(
        &mut conn,
        doc.org_id,
        JOB_RECLASSIFY_DOCUMENT,
        json!({ "document_id": doc.id, "org_id": doc.org_id }),
        None,
    )
    .map_err(|err| AppError::internal(format!("failed to enqueue reclassify job: {err}")))?;

    Ok((StatusCode::ACCEPTED, Json(TaskResponse { task_id: job.id })))
}
