use axum::extract::{Json, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::Identity;
use crate::employees::{self, EmployeeHit};
use crate::error::{AppError, AppResult};
use crate::jobs::{enqueue_job, JOB_GENERATE_EMPLOYEE_EMBEDDING};
use crate::state::AppState;

const EMPLOYEE_SEARCH_MAX_TOP_K: i64 = 50;

#[derive(Deserialize)]
pub struct EmployeeSearchRequest {
    pub query: String,
    pub org_id: i64,
    pub top_k: Option<i64>,
}

#[derive(Serialize)]
pub struct EmployeeSearchResponse {
    pub results_count: usize,
    pub results: Vec<EmployeeHit>,
}

#[derive(Deserialize)]
pub struct GenerateEmbeddingRequest {
    pub org_id: i64,
    pub user_id: Option<i64>,
    /// Profile fields (name, title, bio, skills) to embed.
    pub profile: Option<Value>,
}

#[derive(Serialize)]
pub struct TaskResponse {
    pub task_id: Uuid,
}

pub async fn search_employees(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<EmployeeSearchRequest>,
) -> AppResult<Json<EmployeeSearchResponse>> {
    identity.require_org(request.org_id)?;
    if request.query.trim().is_empty() {
        return Err(AppError::bad_request("query must not be empty"));
    }
    let top_k = match request.top_k {
        Some(k) if k <= 0 => return Err(AppError::bad_request("top_k must be positive")),
        Some(k) => k.min(EMPLOYEE_SEARCH_MAX_TOP_K) as usize,
        None => 10,
    };

    let results = employees::search_employees(&state, request.org_id, &request.query, top_k).await?;
    Ok(Json(EmployeeSearchResponse {
        results_count: results.len(),
        results,
    }))
}

/// Queues an employee-embedding build. Members may refresh their own
/// vector; refreshing someone else's requires the tenant admin role.
pub async fn generate_embedding(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<GenerateEmbeddingRequest>,
) -> AppResult<(StatusCode, Json<TaskResponse>)> {
    identity.require_org(request.org_id)?;

    let target_user = request.user_id.unwrap_or(identity.user_id);
    if target_user != identity.user_id && !identity.is_admin() {
        return Err(AppError::forbidden());
    }

    let mut conn = state.db()?;
    let job = enqueue_job(
        &mut conn,
        request.org_id,
        JOB_GENERATE_EMPLOYEE_EMBEDDING,
        json!({
            "org_id": request.org_id,
            "user_id": target_user,
            "profile": request.profile,
        }),
        None,
    )
    .map_err(|err| AppError::internal(format!("failed to enqueue embedding job: {err}")))?;

    Ok((StatusCode::ACCEPTED, Json(TaskResponse { task_id: job.id })))
}
