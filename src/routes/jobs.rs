use axum::extract::{Json, Path, State};
use diesel::prelude::*;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::{AppError, AppResult};
use crate::models::Job;
use crate::routes::documents::to_iso;
use crate::schema::jobs;
use crate::state::AppState;

#[derive(Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    pub progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    identity: Identity,
) -> AppResult<Json<JobStatusResponse>> {
    let mut conn = state.db()?;

    let job: Job = jobs::table
        .find(job_id)
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    if job.org_id != identity.org_id {
        return Err(AppError::forbidden());
    }

    Ok(Json(JobStatusResponse {
        job_id: job.id,
        status: job.status,
        progress: job.progress,
        result: job.result,
        error: job.last_error,
        created_at: to_iso(job.created_at),
        started_at: job.started_at.map(to_iso),
        completed_at: job.completed_at.map(to_iso),
    }))
}
