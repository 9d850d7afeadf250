use axum::extract::{Json, Query, State};
use chrono::{Datelike, NaiveDate, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::auth::Identity;
use crate::error::AppResult;
use crate::routes::documents::OrgQuery;
use crate::schema::{conversations, documents, jobs, usage_counters};
use crate::state::AppState;

#[derive(Serialize)]
pub struct SystemStatusResponse {
    pub documents: DocumentCounts,
    pub jobs: JobCounts,
    pub conversations: i64,
    pub usage_this_month: UsageSummary,
}

#[derive(Serialize, Default)]
pub struct DocumentCounts {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Serialize, Default)]
pub struct JobCounts {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Serialize, Default)]
pub struct UsageSummary {
    pub tokens: i64,
    pub api_calls: i64,
    pub estimated_cost: f64,
}

pub async fn system_status(
    State(state): State<AppState>,
    Query(params): Query<OrgQuery>,
    identity: Identity,
) -> AppResult<Json<SystemStatusResponse>> {
    identity.require_org(params.org_id)?;
    let mut conn = state.db()?;

    let doc_rows: Vec<(String, i64)> = documents::table
        .filter(documents::org_id.eq(params.org_id))
        .filter(documents::is_deleted.eq(false))
        .group_by(documents::status)
        .select((documents::status, diesel::dsl::count_star()))
        .load(&mut conn)?;
    let mut documents_counts = DocumentCounts::default();
    for (status, count) in doc_rows {
        documents_counts.total += count;
        match status.as_str() {
            "pending" => documents_counts.pending = count,
            "processing" => documents_counts.processing = count,
            "completed" => documents_counts.completed = count,
            "failed" => documents_counts.failed = count,
            _ => {}
        }
    }

    let job_rows: Vec<(String, i64)> = jobs::table
        .filter(jobs::org_id.eq(params.org_id))
        .group_by(jobs::status)
        .select((jobs::status, diesel::dsl::count_star()))
        .load(&mut conn)?;
    let mut job_counts = JobCounts::default();
    for (status, count) in job_rows {
        match status.as_str() {
            "queued" => job_counts.queued = count,
            "running" => job_counts.running = count,
            "completed" => job_counts.completed = count,
            "failed" => job_counts.failed = count,
            _ => {}
        }
    }

    let conversation_count: i64 = conversations::table
        .filter(conversations::org_id.eq(params.org_id))
        .count()
        .get_result(&mut conn)?;

    let today = Utc::now().date_naive();
    let month_start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today);
    let usage_rows: Vec<(i64, i64, f64)> = usage_counters::table
        .filter(usage_counters::org_id.eq(params.org_id))
        .filter(usage_counters::date.ge(month_start))
        .select((
            usage_counters::tokens,
            usage_counters::api_calls,
            usage_counters::estimated_cost,
        ))
        .load(&mut conn)?;
    let mut usage = UsageSummary::default();
    for (tokens, api_calls, cost) in usage_rows {
        usage.tokens += tokens;
        usage.api_calls += api_calls;
        usage.estimated_cost += cost;
    }

    Ok(Json(SystemStatusResponse {
        documents: documents_counts,
        jobs: job_counts,
        conversations: conversation_count,
        usage_this_month: usage,
    }))
}
