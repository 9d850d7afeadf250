//! Nightly consolidation: hard-deletes soft-deleted documents past the
//! retention window (vectors first, then rows) and prunes terminal jobs.
//! Scheduled by the maintenance binary; also runnable as a queued job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use serde_json::json;
use tokio::task;
use tracing::info;
use uuid::Uuid;

use crate::{
    index::{namespace_for_org, VectorIndex as _},
    jobs::JOB_CONSOLIDATE_MEMORIES,
    models::Job,
    schema::{documents, jobs},
    state::AppState,
};

use super::{CancelFlag, JobExecution, JobHandler};

const DELETED_DOCUMENT_RETENTION_DAYS: i64 = 7;
const TERMINAL_JOB_RETENTION_DAYS: i64 = 30;

pub struct ConsolidateMemoriesJob;

impl ConsolidateMemoriesJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for ConsolidateMemoriesJob {
    fn job_type(&self) -> &'static str {
        JOB_CONSOLIDATE_MEMORIES
    }

    async fn handle(&self, state: Arc<AppState>, _job: Job, _cancel: CancelFlag) -> JobExecution {
        match run_sweep(&state).await {
            Ok((documents_removed, jobs_pruned)) => JobExecution::Success(Some(json!({
                "documents_removed": documents_removed,
                "jobs_pruned": jobs_pruned,
            }))),
            Err(err) => JobExecution::Retry {
                delay: Duration::from_secs(300),
                error: err,
            },
        }
    }
}

/// The administrative sweep. Vectors are removed before the relational row
/// so a half-finished sweep never leaves orphaned vectors behind.
pub async fn run_sweep(state: &Arc<AppState>) -> Result<(usize, usize), String> {
    let pool = state.pool.clone();
    let cutoff = (Utc::now() - ChronoDuration::days(DELETED_DOCUMENT_RETENTION_DAYS)).naive_utc();
    let expired: Vec<(Uuid, i64)> = task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        documents::table
            .filter(documents::is_deleted.eq(true))
            .filter(documents::deleted_at.le(cutoff))
            .select((documents::id, documents::org_id))
            .load(&mut conn)
            .map_err(|err| err.to_string())
    })
    .await
    .map_err(|join| join.to_string())??;

    let mut removed = 0usize;
    for (document_id, org_id) in expired {
        state
            .index
            .delete_document(&namespace_for_org(org_id), document_id)
            .await
            .map_err(|err| err.to_string())?;

        let pool = state.pool.clone();
        task::spawn_blocking(move || -> Result<(), String> {
            let mut conn = pool.get().map_err(|err| err.to_string())?;
            diesel::delete(documents::table.find(document_id))
                .execute(&mut conn)
                .map_err(|err| err.to_string())?;
            Ok(())
        })
        .await
        .map_err(|join| join.to_string())??;
        removed += 1;
    }

    let pool = state.pool.clone();
    let job_cutoff = (Utc::now() - ChronoDuration::days(TERMINAL_JOB_RETENTION_DAYS)).naive_utc();
    let pruned = task::spawn_blocking(move || -> Result<usize, String> {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        diesel::delete(
            jobs::table
                .filter(jobs::status.eq_any(["completed", "failed"]))
                .filter(jobs::completed_at.le(job_cutoff)),
        )
        .execute(&mut conn)
        .map_err(|err| err.to_string())
    })
    .await
    .map_err(|join| join.to_string())??;

    info!(removed, pruned, "consolidation sweep finished");
    Ok((removed, pruned))
}
