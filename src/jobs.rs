use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Job, NewJob};
use crate::schema::jobs;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

pub const JOB_PROCESS_DOCUMENT: &str = "process-document";
pub const JOB_RECLASSIFY_DOCUMENT: &str = "reclassify-document";
pub const JOB_DELETE_DOCUMENT_VECTORS: &str = "delete-document-vectors";
pub const JOB_GENERATE_EMPLOYEE_EMBEDDING: &str = "generate-employee-embedding";
pub const JOB_SYNC_EXTERNAL_SOURCE: &str = "sync-external-source";
pub const JOB_CONSOLIDATE_MEMORIES: &str = "consolidate-memories";

/// Transient failures are requeued with backoff up to this many attempts.
pub const MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type JobQueueResult<T> = Result<T, JobQueueError>;

pub fn enqueue_job(
    conn: &mut PgConnection,
    org_id: i64,
    job_type: &str,
    payload: Value,
    run_after: Option<NaiveDateTime>,
) -> JobQueueResult<Job> {
    let new_job = NewJob {
        id: Uuid::new_v4(),
        org_id,
        job_type: job_type.to_string(),
        payload,
        status: STATUS_QUEUED.to_string(),
        run_after: run_after.unwrap_or_else(|| Utc::now().naive_utc()),
    };

    diesel::insert_into(jobs::table)
        .values(&new_job)
        .execute(conn)?;

    let job = jobs::table.find(new_job.id).first(conn)?;
    Ok(job)
}

/// Claims the oldest runnable job, moving it to `running` and stamping
/// `started_at` on first claim. Uses `FOR UPDATE SKIP LOCKED` so concurrent
/// workers never double-claim.
pub fn reserve_job(conn: &mut PgConnection, job_types: &[&str]) -> JobQueueResult<Option<Job>> {
    let now = Utc::now().naive_utc();

    conn.transaction(|conn| {
        let job_opt = jobs::table
            .filter(jobs::status.eq(STATUS_QUEUED))
            .filter(jobs::run_after.le(now))
            .filter(jobs::job_type.eq_any(job_types))
            .order(jobs::run_after.asc())
            .for_update()
            .skip_locked()
            .first::<Job>(conn)
            .optional()?;

        if let Some(job) = job_opt {
            diesel::update(jobs::table.find(job.id))
                .set((
                    jobs::status.eq(STATUS_RUNNING),
                    jobs::attempts.eq(job.attempts + 1),
                    jobs::started_at.eq(job.started_at.unwrap_or(now)),
                    jobs::updated_at.eq(now),
                ))
                .execute(conn)?;

            let refreshed = jobs::table.find(job.id).first(conn)?;
            Ok::<Option<Job>, diesel::result::Error>(Some(refreshed))
        } else {
            Ok::<Option<Job>, diesel::result::Error>(None)
        }
    })
    .map_err(JobQueueError::from)
}

/// Progress only moves forward; a stale writer can never roll it back.
pub fn set_job_progress(
    conn: &mut PgConnection,
    job_id: Uuid,
    progress: i32,
) -> JobQueueResult<()> {
    let clamped = progress.clamp(0, 100);
    diesel::update(jobs::table.find(job_id))
        .filter(jobs::progress.lt(clamped))
        .set((
            jobs::progress.eq(clamped),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn mark_job_completed(
    conn: &mut PgConnection,
    job_id: Uuid,
    result: Option<Value>,
) -> JobQueueResult<()> {
    let now = Utc::now().naive_utc();
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_COMPLETED),
            jobs::progress.eq(100),
            jobs::result.eq(result),
            jobs::last_error.eq::<Option<String>>(None),
            jobs::completed_at.eq(now),
            jobs::updated_at.eq(now),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn retry_job_after(
    conn: &mut PgConnection,
    job_id: Uuid,
    delay: Duration,
    error_message: &str,
) -> JobQueueResult<()> {
    let next_run = Utc::now()
        + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(30));

    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_QUEUED),
            jobs::run_after.eq(next_run.naive_utc()),
            jobs::last_error.eq(Some(error_message.to_string())),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn mark_job_failed(
    conn: &mut PgConnection,
    job_id: Uuid,
    error_message: &str,
) -> JobQueueResult<()> {
    let now = Utc::now().naive_utc();
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_FAILED),
            jobs::last_error.eq(Some(error_message.to_string())),
            jobs::completed_at.eq(now),
            jobs::updated_at.eq(now),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn queued_depth(conn: &mut PgConnection) -> JobQueueResult<i64> {
    let count = jobs::table
        .filter(jobs::status.eq(STATUS_QUEUED))
        .count()
        .get_result(conn)?;
    Ok(count)
}
