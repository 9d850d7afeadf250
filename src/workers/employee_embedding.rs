//! Builds or refreshes one employee's profile vector.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task;

use crate::{
    employees,
    jobs::JOB_GENERATE_EMPLOYEE_EMBEDDING,
    models::{Job, NewEmployeeEmbedding},
    schema::employee_embeddings,
    state::AppState,
};

use super::{CancelFlag, JobExecution, JobHandler};

#[derive(Debug, Deserialize)]
struct EmployeePayload {
    org_id: i64,
    user_id: i64,
    /// Fresh profile data; when absent the stored snapshot is re-embedded.
    profile: Option<Value>,
}

pub struct GenerateEmployeeEmbeddingJob;

impl GenerateEmployeeEmbeddingJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for GenerateEmployeeEmbeddingJob {
    fn job_type(&self) -> &'static str {
        JOB_GENERATE_EMPLOYEE_EMBEDDING
    }

    async fn handle(&self, state: Arc<AppState>, job: Job, _cancel: CancelFlag) -> JobExecution {
        let payload: EmployeePayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid employee-embedding payload: {err}"),
                }
            }
        };

        let snapshot = match payload.profile {
            Some(profile) => profile,
            None => {
                let pool = state.pool.clone();
                let (user_id, org_id) = (payload.user_id, payload.org_id);
                let stored = task::spawn_blocking(move || -> Result<Option<Value>, String> {
                    let mut conn = pool.get().map_err(|err| err.to_string())?;
                    let snapshot: Option<Value> = employee_embeddings::table
                        .find((user_id, org_id))
                        .select(employee_embeddings::profile_snapshot)
                        .first(&mut conn)
                        .optional()
                        .map_err(|err| err.to_string())?;
                    Ok(snapshot)
                })
                .await;

                match stored.unwrap_or_else(|join| Err(join.to_string())) {
                    Ok(Some(snapshot)) => snapshot,
                    Ok(None) => {
                        return JobExecution::Failed {
                            error: "no profile snapshot available for employee".to_string(),
                        }
                    }
                    Err(err) => {
                        return JobExecution::Retry {
                            delay: Duration::from_secs(30),
                            error: err,
                        }
                    }
                }
            }
        };

        let vector_id = match employees::upsert_employee_vector(
            &state,
            payload.org_id,
            payload.user_id,
            &snapshot,
        )
        .await
        {
            Ok(vector_id) => vector_id,
            Err(err) if err.status().is_server_error() || err.status().as_u16() == 503 => {
                return JobExecution::Retry {
                    delay: Duration::from_secs(30),
                    error: err.message().to_string(),
                }
            }
            Err(err) => {
                return JobExecution::Failed {
                    error: err.message().to_string(),
                }
            }
        };

        let pool = state.pool.clone();
        let row = NewEmployeeEmbedding {
            user_id: payload.user_id,
            org_id: payload.org_id,
            vector_id: vector_id.clone(),
            profile_snapshot: snapshot,
        };
        let written = task::spawn_blocking(move || -> Result<(), String> {
            let mut conn = pool.get().map_err(|err| err.to_string())?;
            diesel::insert_into(employee_embeddings::table)
                .values(&row)
                .on_conflict((employee_embeddings::user_id, employee_embeddings::org_id))
                .do_update()
                .set((
                    employee_embeddings::vector_id.eq(&row.vector_id),
                    employee_embeddings::profile_snapshot.eq(&row.profile_snapshot),
                    employee_embeddings::last_updated.eq(Utc::now().naive_utc()),
                ))
                .execute(&mut conn)
                .map_err(|err| err.to_string())?;
            Ok(())
        })
        .await;

        match written.unwrap_or_else(|join| Err(join.to_string())) {
            Ok(()) => JobExecution::Success(Some(json!({
                "user_id": payload.user_id,
                "vector_id": vector_id,
            }))),
            Err(err) => JobExecution::Retry {
                delay: Duration::from_secs(30),
                error: err,
            },
        }
    }
}
