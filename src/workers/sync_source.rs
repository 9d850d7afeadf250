//! External source sync. The connector lives in a separate service; this
//! handler records the request so the job surface stays uniform.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::{jobs::JOB_SYNC_EXTERNAL_SOURCE, models::Job, state::AppState};

use super::{CancelFlag, JobExecution, JobHandler};

pub struct SyncExternalSourceJob;

impl SyncExternalSourceJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for SyncExternalSourceJob {
    fn job_type(&self) -> &'static str {
        JOB_SYNC_EXTERNAL_SOURCE
    }

    async fn handle(&self, _state: Arc<AppState>, job: Job, _cancel: CancelFlag) -> JobExecution {
        info!(job_id = %job.id, org_id = job.org_id, "external source sync requested");
        JobExecution::Success(Some(json!({
            "status": "not_configured",
            "detail": "no external source connector is configured for this deployment",
        })))
    }
}
