//! Removes a deleted document's vectors from the tenant namespace.
//!
//! Runs after the soft delete so searches converge to zero hits for the
//! document; the relational row itself is hard-deleted later by the
//! retention sweep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    index::{namespace_for_org, VectorIndex as _},
    jobs::JOB_DELETE_DOCUMENT_VECTORS,
    models::Job,
    state::AppState,
};

use super::{CancelFlag, JobExecution, JobHandler};

#[derive(Debug, Deserialize)]
struct DeleteVectorsPayload {
    document_id: Uuid,
    org_id: i64,
}

pub struct DeleteDocumentVectorsJob;

impl DeleteDocumentVectorsJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for DeleteDocumentVectorsJob {
    fn job_type(&self) -> &'static str {
        JOB_DELETE_DOCUMENT_VECTORS
    }

    async fn handle(&self, state: Arc<AppState>, job: Job, _cancel: CancelFlag) -> JobExecution {
        let payload: DeleteVectorsPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid delete-vectors payload: {err}"),
                }
            }
        };

        match state
            .index
            .delete_document(&namespace_for_org(payload.org_id), payload.document_id)
            .await
        {
            Ok(()) => JobExecution::Success(Some(json!({ "doc_id": payload.document_id }))),
            Err(err) if err.is_transient() => JobExecution::Retry {
                delay: Duration::from_secs(30),
                error: err.to_string(),
            },
            Err(err) => JobExecution::Failed {
                error: err.to_string(),
            },
        }
    }
}
