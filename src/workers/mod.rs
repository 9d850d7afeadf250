use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{
    jobs::{
        mark_job_completed, mark_job_failed, reserve_job, retry_job_after, JobQueueError,
        MAX_ATTEMPTS,
    },
    models::Job,
    state::AppState,
};

pub mod consolidate;
pub mod delete_vectors;
pub mod employee_embedding;
pub mod process_document;
pub mod reclassify;
pub mod sync_source;

/// Cooperative cancellation shared by the worker loop and its handlers.
/// Handlers check it between pipeline states and roll back as if the
/// current state had failed.
pub type CancelFlag = Arc<AtomicBool>;

#[derive(Debug)]
pub enum JobExecution {
    Success(Option<serde_json::Value>),
    Retry { delay: Duration, error: String },
    Failed { error: String },
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &'static str;
    async fn handle(&self, state: Arc<AppState>, job: Job, cancel: CancelFlag) -> JobExecution;
}

pub struct Worker {
    state: Arc<AppState>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    poll_interval: Duration,
    cancel: CancelFlag,
}

impl Worker {
    pub fn new(
        state: Arc<AppState>,
        handlers: Vec<Arc<dyn JobHandler>>,
        poll_interval: Duration,
    ) -> Self {
        let map = handlers
            .into_iter()
            .map(|handler| (handler.job_type(), handler))
            .collect();
        Self {
            state,
            handlers: map,
            poll_interval,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn run(&self) {
        info!("worker started");
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                info!("worker cancellation requested; draining stopped");
                return;
            }
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => sleep(self.poll_interval).await,
                Err(err) => {
                    error!(error = %err, "worker tick failed");
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    pub async fn tick(&self) -> Result<bool, JobQueueError> {
        let job_types: Vec<&str> = self.handlers.keys().copied().collect();
        if job_types.is_empty() {
            return Ok(false);
        }

        let mut conn = match self.state.db() {
            Ok(conn) => conn,
            Err(err) => {
                error!(?err, "failed to obtain database connection in worker");
                return Ok(false);
            }
        };

        let job_opt = reserve_job(&mut conn, &job_types)?;
        drop(conn);

        let Some(job) = job_opt else {
            return Ok(false);
        };

        let Some(handler) = self.handlers.get(job.job_type.as_str()) else {
            error!(job_type = %job.job_type, "no handler registered for job type");
            if let Ok(mut conn) = self.state.db() {
                mark_job_failed(&mut conn, job.id, "no handler registered")?;
            }
            return Ok(true);
        };

        let result = handler
            .handle(self.state.clone(), job.clone(), self.cancel.clone())
            .await;

        match result {
            JobExecution::Success(job_result) => {
                if let Ok(mut conn) = self.state.db() {
                    mark_job_completed(&mut conn, job.id, job_result)?;
                    info!(job_id = %job.id, job_type = %job.job_type, "job completed");
                } else {
                    error!("failed to mark job completed due to pool error");
                }
            }
            JobExecution::Retry { delay, error } => {
                if job.attempts >= MAX_ATTEMPTS {
                    error!(
                        job_id = %job.id, job_type = %job.job_type, %error,
                        attempts = job.attempts,
                        "job exhausted retries"
                    );
                    if let Ok(mut conn) = self.state.db() {
                        mark_job_failed(&mut conn, job.id, &error)?;
                    }
                } else {
                    warn!(job_id = %job.id, job_type = %job.job_type, %error, "job will retry");
                    if let Ok(mut conn) = self.state.db() {
                        retry_job_after(&mut conn, job.id, delay, &error)?;
                    } else {
                        error!("failed to requeue job for retry due to pool error");
                    }
                }
            }
            JobExecution::Failed { error } => {
                error!(job_id = %job.id, job_type = %job.job_type, %error, "job failed");
                if let Ok(mut conn) = self.state.db() {
                    mark_job_failed(&mut conn, job.id, &error)?;
                } else {
                    error!("failed to mark job failed due to pool error");
                }
            }
        }
        Ok(true)
    }
}

pub fn default_handlers() -> Vec<Arc<dyn JobHandler>> {
    vec![
        Arc::new(process_document::ProcessDocumentJob::new()),
        Arc::new(reclassify::ReclassifyDocumentJob::new()),
        Arc::new(delete_vectors::DeleteDocumentVectorsJob::new()),
        Arc::new(employee_embedding::GenerateEmployeeEmbeddingJob::new()),
        Arc::new(sync_source::SyncExternalSourceJob::new()),
        Arc::new(consolidate::ConsolidateMemoriesJob::new()),
    ]
}
