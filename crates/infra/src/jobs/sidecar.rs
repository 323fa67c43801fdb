//! Progress and log writes available to a running processor.
//!
//! Neither operation touches the claim or the retry bookkeeping.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use tracing::debug;

use tidecrm_core::JobId;

use super::notifier::ChangeNotifier;
use super::registry::ProcessorError;
use super::store::{JobStore, JobStoreError};
use super::types::{JobLog, LogLevel};

/// Writes on behalf of one worker; progress only lands on jobs it still holds.
#[derive(Clone)]
pub struct JobSidecar {
    store: Arc<dyn JobStore>,
    notifier: ChangeNotifier,
    worker_id: Arc<str>,
}

impl JobSidecar {
    pub fn new(store: Arc<dyn JobStore>, notifier: ChangeNotifier, worker_id: impl Into<Arc<str>>) -> Self {
        Self {
            store,
            notifier,
            worker_id: worker_id.into(),
        }
    }

    /// Overwrite the job's progress and refresh its heartbeat.
    ///
    /// Returns `false` when this worker no longer holds the job (cancelled,
    /// reaped, reclaimed elsewhere); nothing is written in that case.
    pub async fn report_progress(
        &self,
        job_id: JobId,
        percentage: u8,
        message: impl Into<String>,
    ) -> Result<bool, JobStoreError> {
        let progress = json!({
            "percentage": percentage.min(100),
            "message": message.into(),
        });

        match self
            .store
            .update_progress(job_id, &self.worker_id, progress, Utc::now())
            .await?
        {
            Some(job) => {
                self.notifier.job_changed(&job);
                Ok(true)
            }
            None => {
                debug!(job_id = %job_id, worker_id = %self.worker_id, "progress ignored for job this worker does not hold");
                Ok(false)
            }
        }
    }

    /// Append one immutable log line.
    pub async fn append_log(
        &self,
        job_id: JobId,
        level: LogLevel,
        message: impl Into<String>,
        metadata: JsonValue,
    ) -> Result<(), JobStoreError> {
        self.store
            .append_log(JobLog::new(job_id, level, message, metadata))
            .await
    }

    /// Sidecar bound to one job, as handed to `Processor::process`.
    pub fn context(&self, job_id: JobId) -> JobContext {
        JobContext {
            job_id,
            sidecar: self.clone(),
        }
    }
}

impl std::fmt::Debug for JobSidecar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSidecar")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

/// Handle a processor uses to report on the job it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    sidecar: JobSidecar,
}

impl JobContext {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn report_progress(
        &self,
        percentage: u8,
        message: impl Into<String>,
    ) -> Result<bool, JobStoreError> {
        self.sidecar.report_progress(self.job_id, percentage, message).await
    }

    pub async fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        metadata: JsonValue,
    ) -> Result<(), JobStoreError> {
        self.sidecar.append_log(self.job_id, level, message, metadata).await
    }

    pub async fn info(&self, message: impl Into<String>) -> Result<(), JobStoreError> {
        self.log(LogLevel::Info, message, JsonValue::Null).await
    }

    pub async fn warning(&self, message: impl Into<String>) -> Result<(), JobStoreError> {
        self.log(LogLevel::Warning, message, JsonValue::Null).await
    }
}

impl From<JobStoreError> for ProcessorError {
    fn from(err: JobStoreError) -> Self {
        ProcessorError::new(format!("job store error: {err}"))
    }
}
