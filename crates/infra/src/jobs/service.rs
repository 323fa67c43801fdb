//! Producer and operator facing job API.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use tidecrm_core::{DomainError, JobId, WorkspaceId};

use super::notifier::{ChangeNotifier, JobChanged};
use super::stats::{JobStats, StatsAggregator};
use super::store::{JobFilter, JobPage, JobStore, JobStoreError, Pagination};
use super::types::{Job, JobAction, JobLog, JobStatus, LogLevel, NewJob};
use crate::workers::change_listener::{ChangeFilter, ChangeListener, ListenerHandle};

#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("cannot {} job {job_id}: it is {status}", .action.as_str())]
    TerminalTransitionRejected {
        job_id: JobId,
        status: JobStatus,
        action: JobAction,
    },
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("failed to start change listener: {0}")]
    Listener(#[from] std::io::Error),
}

pub type JobServiceResult<T> = Result<T, JobServiceError>;

/// A job together with its log lines, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWithLogs {
    pub job: Job,
    pub logs: Vec<JobLog>,
}

#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    notifier: ChangeNotifier,
    stats: StatsAggregator,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, notifier: ChangeNotifier) -> Self {
        Self {
            stats: StatsAggregator::new(store.clone()),
            store,
            notifier,
        }
    }

    pub async fn create_job(&self, new_job: NewJob) -> JobServiceResult<Job> {
        new_job.validate()?;
        let job = self.store.insert(new_job.into_job(Utc::now())).await?;

        self.notifier.job_changed(&job);
        self.log(
            &job,
            LogLevel::Info,
            "job created".to_string(),
            json!({ "job_type": job.job_type, "job_queue": job.job_queue, "priority": job.priority }),
        )
        .await;
        info!(
            job_id = %job.id,
            workspace_id = %job.workspace_id,
            job_type = %job.job_type,
            queue = %job.job_queue,
            "job created"
        );

        Ok(job)
    }

    pub async fn get_jobs(
        &self,
        workspace_id: WorkspaceId,
        filter: &JobFilter,
        pagination: Pagination,
    ) -> JobServiceResult<JobPage> {
        Ok(self.store.list(workspace_id, filter, pagination).await?)
    }

    pub async fn get_job(&self, job_id: JobId) -> JobServiceResult<Job> {
        self.store
            .get(job_id)
            .await?
            .ok_or(JobServiceError::NotFound(job_id))
    }

    pub async fn get_job_with_logs(&self, job_id: JobId) -> JobServiceResult<JobWithLogs> {
        let job = self.get_job(job_id).await?;
        let logs = self.store.logs(job_id).await?;
        Ok(JobWithLogs { job, logs })
    }

    /// Cancel a pending or processing job. A running processor is not interrupted;
    /// its result is discarded.
    pub async fn cancel_job(&self, job_id: JobId) -> JobServiceResult<Job> {
        let job = self.apply(job_id, JobAction::Cancel).await?;
        self.log(&job, LogLevel::Info, "job cancelled".to_string(), JsonValue::Null)
            .await;
        Ok(job)
    }

    /// Send a failed job back to the queue with a fresh attempt budget.
    pub async fn retry_job(&self, job_id: JobId) -> JobServiceResult<Job> {
        let job = self.apply(job_id, JobAction::Retry).await?;
        self.log(&job, LogLevel::Info, "job retried manually".to_string(), JsonValue::Null)
            .await;
        Ok(job)
    }

    /// Park a failed job for operator follow-up.
    pub async fn dead_letter_job(&self, job_id: JobId, reason: impl Into<String>) -> JobServiceResult<Job> {
        let reason = reason.into();
        let job = self.apply(job_id, JobAction::DeadLetter).await?;
        self.log(
            &job,
            LogLevel::Warning,
            format!("job moved to dead letter: {reason}"),
            json!({ "reason": reason }),
        )
        .await;
        Ok(job)
    }

    pub async fn get_job_stats(&self, workspace_id: WorkspaceId) -> JobStats {
        self.stats.compute(workspace_id, None, Utc::now()).await
    }

    /// Stats with `queue_depth` restricted to one queue.
    pub async fn get_queue_stats(&self, workspace_id: WorkspaceId, queue: &str) -> JobStats {
        self.stats.compute(workspace_id, Some(queue), Utc::now()).await
    }

    /// Call `callback` for every change to one job until the handle is shut down.
    pub fn on_job_change<H>(&self, job_id: JobId, callback: H) -> JobServiceResult<ListenerHandle>
    where
        H: FnMut(JobChanged) + Send + 'static,
    {
        Ok(ChangeListener::spawn(
            format!("job-{job_id}"),
            self.notifier.subscribe(),
            ChangeFilter::Job(job_id),
            callback,
        )?)
    }

    /// Call `callback` for every change to any job of one workspace.
    pub fn on_workspace_jobs_change<H>(
        &self,
        workspace_id: WorkspaceId,
        callback: H,
    ) -> JobServiceResult<ListenerHandle>
    where
        H: FnMut(JobChanged) + Send + 'static,
    {
        Ok(ChangeListener::spawn(
            format!("workspace-{workspace_id}"),
            self.notifier.subscribe(),
            ChangeFilter::Workspace(workspace_id),
            callback,
        )?)
    }

    async fn apply(&self, job_id: JobId, action: JobAction) -> JobServiceResult<Job> {
        let job = match self.store.transition(job_id, action, Utc::now()).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                let current = self.get_job(job_id).await?;
                warn!(job_id = %job_id, status = %current.status, action = action.as_str(), "job transition rejected");
                return Err(JobServiceError::TerminalTransitionRejected {
                    job_id,
                    status: current.status,
                    action,
                });
            }
            Err(JobStoreError::NotFound(_)) => return Err(JobServiceError::NotFound(job_id)),
            Err(err) => return Err(err.into()),
        };

        self.notifier.job_changed(&job);
        info!(job_id = %job_id, action = action.as_str(), status = %job.status, "job transition applied");
        Ok(job)
    }

    async fn log(&self, job: &Job, level: LogLevel, message: String, metadata: JsonValue) {
        if let Err(err) = self.store.append_log(JobLog::new(job.id, level, message, metadata)).await {
            warn!(job_id = %job.id, error = %err, "failed to append job log");
        }
    }
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService").finish_non_exhaustive()
    }
}
