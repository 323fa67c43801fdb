//! Job storage contract and the in-memory implementation.
//!
//! Every mutating method is a conditional update: it applies only when the row is
//! in the expected state and reports `None`/`false` (zero rows affected) otherwise.
//! The claim is the only coordination between workers.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tidecrm_core::{JobId, WorkspaceId};

use super::types::{FailureRecord, Job, JobAction, JobLog, JobStatus};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// Transient failure talking to the store; retry on the next cycle.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed job row: {0}")]
    Serialization(String),
}

/// Poll query: pending jobs in one queue that this worker can execute now.
#[derive(Debug, Clone)]
pub struct EligibleQuery<'a> {
    pub queue: &'a str,
    pub job_types: &'a [String],
    pub now: DateTime<Utc>,
    pub limit: usize,
}

/// Sort order for job listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSort {
    #[default]
    CreatedAtDesc,
    CreatedAtAsc,
    /// Queue order: `priority desc, created_at asc`
    PriorityDesc,
}

/// Filter criteria for job listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sort: JobSort,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.job_type.as_deref().is_none_or(|t| job.job_type == t)
            && self.created_after.is_none_or(|at| job.created_at >= at)
            && self.created_before.is_none_or(|at| job.created_at <= at)
    }
}

/// Page-based pagination (pages start at 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: 1, limit: 50 }
    }
}

impl Pagination {
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit.unwrap_or(50).clamp(1, 1000),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

/// One page of a job listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Jobs matching the filter across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

/// Count of jobs in one status, optionally per queue and inside a time window.
///
/// `since` is matched against `completed_at` for completed jobs, `failed_at` for
/// failed jobs and `updated_at` otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountQuery {
    pub status: JobStatus,
    pub queue: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl CountQuery {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            queue: None,
            since: None,
        }
    }

    pub fn in_queue(mut self, queue: Option<&str>) -> Self {
        self.queue = queue.map(str::to_string);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if job.status != self.status {
            return false;
        }
        if self.queue.as_deref().is_some_and(|q| job.job_queue != q) {
            return false;
        }
        let Some(since) = self.since else {
            return true;
        };
        let stamp = match self.status {
            JobStatus::Completed => job.completed_at,
            JobStatus::Failed => job.failed_at,
            _ => Some(job.updated_at),
        };
        stamp.is_some_and(|at| at >= since)
    }
}

/// Persistence for jobs and their logs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly created job.
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    async fn list(
        &self,
        workspace_id: WorkspaceId,
        filter: &JobFilter,
        pagination: Pagination,
    ) -> Result<JobPage, JobStoreError>;

    /// Read-only discovery, ordered `priority desc, created_at asc`.
    async fn fetch_eligible(&self, query: &EligibleQuery<'_>) -> Result<Vec<Job>, JobStoreError>;

    /// pending -> processing with `attempts + 1`. `None` when the job is no longer pending.
    async fn claim(
        &self,
        job_id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Refresh `worker_heartbeat_at` if `worker_id` still holds the job.
    async fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Overwrite `progress` and refresh the heartbeat, only for the holding worker.
    async fn update_progress(
        &self,
        job_id: JobId,
        worker_id: &str,
        progress: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// processing -> completed, only for the holding worker.
    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// processing -> pending with `next_retry_at = now + delay`, only for the holding worker.
    async fn reschedule(
        &self,
        job_id: JobId,
        worker_id: &str,
        failure: &FailureRecord,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// processing -> failed, only for the holding worker.
    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        failure: &FailureRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Externally requested transition, applied only from `action.allowed_from()`.
    async fn transition(
        &self,
        job_id: JobId,
        action: JobAction,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Hand back processing jobs whose heartbeat is older than `cutoff`.
    ///
    /// Jobs with attempts left go back to `pending` (attempts unchanged); jobs
    /// already at `max_attempts` are failed with `failure`.
    async fn requeue_stale(
        &self,
        cutoff: DateTime<Utc>,
        failure: &FailureRecord,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    async fn append_log(&self, log: JobLog) -> Result<(), JobStoreError>;

    /// Logs for one job in the order they were appended.
    async fn logs(&self, job_id: JobId) -> Result<Vec<JobLog>, JobStoreError>;

    async fn count(&self, workspace_id: WorkspaceId, query: &CountQuery) -> Result<u64, JobStoreError>;

    /// Mean `completed_at - started_at` of jobs completed since `since`.
    async fn average_duration_ms(
        &self,
        workspace_id: WorkspaceId,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>, JobStoreError>;
}

/// Queue order: higher priority first, then oldest first.
pub(crate) fn queue_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// In-memory job store for tests/dev.
///
/// Each conditional update runs under the write lock, which gives the same
/// all-or-nothing behaviour as a single `UPDATE ... WHERE status = ...`.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    logs: RwLock<Vec<JobLog>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_jobs(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Unavailable("job table lock poisoned".into()))
    }

    fn write_jobs(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Unavailable("job table lock poisoned".into()))
    }

    /// Apply `change` to the job if `guard` accepts its current state.
    fn update_if<G, F>(&self, job_id: JobId, guard: G, change: F) -> Result<Option<Job>, JobStoreError>
    where
        G: FnOnce(&Job) -> bool,
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.write_jobs()?;
        match jobs.get_mut(&job_id) {
            Some(job) if guard(job) => {
                change(job);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        let mut jobs = self.write_jobs()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read_jobs()?.get(&job_id).cloned())
    }

    async fn list(
        &self,
        workspace_id: WorkspaceId,
        filter: &JobFilter,
        pagination: Pagination,
    ) -> Result<JobPage, JobStoreError> {
        let jobs = self.read_jobs()?;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| j.workspace_id == workspace_id && filter.matches(j))
            .cloned()
            .collect();
        drop(jobs);

        match filter.sort {
            JobSort::CreatedAtDesc => matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id))),
            JobSort::CreatedAtAsc => matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))),
            JobSort::PriorityDesc => matching.sort_by(queue_order),
        }

        let total = matching.len() as u64;
        let offset = usize::try_from(pagination.offset()).unwrap_or(usize::MAX);
        let jobs: Vec<Job> = matching
            .into_iter()
            .skip(offset)
            .take(pagination.limit as usize)
            .collect();
        let has_more = total > pagination.offset() + jobs.len() as u64;

        Ok(JobPage {
            jobs,
            total,
            pagination,
            has_more,
        })
    }

    async fn fetch_eligible(&self, query: &EligibleQuery<'_>) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read_jobs()?;
        let mut eligible: Vec<Job> = jobs
            .values()
            .filter(|j| {
                j.job_queue == query.queue
                    && query.job_types.iter().any(|t| *t == j.job_type)
                    && j.is_eligible_at(query.now)
            })
            .cloned()
            .collect();
        drop(jobs);

        eligible.sort_by(queue_order);
        eligible.truncate(query.limit);
        Ok(eligible)
    }

    async fn claim(
        &self,
        job_id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.update_if(
            job_id,
            |j| j.status == JobStatus::Pending,
            |j| j.mark_claimed(worker_id, now),
        )
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let updated = self.update_if(job_id, |j| j.is_held_by(worker_id), |j| j.record_heartbeat(now))?;
        Ok(updated.is_some())
    }

    async fn update_progress(
        &self,
        job_id: JobId,
        worker_id: &str,
        progress: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.update_if(job_id, |j| j.is_held_by(worker_id), |j| j.set_progress(progress, now))
    }

    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.update_if(job_id, |j| j.is_held_by(worker_id), |j| j.mark_completed(result, now))
    }

    async fn reschedule(
        &self,
        job_id: JobId,
        worker_id: &str,
        failure: &FailureRecord,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.update_if(
            job_id,
            |j| j.is_held_by(worker_id),
            |j| j.mark_retry_pending(failure, delay, now),
        )
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        failure: &FailureRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.update_if(job_id, |j| j.is_held_by(worker_id), |j| j.mark_failed(failure, now))
    }

    async fn transition(
        &self,
        job_id: JobId,
        action: JobAction,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.write_jobs()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if action.check(job.status).is_err() {
            return Ok(None);
        }
        job.apply_action(action, now);
        Ok(Some(job.clone()))
    }

    async fn requeue_stale(
        &self,
        cutoff: DateTime<Utc>,
        failure: &FailureRecord,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.write_jobs()?;
        let mut reaped = Vec::new();
        for job in jobs.values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.worker_heartbeat_at.is_none_or(|at| at < cutoff);
            if !stale {
                continue;
            }
            if job.attempts < job.max_attempts {
                job.mark_requeued(now);
            } else {
                job.mark_failed(failure, now);
            }
            reaped.push(job.clone());
        }
        reaped.sort_by(queue_order);
        Ok(reaped)
    }

    async fn append_log(&self, log: JobLog) -> Result<(), JobStoreError> {
        self.logs
            .write()
            .map_err(|_| JobStoreError::Unavailable("job log lock poisoned".into()))?
            .push(log);
        Ok(())
    }

    async fn logs(&self, job_id: JobId) -> Result<Vec<JobLog>, JobStoreError> {
        let logs = self
            .logs
            .read()
            .map_err(|_| JobStoreError::Unavailable("job log lock poisoned".into()))?;
        Ok(logs.iter().filter(|l| l.job_id == job_id).cloned().collect())
    }

    async fn count(&self, workspace_id: WorkspaceId, query: &CountQuery) -> Result<u64, JobStoreError> {
        let jobs = self.read_jobs()?;
        Ok(jobs
            .values()
            .filter(|j| j.workspace_id == workspace_id && query.matches(j))
            .count() as u64)
    }

    async fn average_duration_ms(
        &self,
        workspace_id: WorkspaceId,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>, JobStoreError> {
        let jobs = self.read_jobs()?;
        let durations: Vec<i64> = jobs
            .values()
            .filter(|j| {
                j.workspace_id == workspace_id
                    && j.status == JobStatus::Completed
                    && j.completed_at.is_some_and(|at| at >= since)
            })
            .filter_map(Job::duration_ms)
            .collect();

        if durations.is_empty() {
            return Ok(None);
        }
        Ok(Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64))
    }
}
