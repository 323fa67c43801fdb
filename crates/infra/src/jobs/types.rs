//! Core job types and the retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tidecrm_core::{DomainError, DomainResult, JobId, JobLogId, WorkspaceId};

/// Queue served by workers that are not configured otherwise.
pub const DEFAULT_QUEUE: &str = "default";

/// Attempts a job gets unless its producer says otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed (also used while waiting for a retry)
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Processor returned a result
    Completed,
    /// Exhausted its attempts
    Failed,
    /// Cancelled by a user/operator
    Cancelled,
    /// Escalated by an operator after failing
    DeadLetter,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::DeadLetter
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Status changes requested from outside the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Cancel,
    Retry,
    DeadLetter,
}

impl JobAction {
    /// States the action may be applied from. Anything else is rejected.
    pub fn allowed_from(&self) -> &'static [JobStatus] {
        match self {
            JobAction::Cancel => &[JobStatus::Pending, JobStatus::Processing],
            JobAction::Retry => &[JobStatus::Failed],
            JobAction::DeadLetter => &[JobStatus::Failed],
        }
    }

    pub fn target(&self) -> JobStatus {
        match self {
            JobAction::Cancel => JobStatus::Cancelled,
            JobAction::Retry => JobStatus::Pending,
            JobAction::DeadLetter => JobStatus::DeadLetter,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Cancel => "cancel",
            JobAction::Retry => "retry",
            JobAction::DeadLetter => "dead_letter",
        }
    }

    pub fn check(&self, current: JobStatus) -> DomainResult<()> {
        if self.allowed_from().contains(&current) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(format!(
                "cannot {} a job that is {current}",
                self.as_str()
            )))
        }
    }
}

/// Severity of a job log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(DomainError::validation(format!("unknown log level: {other}"))),
        }
    }
}

/// Outcome of a single failed attempt, as persisted on the job row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub message: String,
    pub stack: Option<String>,
}

impl FailureRecord {
    pub fn new(message: impl Into<String>, stack: Option<String>) -> Self {
        Self {
            message: message.into(),
            stack,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back to `pending`, eligible again after `delay`.
    Retry { delay: Duration },
    /// The job has used all of its attempts.
    GiveUp,
}

/// Exponential backoff: `min(base * 2^(attempt-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before the next attempt, given the number of attempts made so far (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn should_retry(&self, attempts: u32, max_attempts: u32) -> bool {
        attempts < max_attempts
    }

    pub fn decide(&self, attempts: u32, max_attempts: u32) -> RetryDecision {
        if self.should_retry(attempts, max_attempts) {
            RetryDecision::Retry {
                delay: self.delay_for_attempt(attempts),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Producer input for a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub workspace_id: WorkspaceId,
    pub job_type: String,
    pub payload: JsonValue,
    pub priority: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub job_queue: String,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(workspace_id: WorkspaceId, job_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            workspace_id,
            job_type: job_type.into(),
            payload,
            priority: 0,
            scheduled_for: None,
            job_queue: DEFAULT_QUEUE.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// The job is not claimable before `at`.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Schedule the job `delay` from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_for = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn queue(mut self, job_queue: impl Into<String>) -> Self {
        self.job_queue = job_queue.into();
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(DomainError::validation("job_type must not be empty"));
        }
        if self.job_queue.trim().is_empty() {
            return Err(DomainError::validation("job_queue must not be empty"));
        }
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            workspace_id: self.workspace_id,
            job_type: self.job_type,
            job_queue: self.job_queue,
            priority: self.priority,
            scheduled_for: self.scheduled_for,
            created_at: now,
            updated_at: now,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            worker_id: None,
            worker_heartbeat_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            next_retry_at: None,
            retry_delay_seconds: None,
            payload: self.payload,
            progress: None,
            result: None,
            error_message: None,
            error_stack: None,
        }
    }
}

/// A background job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub workspace_id: WorkspaceId,

    pub job_type: String,
    pub job_queue: String,

    pub priority: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub worker_id: Option<String>,
    pub worker_heartbeat_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub retry_delay_seconds: Option<u32>,

    pub payload: JsonValue,
    /// `{percentage, message, ...}`, overwritten in place
    pub progress: Option<JsonValue>,
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
}

impl Job {
    /// Whether a poll at `now` may offer this job.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.scheduled_for.is_none_or(|at| at <= now)
            && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Whether the job is currently held by `worker_id`.
    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Processing && self.worker_id.as_deref() == Some(worker_id)
    }

    /// Wall-clock time of the successful attempt.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
            _ => None,
        }
    }

    pub fn progress_percentage(&self) -> Option<u64> {
        self.progress
            .as_ref()
            .and_then(|p| p.get("percentage"))
            .and_then(JsonValue::as_u64)
    }

    /// Claim: pending -> processing, one more attempt.
    pub fn mark_claimed(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.worker_id = Some(worker_id.to_string());
        self.worker_heartbeat_at = Some(now);
        self.started_at = Some(now);
        self.updated_at = now;
    }

    pub fn record_heartbeat(&mut self, now: DateTime<Utc>) {
        self.worker_heartbeat_at = Some(now);
        self.updated_at = now;
    }

    pub fn set_progress(&mut self, progress: JsonValue, now: DateTime<Utc>) {
        self.progress = Some(progress);
        self.record_heartbeat(now);
    }

    pub fn mark_completed(&mut self, result: JsonValue, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.result = Some(result);
        self.progress = Some(serde_json::json!({ "percentage": 100 }));
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// Failed attempt that will be retried after `delay`.
    pub fn mark_retry_pending(&mut self, failure: &FailureRecord, delay: Duration, now: DateTime<Utc>) {
        let delay_secs = u32::try_from(delay.as_secs()).unwrap_or(u32::MAX);
        self.status = JobStatus::Pending;
        self.worker_id = None;
        self.retry_delay_seconds = Some(delay_secs);
        self.next_retry_at = Some(now + chrono::Duration::seconds(i64::from(delay_secs)));
        self.record_failure(failure);
        self.updated_at = now;
    }

    /// Failed attempt with no attempts left.
    pub fn mark_failed(&mut self, failure: &FailureRecord, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.failed_at = Some(now);
        self.completed_at = Some(now);
        self.next_retry_at = None;
        self.record_failure(failure);
        self.updated_at = now;
    }

    /// Stale processing job handed back to the queue; `attempts` is kept.
    pub fn mark_requeued(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.worker_id = None;
        self.worker_heartbeat_at = None;
        self.updated_at = now;
    }

    /// Apply an externally requested transition. Callers check `action.check()` first.
    pub fn apply_action(&mut self, action: JobAction, now: DateTime<Utc>) {
        match action {
            JobAction::Cancel | JobAction::DeadLetter => {}
            JobAction::Retry => {
                self.attempts = 0;
                self.worker_id = None;
                self.worker_heartbeat_at = None;
                self.started_at = None;
                self.completed_at = None;
                self.failed_at = None;
                self.next_retry_at = None;
                self.retry_delay_seconds = None;
                self.progress = None;
                self.result = None;
                self.error_message = None;
                self.error_stack = None;
            }
        }
        self.status = action.target();
        self.updated_at = now;
    }

    fn record_failure(&mut self, failure: &FailureRecord) {
        self.error_message = Some(failure.message.clone());
        self.error_stack = failure.stack.clone();
    }
}

/// Immutable, append-only execution narrative for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub id: JobLogId,
    pub job_id: JobId,
    pub log_level: LogLevel,
    pub message: String,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl JobLog {
    pub fn new(job_id: JobId, log_level: LogLevel, message: impl Into<String>, metadata: JsonValue) -> Self {
        Self {
            id: JobLogId::new(),
            job_id,
            log_level,
            message: message.into(),
            metadata,
            created_at: Utc::now(),
        }
    }
}
