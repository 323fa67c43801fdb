//! Per-job state machine: claim, run, then complete, reschedule or fail.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, error, info, warn};

use super::notifier::ChangeNotifier;
use super::registry::{ProcessorError, ProcessorRegistry};
use super::sidecar::{JobContext, JobSidecar};
use super::store::{JobStore, JobStoreError};
use super::types::{FailureRecord, Job, LogLevel, RetryDecision, RetryPolicy};

/// How a single `execute` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Another worker claimed the job first (or it left `pending`).
    ClaimLost,
    Completed,
    /// Failed attempt; the job is pending again after `delay`.
    Rescheduled { delay: Duration },
    /// Failed attempt with no attempts left.
    Failed,
    /// The final write matched no row: the job was cancelled or reaped while running.
    Superseded,
    /// The store rejected a write; the reaper recovers the job if it stays processing.
    StoreError(String),
}

/// Runs claimed jobs on behalf of one worker.
#[derive(Clone)]
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    registry: Arc<ProcessorRegistry>,
    notifier: ChangeNotifier,
    sidecar: JobSidecar,
    worker_id: String,
    policy: RetryPolicy,
    heartbeat_interval: Duration,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<ProcessorRegistry>,
        notifier: ChangeNotifier,
        worker_id: impl Into<String>,
    ) -> Self {
        let worker_id = worker_id.into();
        let sidecar = JobSidecar::new(store.clone(), notifier.clone(), worker_id.as_str());
        Self {
            store,
            registry,
            notifier,
            sidecar,
            worker_id,
            policy: RetryPolicy::default(),
            heartbeat_interval: Duration::from_secs(15),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Zero is ignored; the ticker needs a non-zero period.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.heartbeat_interval = interval;
        }
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim `job` and drive it to its next resting state.
    ///
    /// Processor failures never escape; they are recorded on the row.
    pub async fn execute(&self, job: &Job) -> ExecutionOutcome {
        let claimed = match self.store.claim(job.id, &self.worker_id, Utc::now()).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return ExecutionOutcome::ClaimLost,
            Err(err) => {
                warn!(job_id = %job.id, worker_id = %self.worker_id, error = %err, "claim failed");
                return ExecutionOutcome::StoreError(err.to_string());
            }
        };
        self.notifier.job_changed(&claimed);

        debug!(
            job_id = %claimed.id,
            job_type = %claimed.job_type,
            worker_id = %self.worker_id,
            attempt = claimed.attempts,
            "job claimed"
        );

        let ctx = self.sidecar.context(claimed.id);
        let result = self.run(&claimed, &ctx).await;

        let outcome = match result {
            Ok(value) => self.complete(&claimed, value).await,
            Err(err) => self.handle_failure(&claimed, err).await,
        };

        outcome.unwrap_or_else(|err| {
            error!(job_id = %claimed.id, worker_id = %self.worker_id, error = %err, "failed to record job outcome");
            ExecutionOutcome::StoreError(err.to_string())
        })
    }

    /// Run the processor while refreshing the heartbeat.
    async fn run(&self, job: &Job, ctx: &JobContext) -> Result<JsonValue, ProcessorError> {
        let Some(processor) = self.registry.processor_for(&job.job_type) else {
            return Err(ProcessorError::not_registered(&job.job_type));
        };

        // A panicking processor is a failed attempt like any other.
        let work = AssertUnwindSafe(processor.process(job, ctx)).catch_unwind();
        tokio::pin!(work);

        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Claim already stamped the heartbeat.
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut work => {
                    return result.unwrap_or_else(|payload| {
                        error!(job_id = %job.id, job_type = %job.job_type, worker_id = %self.worker_id, "processor panicked");
                        Err(ProcessorError::panicked(payload))
                    });
                }
                _ = ticker.tick() => self.beat(job).await,
            }
        }
    }

    async fn beat(&self, job: &Job) {
        match self.store.heartbeat(job.id, &self.worker_id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => debug!(job_id = %job.id, "heartbeat skipped, job no longer held"),
            Err(err) => warn!(job_id = %job.id, error = %err, "heartbeat failed"),
        }
    }

    async fn complete(&self, job: &Job, value: JsonValue) -> Result<ExecutionOutcome, JobStoreError> {
        let Some(done) = self
            .store
            .complete(job.id, &self.worker_id, value, Utc::now())
            .await?
        else {
            return Ok(ExecutionOutcome::Superseded);
        };

        self.notifier.job_changed(&done);
        self.log(
            job,
            LogLevel::Info,
            "job completed",
            json!({ "attempt": done.attempts, "duration_ms": done.duration_ms() }),
        )
        .await;
        info!(job_id = %job.id, job_type = %job.job_type, attempt = done.attempts, "job completed");

        Ok(ExecutionOutcome::Completed)
    }

    async fn handle_failure(
        &self,
        job: &Job,
        err: ProcessorError,
    ) -> Result<ExecutionOutcome, JobStoreError> {
        let failure = FailureRecord::new(err.message, err.stack);
        let now = Utc::now();

        match self.policy.decide(job.attempts, job.max_attempts) {
            RetryDecision::Retry { delay } => {
                let Some(pending) = self
                    .store
                    .reschedule(job.id, &self.worker_id, &failure, delay, now)
                    .await?
                else {
                    return Ok(ExecutionOutcome::Superseded);
                };

                self.notifier.job_changed(&pending);
                self.log(
                    job,
                    LogLevel::Warning,
                    format!(
                        "attempt {} of {} failed, retrying in {}s: {}",
                        job.attempts,
                        job.max_attempts,
                        delay.as_secs(),
                        failure.message
                    ),
                    json!({ "attempt": job.attempts, "delay_secs": delay.as_secs() }),
                )
                .await;
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    delay_secs = delay.as_secs(),
                    error = %failure.message,
                    "job attempt failed, rescheduled"
                );

                Ok(ExecutionOutcome::Rescheduled { delay })
            }
            RetryDecision::GiveUp => {
                let Some(failed) = self
                    .store
                    .fail(job.id, &self.worker_id, &failure, now)
                    .await?
                else {
                    return Ok(ExecutionOutcome::Superseded);
                };

                self.notifier.job_changed(&failed);
                self.log(
                    job,
                    LogLevel::Error,
                    format!("job failed after {} attempts: {}", job.attempts, failure.message),
                    json!({ "attempt": job.attempts, "error_stack": failure.stack }),
                )
                .await;
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    error = %failure.message,
                    "job failed"
                );

                Ok(ExecutionOutcome::Failed)
            }
        }
    }

    /// Job log lines are best effort once the row itself has been written.
    async fn log(&self, job: &Job, level: LogLevel, message: impl Into<String>, metadata: JsonValue) {
        if let Err(err) = self.sidecar.append_log(job.id, level, message, metadata).await {
            warn!(job_id = %job.id, error = %err, "failed to append job log");
        }
    }
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("worker_id", &self.worker_id)
            .field("policy", &self.policy)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::registry::Processor;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobStatus, NewJob};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tidecrm_core::WorkspaceId;

    /// Fails the first `failures` calls, then returns `{"ok": true}`.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Processor for Flaky {
        fn job_types(&self) -> Vec<String> {
            vec!["csv_import".into()]
        }

        async fn process(&self, _job: &Job, _ctx: &JobContext) -> Result<JsonValue, ProcessorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ProcessorError::new(format!("boom {call}")).with_stack("frame 0"))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    /// Holds the job past several heartbeat intervals.
    struct Slow;

    #[async_trait]
    impl Processor for Slow {
        fn job_types(&self) -> Vec<String> {
            vec!["csv_import".into()]
        }

        async fn process(&self, _job: &Job, _ctx: &JobContext) -> Result<JsonValue, ProcessorError> {
            tokio::time::sleep(Duration::from_millis(120)).await;
            Ok(JsonValue::Null)
        }
    }

    struct Panics;

    #[async_trait]
    impl Processor for Panics {
        fn job_types(&self) -> Vec<String> {
            vec!["csv_import".into()]
        }

        async fn process(&self, _job: &Job, _ctx: &JobContext) -> Result<JsonValue, ProcessorError> {
            panic!("row 12 has no email column");
        }
    }

    fn executor(store: &Arc<InMemoryJobStore>, processor: Arc<dyn Processor>) -> JobExecutor {
        let registry = ProcessorRegistry::new().with(processor).unwrap();
        JobExecutor::new(store.clone(), Arc::new(registry), ChangeNotifier::in_memory(), "w1")
    }

    async fn pending(store: &Arc<InMemoryJobStore>, max_attempts: u32) -> Job {
        let job = NewJob::new(WorkspaceId::new(), "csv_import", json!({}))
            .max_attempts(max_attempts)
            .into_job(Utc::now());
        store.insert(job).await.unwrap()
    }

    #[tokio::test]
    async fn panicking_processor_is_a_failed_attempt() {
        let store = Arc::new(InMemoryJobStore::new());
        let exec = executor(&store, Arc::new(Panics));
        let job = pending(&store, 2).await;

        assert_eq!(
            exec.execute(&job).await,
            ExecutionOutcome::Rescheduled {
                delay: Duration::from_secs(60)
            }
        );
        let row = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert!(row.next_retry_at.is_some());
        assert_eq!(
            row.error_message.as_deref(),
            Some("processor panicked: row 12 has no email column")
        );

        assert_eq!(exec.execute(&row).await, ExecutionOutcome::Failed);
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn zero_heartbeat_interval_keeps_the_default() {
        let store = Arc::new(InMemoryJobStore::new());
        let exec = executor(&store, Flaky::new(0)).with_heartbeat_interval(Duration::ZERO);
        let job = pending(&store, 1).await;

        assert_eq!(exec.execute(&job).await, ExecutionOutcome::Completed);
    }

    #[tokio::test]
    async fn success_completes_and_logs() {
        let store = Arc::new(InMemoryJobStore::new());
        let exec = executor(&store, Flaky::new(0));
        let job = pending(&store, 5).await;

        assert_eq!(exec.execute(&job).await, ExecutionOutcome::Completed);

        let row = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.result, Some(json!({"ok": true})));
        assert_eq!(row.progress_percentage(), Some(100));
        assert_eq!(row.attempts, 1);

        let logs = store.logs(job.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].log_level, LogLevel::Info);
    }

    #[tokio::test]
    async fn failure_with_attempts_left_is_rescheduled_with_backoff() {
        let store = Arc::new(InMemoryJobStore::new());
        let exec = executor(&store, Flaky::new(1));
        let job = pending(&store, 5).await;

        let before = Utc::now();
        assert_eq!(
            exec.execute(&job).await,
            ExecutionOutcome::Rescheduled {
                delay: Duration::from_secs(60)
            }
        );

        let row = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert_eq!(row.retry_delay_seconds, Some(60));
        assert!(row.next_retry_at.unwrap() >= before + chrono::Duration::seconds(60));
        assert_eq!(row.error_message.as_deref(), Some("boom 0"));
        assert_eq!(row.error_stack.as_deref(), Some("frame 0"));
        assert!(row.worker_id.is_none());
        assert_eq!(store.logs(job.id).await.unwrap()[0].log_level, LogLevel::Warning);
    }

    #[tokio::test]
    async fn last_attempt_failure_fails_the_job() {
        let store = Arc::new(InMemoryJobStore::new());
        let exec = executor(&store, Flaky::new(10));
        let job = pending(&store, 1).await;

        assert_eq!(exec.execute(&job).await, ExecutionOutcome::Failed);

        let row = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert!(row.failed_at.is_some());
        assert!(row.next_retry_at.is_none());
        assert_eq!(store.logs(job.id).await.unwrap()[0].log_level, LogLevel::Error);
    }

    #[tokio::test]
    async fn missing_processor_counts_as_an_attempt() {
        let store = Arc::new(InMemoryJobStore::new());
        let exec = executor(&store, Flaky::new(0));
        let job = NewJob::new(WorkspaceId::new(), "lead_scoring", json!({})).into_job(Utc::now());
        let job = store.insert(job).await.unwrap();

        assert!(matches!(exec.execute(&job).await, ExecutionOutcome::Rescheduled { .. }));

        let row = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.attempts, 1);
        assert!(row.error_message.unwrap().contains("processor not registered"));
    }

    #[tokio::test]
    async fn claim_lost_is_silent() {
        let store = Arc::new(InMemoryJobStore::new());
        let exec = executor(&store, Flaky::new(0));
        let job = pending(&store, 5).await;
        store.claim(job.id, "w2", Utc::now()).await.unwrap();

        assert_eq!(exec.execute(&job).await, ExecutionOutcome::ClaimLost);
        assert!(store.logs(job.id).await.unwrap().is_empty());
        assert_eq!(store.get(job.id).await.unwrap().unwrap().worker_id.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn cancelled_mid_run_is_not_reverted() {
        struct CancelsItself(Arc<InMemoryJobStore>);

        #[async_trait]
        impl Processor for CancelsItself {
            fn job_types(&self) -> Vec<String> {
                vec!["csv_import".into()]
            }

            async fn process(&self, job: &Job, _ctx: &JobContext) -> Result<JsonValue, ProcessorError> {
                self.0
                    .transition(job.id, crate::jobs::types::JobAction::Cancel, Utc::now())
                    .await?;
                Ok(json!({"ok": true}))
            }
        }

        let store = Arc::new(InMemoryJobStore::new());
        let notifier = ChangeNotifier::in_memory();
        let sub = notifier.subscribe();
        let registry = ProcessorRegistry::new()
            .with(Arc::new(CancelsItself(store.clone())))
            .unwrap();
        let exec = JobExecutor::new(store.clone(), Arc::new(registry), notifier, "w1");
        let job = pending(&store, 5).await;

        assert_eq!(exec.execute(&job).await, ExecutionOutcome::Superseded);

        let row = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Cancelled);
        assert!(row.result.is_none());
        assert!(store.logs(job.id).await.unwrap().is_empty());
        // Only the claim was published by the executor.
        assert_eq!(sub.drain().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_is_refreshed_while_running() {
        let store = Arc::new(InMemoryJobStore::new());
        let exec = executor(&store, Arc::new(Slow)).with_heartbeat_interval(Duration::from_millis(20));
        let job = pending(&store, 5).await;

        let handle = {
            let exec = exec.clone();
            let job = job.clone();
            tokio::spawn(async move { exec.execute(&job).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let first = store.get(job.id).await.unwrap().unwrap().worker_heartbeat_at;
        tokio::time::sleep(Duration::from_millis(60)).await;
        let later = store.get(job.id).await.unwrap().unwrap().worker_heartbeat_at;
        assert!(later > first);

        assert_eq!(handle.await.unwrap(), ExecutionOutcome::Completed);
    }
}
