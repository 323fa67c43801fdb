//! Integration tests for the job pipeline.
//!
//! Tests: JobService -> JobStore -> Poller -> JobExecutor -> Processor -> JobChanged
//!
//! Verifies:
//! - Jobs run to completion, retry with backoff, and fail at the attempt ceiling
//! - Racing workers never both run a job
//! - Scheduled and cancelled jobs are not offered to workers
//! - Stale jobs are recovered and the worker survives store outages

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta, Utc};
    use serde_json::{Value as JsonValue, json};

    use tidecrm_core::{JobId, WorkspaceId};

    use crate::jobs::{
        ChangeNotifier, CountQuery, EligibleQuery, ExecutionOutcome, FailureRecord, Job, JobAction, JobChanged,
        JobContext, JobExecutor, JobFilter, JobLog, JobPage, JobService, JobServiceError, JobStatus, JobStore,
        JobStoreError, InMemoryJobStore, LogLevel, NewJob, Pagination, Poller, Processor, ProcessorError,
        ProcessorRegistry, StaleJobReaper, Worker, WorkerConfig,
    };

    const JOB_TYPE: &str = "enrich_account";

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Processor for Flaky {
        fn job_types(&self) -> Vec<String> {
            vec![JOB_TYPE.into()]
        }

        async fn process(&self, _job: &Job, ctx: &JobContext) -> Result<JsonValue, ProcessorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.report_progress(50, "halfway").await?;
            if call <= self.failures {
                return Err(ProcessorError::new(format!("provider unavailable (call {call})")));
            }
            Ok(json!({"fields": {"industry": "software"}}))
        }
    }

    struct Harness {
        store: Arc<InMemoryJobStore>,
        notifier: ChangeNotifier,
        service: JobService,
        registry: Arc<ProcessorRegistry>,
    }

    impl Harness {
        fn new(processor: Arc<dyn Processor>) -> Self {
            let store = Arc::new(InMemoryJobStore::new());
            let notifier = ChangeNotifier::in_memory();
            let service = JobService::new(store.clone(), notifier.clone());
            let registry = Arc::new(ProcessorRegistry::new().with(processor).unwrap());
            Self {
                store,
                notifier,
                service,
                registry,
            }
        }

        fn executor(&self, worker_id: &str) -> JobExecutor {
            JobExecutor::new(self.store.clone(), self.registry.clone(), self.notifier.clone(), worker_id)
        }

        fn poller(&self) -> Poller {
            Poller::new(self.store.clone(), "default", self.registry.job_types())
        }

        async fn poll_at(&self, now: DateTime<Utc>) -> Vec<Job> {
            self.poller().poll(10, now).await.unwrap()
        }

        async fn job(&self, job_id: JobId) -> Job {
            self.service.get_job(job_id).await.unwrap()
        }
    }

    fn later(seconds: i64) -> DateTime<Utc> {
        Utc::now() + TimeDelta::seconds(seconds)
    }

    #[tokio::test]
    async fn job_runs_to_completion_and_publishes_each_transition() {
        let h = Harness::new(Flaky::new(0));
        let changes = h.notifier.subscribe();

        let job = h
            .service
            .create_job(NewJob::new(WorkspaceId::new(), JOB_TYPE, json!({"id": "acc_1"})))
            .await
            .unwrap();

        let offered = h.poll_at(Utc::now()).await;
        assert_eq!(offered.len(), 1);
        assert_eq!(h.executor("w1").execute(&offered[0]).await, ExecutionOutcome::Completed);

        let done = h.service.get_job_with_logs(job.id).await.unwrap();
        assert_eq!(done.job.status, JobStatus::Completed);
        assert_eq!(done.job.attempts, 1);
        assert_eq!(done.job.result, Some(json!({"fields": {"industry": "software"}})));
        assert!(done.job.duration_ms().is_some());
        let messages: Vec<_> = done.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["job created", "job completed"]);

        let statuses: Vec<_> = changes.drain().into_iter().map(|c| c.new_status).collect();
        assert_eq!(
            statuses,
            vec![
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Processing,
                JobStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn failed_attempts_back_off_then_succeed() {
        let processor = Flaky::new(2);
        let h = Harness::new(processor.clone());
        let job = h
            .service
            .create_job(NewJob::new(WorkspaceId::new(), JOB_TYPE, json!({"id": "acc_2"})))
            .await
            .unwrap();
        let executor = h.executor("w1");

        let first = h.poll_at(Utc::now()).await;
        assert_eq!(
            executor.execute(&first[0]).await,
            ExecutionOutcome::Rescheduled {
                delay: Duration::from_secs(60)
            }
        );
        let waiting = h.job(job.id).await;
        assert_eq!(waiting.status, JobStatus::Pending);
        assert_eq!(waiting.retry_delay_seconds, Some(60));
        assert_eq!(waiting.error_message.as_deref(), Some("provider unavailable (call 1)"));

        assert!(h.poll_at(Utc::now()).await.is_empty());
        let second = h.poll_at(later(61)).await;
        assert_eq!(
            executor.execute(&second[0]).await,
            ExecutionOutcome::Rescheduled {
                delay: Duration::from_secs(120)
            }
        );

        assert!(h.poll_at(later(100)).await.is_empty());
        let third = h.poll_at(later(121)).await;
        assert_eq!(executor.execute(&third[0]).await, ExecutionOutcome::Completed);

        let done = h.service.get_job_with_logs(job.id).await.unwrap();
        assert_eq!(done.job.status, JobStatus::Completed);
        assert_eq!(done.job.attempts, 3);
        assert_eq!(processor.calls(), 3);
        let warnings = done.logs.iter().filter(|l| l.log_level == LogLevel::Warning).count();
        assert_eq!(warnings, 2);
    }

    #[tokio::test]
    async fn always_failing_job_stops_at_max_attempts() {
        let h = Harness::new(Flaky::new(usize::MAX));
        let job = h
            .service
            .create_job(NewJob::new(WorkspaceId::new(), JOB_TYPE, json!({})).max_attempts(3))
            .await
            .unwrap();
        let executor = h.executor("w1");

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let offered = h.poll_at(later(7200)).await;
            outcomes.push(executor.execute(&offered[0]).await);
        }
        assert!(matches!(outcomes[0], ExecutionOutcome::Rescheduled { .. }));
        assert!(matches!(outcomes[1], ExecutionOutcome::Rescheduled { .. }));
        assert_eq!(outcomes[2], ExecutionOutcome::Failed);

        let failed = h.job(job.id).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 3);
        assert!(failed.failed_at.is_some());
        assert_eq!(failed.error_message.as_deref(), Some("provider unavailable (call 3)"));
        assert!(h.poll_at(later(7200)).await.is_empty());

        // A manual retry starts the attempt budget over.
        let retried = h.service.retry_job(job.id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempts, 0);
        assert!(retried.error_message.is_none());
        assert_eq!(h.poll_at(Utc::now()).await.len(), 1);
    }

    #[tokio::test]
    async fn racing_workers_run_a_job_once() {
        let processor = Flaky::new(0);
        let h = Harness::new(processor.clone());
        let job = h
            .service
            .create_job(NewJob::new(WorkspaceId::new(), JOB_TYPE, json!({})))
            .await
            .unwrap();

        // Both workers saw the same poll result.
        let offered = h.poll_at(Utc::now()).await;
        let (a, b) = (h.executor("w1"), h.executor("w2"));
        let (left, right) = tokio::join!(a.execute(&offered[0]), b.execute(&offered[0]));

        let mut outcomes = vec![left, right];
        outcomes.sort_by_key(|o| format!("{o:?}"));
        assert_eq!(outcomes, vec![ExecutionOutcome::ClaimLost, ExecutionOutcome::Completed]);
        assert_eq!(processor.calls(), 1);
        assert_eq!(h.job(job.id).await.attempts, 1);
    }

    #[tokio::test]
    async fn scheduled_job_waits_for_its_time() {
        let h = Harness::new(Flaky::new(0));
        let job = h
            .service
            .create_job(NewJob::new(WorkspaceId::new(), JOB_TYPE, json!({})).scheduled_for(later(600)))
            .await
            .unwrap();

        assert!(h.poll_at(Utc::now()).await.is_empty());
        assert!(h.poll_at(later(590)).await.is_empty());

        let offered = h.poll_at(later(601)).await;
        assert_eq!(offered[0].id, job.id);
    }

    #[tokio::test]
    async fn cancelled_job_is_never_offered_or_claimed() {
        let processor = Flaky::new(0);
        let h = Harness::new(processor.clone());
        let job = h
            .service
            .create_job(NewJob::new(WorkspaceId::new(), JOB_TYPE, json!({})))
            .await
            .unwrap();
        let stale_view = h.poll_at(Utc::now()).await;

        let cancelled = h.service.cancel_job(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        assert!(h.poll_at(later(86_400)).await.is_empty());
        assert_eq!(h.executor("w1").execute(&stale_view[0]).await, ExecutionOutcome::ClaimLost);
        assert_eq!(processor.calls(), 0);

        let err = h.service.cancel_job(job.id).await.unwrap_err();
        assert!(matches!(
            err,
            JobServiceError::TerminalTransitionRejected {
                status: JobStatus::Cancelled,
                action: JobAction::Cancel,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn completion_is_recorded_once() {
        let h = Harness::new(Flaky::new(0));
        let job = h
            .service
            .create_job(NewJob::new(WorkspaceId::new(), JOB_TYPE, json!({})))
            .await
            .unwrap();
        let offered = h.poll_at(Utc::now()).await;
        h.executor("w1").execute(&offered[0]).await;
        let first = h.job(job.id).await;

        let again = h
            .store
            .complete(job.id, "w1", json!({"overwritten": true}), later(5))
            .await
            .unwrap();
        assert!(again.is_none());

        let after = h.job(job.id).await;
        assert_eq!(after.completed_at, first.completed_at);
        assert_eq!(after.result, first.result);
    }

    #[tokio::test]
    async fn stale_job_is_recovered_by_another_worker() {
        let h = Harness::new(Flaky::new(0));
        let job = h
            .service
            .create_job(NewJob::new(WorkspaceId::new(), JOB_TYPE, json!({})))
            .await
            .unwrap();

        // Worker w1 claims and then disappears.
        h.store.claim(job.id, "w1", Utc::now()).await.unwrap().unwrap();

        let reaper = StaleJobReaper::new(h.store.clone(), h.notifier.clone(), Duration::from_secs(300));
        assert!(reaper.reap(later(60)).await.unwrap().is_empty());
        let reaped = reaper.reap(later(301)).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].status, JobStatus::Pending);
        assert_eq!(reaped[0].attempts, 1);

        let offered = h.poll_at(Utc::now()).await;
        assert_eq!(h.executor("w2").execute(&offered[0]).await, ExecutionOutcome::Completed);
        let done = h.job(job.id).await;
        assert_eq!(done.worker_id.as_deref(), Some("w2"));
        assert_eq!(done.attempts, 2);
    }

    #[tokio::test]
    async fn workspace_listener_sees_only_its_workspace() {
        let h = Harness::new(Flaky::new(0));
        let ours = WorkspaceId::new();
        let seen: Arc<Mutex<Vec<JobChanged>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = h
            .service
            .on_workspace_jobs_change(ours, move |change| sink.lock().unwrap().push(change))
            .unwrap();

        let job = h.service.create_job(NewJob::new(ours, JOB_TYPE, json!({}))).await.unwrap();
        h.service
            .create_job(NewJob::new(WorkspaceId::new(), JOB_TYPE, json!({})))
            .await
            .unwrap();
        h.service.cancel_job(job.id).await.unwrap();

        for _ in 0..100 {
            if seen.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        listener.shutdown();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|c| c.workspace_id == ours));
        assert_eq!(seen[1].new_status, JobStatus::Cancelled);
    }

    /// Delegates to an in-memory store but fails the first polls.
    struct UnreliableStore {
        inner: InMemoryJobStore,
        failing_polls: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for UnreliableStore {
        async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
            self.inner.insert(job).await
        }

        async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(job_id).await
        }

        async fn list(
            &self,
            workspace_id: WorkspaceId,
            filter: &JobFilter,
            pagination: Pagination,
        ) -> Result<JobPage, JobStoreError> {
            self.inner.list(workspace_id, filter, pagination).await
        }

        async fn fetch_eligible(&self, query: &EligibleQuery<'_>) -> Result<Vec<Job>, JobStoreError> {
            let failing = self
                .failing_polls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(JobStoreError::Unavailable("connection reset".into()));
            }
            self.inner.fetch_eligible(query).await
        }

        async fn claim(&self, job_id: JobId, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
            self.inner.claim(job_id, worker_id, now).await
        }

        async fn heartbeat(&self, job_id: JobId, worker_id: &str, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
            self.inner.heartbeat(job_id, worker_id, now).await
        }

        async fn update_progress(
            &self,
            job_id: JobId,
            worker_id: &str,
            progress: JsonValue,
            now: DateTime<Utc>,
        ) -> Result<Option<Job>, JobStoreError> {
            self.inner.update_progress(job_id, worker_id, progress, now).await
        }

        async fn complete(
            &self,
            job_id: JobId,
            worker_id: &str,
            result: JsonValue,
            now: DateTime<Utc>,
        ) -> Result<Option<Job>, JobStoreError> {
            self.inner.complete(job_id, worker_id, result, now).await
        }

        async fn reschedule(
            &self,
            job_id: JobId,
            worker_id: &str,
            failure: &FailureRecord,
            delay: Duration,
            now: DateTime<Utc>,
        ) -> Result<Option<Job>, JobStoreError> {
            self.inner.reschedule(job_id, worker_id, failure, delay, now).await
        }

        async fn fail(
            &self,
            job_id: JobId,
            worker_id: &str,
            failure: &FailureRecord,
            now: DateTime<Utc>,
        ) -> Result<Option<Job>, JobStoreError> {
            self.inner.fail(job_id, worker_id, failure, now).await
        }

        async fn transition(
            &self,
            job_id: JobId,
            action: JobAction,
            now: DateTime<Utc>,
        ) -> Result<Option<Job>, JobStoreError> {
            self.inner.transition(job_id, action, now).await
        }

        async fn requeue_stale(
            &self,
            cutoff: DateTime<Utc>,
            failure: &FailureRecord,
            now: DateTime<Utc>,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.requeue_stale(cutoff, failure, now).await
        }

        async fn append_log(&self, log: JobLog) -> Result<(), JobStoreError> {
            self.inner.append_log(log).await
        }

        async fn logs(&self, job_id: JobId) -> Result<Vec<JobLog>, JobStoreError> {
            self.inner.logs(job_id).await
        }

        async fn count(&self, workspace_id: WorkspaceId, query: &CountQuery) -> Result<u64, JobStoreError> {
            self.inner.count(workspace_id, query).await
        }

        async fn average_duration_ms(
            &self,
            workspace_id: WorkspaceId,
            since: DateTime<Utc>,
        ) -> Result<Option<f64>, JobStoreError> {
            self.inner.average_duration_ms(workspace_id, since).await
        }
    }

    #[tokio::test]
    async fn worker_keeps_polling_through_store_outages() {
        let store = Arc::new(UnreliableStore {
            inner: InMemoryJobStore::new(),
            failing_polls: AtomicUsize::new(3),
        });
        let job = store
            .insert(NewJob::new(WorkspaceId::new(), JOB_TYPE, json!({})).into_job(Utc::now()))
            .await
            .unwrap();

        let registry = ProcessorRegistry::new().with(Flaky::new(0)).unwrap();
        let config = WorkerConfig::default()
            .with_worker_id("w-outage")
            .with_poll_interval(Duration::from_millis(5));
        let handle = Worker::new(config, store.clone(), registry, ChangeNotifier::in_memory()).spawn();

        for _ in 0..200 {
            if handle.stats().jobs_completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.stats();
        handle.shutdown().await;

        assert_eq!(stats.poll_errors, 3);
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Completed);
    }

    struct Panicking;

    #[async_trait]
    impl Processor for Panicking {
        fn job_types(&self) -> Vec<String> {
            vec![JOB_TYPE.into()]
        }

        async fn process(&self, _job: &Job, _ctx: &JobContext) -> Result<JsonValue, ProcessorError> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn worker_records_a_panicking_processor_as_a_failed_attempt() {
        let store = Arc::new(InMemoryJobStore::new());
        let ws = WorkspaceId::new();
        let retried = store
            .insert(NewJob::new(ws, JOB_TYPE, json!({})).into_job(Utc::now()))
            .await
            .unwrap();
        let last_try = store
            .insert(NewJob::new(ws, JOB_TYPE, json!({})).max_attempts(1).into_job(Utc::now()))
            .await
            .unwrap();

        let registry = ProcessorRegistry::new().with(Arc::new(Panicking)).unwrap();
        let config = WorkerConfig::default()
            .with_worker_id("w-panic")
            .with_poll_interval(Duration::from_millis(5));
        let handle = Worker::new(config, store.clone(), registry, ChangeNotifier::in_memory()).spawn();

        for _ in 0..100 {
            let stats = handle.stats();
            if stats.jobs_rescheduled == 1 && stats.jobs_failed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.stats();
        handle.shutdown().await;

        assert_eq!(stats.jobs_rescheduled, 1);
        assert_eq!(stats.jobs_failed, 1);

        let pending = store.get(retried.id).await.unwrap().unwrap();
        assert_eq!(pending.status, JobStatus::Pending);
        assert!(pending.next_retry_at.is_some());
        assert_eq!(pending.error_message.as_deref(), Some("processor panicked: boom"));

        let failed = store.get(last_try.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 1);
        let logs = store.logs(last_try.id).await.unwrap();
        assert_eq!(logs.last().unwrap().log_level, LogLevel::Error);
    }

    #[tokio::test]
    async fn stats_reflect_the_last_hour() {
        let h = Harness::new(Flaky::new(usize::MAX));
        let ws = WorkspaceId::new();
        let failing = h
            .service
            .create_job(NewJob::new(ws, JOB_TYPE, json!({})).max_attempts(1))
            .await
            .unwrap();
        h.service.create_job(NewJob::new(ws, JOB_TYPE, json!({}))).await.unwrap();
        h.service
            .create_job(NewJob::new(ws, JOB_TYPE, json!({})).queue("imports"))
            .await
            .unwrap();

        let offered = h.poll_at(Utc::now()).await;
        let first = offered.iter().find(|j| j.id == failing.id).unwrap();
        assert_eq!(h.executor("w1").execute(first).await, ExecutionOutcome::Failed);

        let stats = h.service.get_job_stats(ws).await;
        assert_eq!(stats.queue_depth, 2);
        assert_eq!(stats.failed_last_hour, 1);
        assert_eq!(stats.completed_last_hour, 0);

        let imports = h.service.get_queue_stats(ws, "imports").await;
        assert_eq!(imports.queue_depth, 1);
    }
}
