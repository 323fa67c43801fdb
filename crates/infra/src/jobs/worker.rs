//! Worker runtime: poll loop, bounded job pool and reaper loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::WorkerConfig;
use super::executor::{ExecutionOutcome, JobExecutor};
use super::notifier::ChangeNotifier;
use super::poller::Poller;
use super::reaper::StaleJobReaper;
use super::registry::ProcessorRegistry;
use super::store::JobStore;
use super::types::RetryPolicy;

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_completed: u64,
    pub jobs_rescheduled: u64,
    pub jobs_failed: u64,
    pub claims_lost: u64,
    pub jobs_superseded: u64,
    pub store_errors: u64,
    pub poll_errors: u64,
    pub jobs_reaped: u64,
    pub in_flight: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    rescheduled: AtomicU64,
    failed: AtomicU64,
    claims_lost: AtomicU64,
    superseded: AtomicU64,
    store_errors: AtomicU64,
    poll_errors: AtomicU64,
    reaped: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &ExecutionOutcome) {
        let counter = match outcome {
            ExecutionOutcome::ClaimLost => &self.claims_lost,
            ExecutionOutcome::Completed => &self.completed,
            ExecutionOutcome::Rescheduled { .. } => &self.rescheduled,
            ExecutionOutcome::Failed => &self.failed,
            ExecutionOutcome::Superseded => &self.superseded,
            ExecutionOutcome::StoreError(_) => &self.store_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A job worker bound to one queue.
pub struct Worker {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<ProcessorRegistry>,
    notifier: ChangeNotifier,
    policy: RetryPolicy,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        registry: ProcessorRegistry,
        notifier: ChangeNotifier,
    ) -> Self {
        Self {
            config: config.validated(),
            store,
            registry: Arc::new(registry),
            notifier,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start the poll and reaper loops on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let config = self.config;
        let job_types = self.registry.job_types();
        if job_types.is_empty() {
            warn!(worker_id = %config.worker_id, "worker has no processors; it will never claim a job");
        }

        let poller = Poller::new(self.store.clone(), config.job_queue.clone(), job_types.clone());
        let executor = JobExecutor::new(
            self.store.clone(),
            self.registry,
            self.notifier.clone(),
            config.worker_id.clone(),
        )
        .with_policy(self.policy)
        .with_heartbeat_interval(config.heartbeat_interval);
        let reaper = StaleJobReaper::new(self.store, self.notifier, config.stale_after);

        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        let counters = Arc::new(Counters::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            worker_id = %config.worker_id,
            queue = %config.job_queue,
            max_concurrent = config.max_concurrent,
            job_types = ?job_types,
            "job worker started"
        );

        let poll_task = tokio::spawn(poll_loop(
            poller,
            executor,
            slots.clone(),
            counters.clone(),
            config.clone(),
            shutdown_rx.clone(),
        ));
        let reaper_task = tokio::spawn(reaper_loop(
            reaper,
            counters.clone(),
            config.clone(),
            shutdown_rx,
        ));

        WorkerHandle {
            config,
            shutdown_tx,
            poll_task,
            reaper_task,
            slots,
            counters,
            started: Instant::now(),
        }
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    config: WorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    poll_task: JoinHandle<()>,
    reaper_task: JoinHandle<()>,
    slots: Arc<Semaphore>,
    counters: Arc<Counters>,
    started: Instant,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn stats(&self) -> WorkerStats {
        snapshot(&self.config, &self.slots, &self.counters, self.started)
    }

    /// Stop polling and reaping, then wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let WorkerHandle {
            config,
            shutdown_tx,
            poll_task,
            reaper_task,
            slots,
            counters,
            started,
        } = self;

        let _ = shutdown_tx.send(true);
        if let Err(err) = poll_task.await {
            warn!(worker_id = %config.worker_id, error = %err, "poll loop ended abnormally");
        }
        if let Err(err) = reaper_task.await {
            warn!(worker_id = %config.worker_id, error = %err, "reaper loop ended abnormally");
        }

        let all = u32::try_from(config.max_concurrent).unwrap_or(u32::MAX);
        match slots.acquire_many(all).await {
            Ok(drained) => drop(drained),
            Err(err) => warn!(worker_id = %config.worker_id, error = %err, "job pool closed early"),
        }
        slots.close();
        let stats = snapshot(&config, &slots, &counters, started);

        info!(worker_id = %config.worker_id, stats = ?stats, "job worker stopped");
    }
}

fn snapshot(config: &WorkerConfig, slots: &Semaphore, counters: &Counters, started: Instant) -> WorkerStats {
    let c = counters;
    WorkerStats {
        jobs_completed: c.completed.load(Ordering::Relaxed),
        jobs_rescheduled: c.rescheduled.load(Ordering::Relaxed),
        jobs_failed: c.failed.load(Ordering::Relaxed),
        claims_lost: c.claims_lost.load(Ordering::Relaxed),
        jobs_superseded: c.superseded.load(Ordering::Relaxed),
        store_errors: c.store_errors.load(Ordering::Relaxed),
        poll_errors: c.poll_errors.load(Ordering::Relaxed),
        jobs_reaped: c.reaped.load(Ordering::Relaxed),
        in_flight: config.max_concurrent.saturating_sub(slots.available_permits()),
        uptime_secs: started.elapsed().as_secs(),
    }
}

async fn poll_loop(
    poller: Poller,
    executor: JobExecutor,
    slots: Arc<Semaphore>,
    counters: Arc<Counters>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let available = slots.available_permits();
        let jobs = match poller.poll(available, Utc::now()).await {
            Ok(jobs) => jobs,
            Err(err) => {
                counters.poll_errors.fetch_add(1, Ordering::Relaxed);
                warn!(worker_id = %config.worker_id, queue = %config.job_queue, error = %err, "poll failed; retrying next tick");
                continue;
            }
        };
        if !jobs.is_empty() {
            debug!(worker_id = %config.worker_id, found = jobs.len(), available, "poll found jobs");
        }

        for job in jobs {
            let Ok(permit) = slots.clone().try_acquire_owned() else {
                break;
            };
            let executor = executor.clone();
            let counters = counters.clone();
            tokio::spawn(async move {
                let outcome = executor.execute(&job).await;
                counters.record(&outcome);
                drop(permit);
            });
        }
    }

    debug!(worker_id = %config.worker_id, "poll loop stopped");
}

async fn reaper_loop(
    reaper: StaleJobReaper,
    counters: Arc<Counters>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.reaper_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        match reaper.reap(Utc::now()).await {
            Ok(reaped) => {
                counters.reaped.fetch_add(reaped.len() as u64, Ordering::Relaxed);
            }
            Err(err) => warn!(worker_id = %config.worker_id, error = %err, "stale job sweep failed"),
        }
    }
}
