//! Recovery of jobs whose worker stopped heartbeating.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use super::notifier::ChangeNotifier;
use super::store::{JobStore, JobStoreError};
use super::types::{FailureRecord, Job, JobLog, JobStatus, LogLevel};

pub const HEARTBEAT_LOST: &str = "worker heartbeat lost";

/// Requeues `processing` jobs whose heartbeat is older than `stale_after`.
#[derive(Clone)]
pub struct StaleJobReaper {
    store: Arc<dyn JobStore>,
    notifier: ChangeNotifier,
    stale_after: Duration,
}

impl StaleJobReaper {
    pub fn new(store: Arc<dyn JobStore>, notifier: ChangeNotifier, stale_after: Duration) -> Self {
        Self {
            store,
            notifier,
            stale_after,
        }
    }

    /// One sweep at `now`. Returns the reaped jobs as written.
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let cutoff = chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let failure = FailureRecord::new(HEARTBEAT_LOST, None);

        let reaped = self.store.requeue_stale(cutoff, &failure, now).await?;
        for job in &reaped {
            self.notifier.job_changed(job);

            let (level, message) = match job.status {
                JobStatus::Failed => (LogLevel::Error, format!("{HEARTBEAT_LOST}, no attempts left")),
                _ => (LogLevel::Warning, format!("{HEARTBEAT_LOST}, requeued")),
            };
            let log = JobLog::new(job.id, level, message, json!({ "attempt": job.attempts }));
            if let Err(err) = self.store.append_log(log).await {
                warn!(job_id = %job.id, error = %err, "failed to append job log");
            }
        }

        if !reaped.is_empty() {
            info!(count = reaped.len(), "reaped stale jobs");
        }
        Ok(reaped)
    }
}

impl std::fmt::Debug for StaleJobReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaleJobReaper")
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::NewJob;
    use tidecrm_core::WorkspaceId;

    #[tokio::test]
    async fn live_heartbeats_keep_jobs_safe() {
        let store = Arc::new(InMemoryJobStore::new());
        let notifier = ChangeNotifier::in_memory();
        let sub = notifier.subscribe();
        let reaper = StaleJobReaper::new(store.clone(), notifier, Duration::from_secs(300));

        let t0 = Utc::now();
        let job = NewJob::new(WorkspaceId::new(), "duplicate_scan", json!({})).into_job(t0);
        store.insert(job.clone()).await.unwrap();
        store.claim(job.id, "w1", t0).await.unwrap();

        // Heartbeat at +4min keeps it alive at +6min.
        store.heartbeat(job.id, "w1", t0 + chrono::Duration::minutes(4)).await.unwrap();
        assert!(reaper.reap(t0 + chrono::Duration::minutes(6)).await.unwrap().is_empty());

        let reaped = reaper.reap(t0 + chrono::Duration::minutes(10)).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].status, JobStatus::Pending);
        assert_eq!(reaped[0].attempts, 1);

        assert_eq!(sub.drain().len(), 1);
        let logs = store.logs(job.id).await.unwrap();
        assert_eq!(logs[0].log_level, LogLevel::Warning);
    }

    #[tokio::test]
    async fn exhausted_jobs_are_failed() {
        let store = Arc::new(InMemoryJobStore::new());
        let reaper = StaleJobReaper::new(store.clone(), ChangeNotifier::in_memory(), Duration::from_secs(60));

        let t0 = Utc::now();
        let job = NewJob::new(WorkspaceId::new(), "duplicate_scan", json!({}))
            .max_attempts(1)
            .into_job(t0);
        store.insert(job.clone()).await.unwrap();
        store.claim(job.id, "w1", t0).await.unwrap();

        reaper.reap(t0 + chrono::Duration::minutes(2)).await.unwrap();

        let row = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some(HEARTBEAT_LOST));
    }
}
