//! Read-only discovery of jobs a worker may run right now.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::store::{EligibleQuery, JobStore, JobStoreError};
use super::types::Job;

/// Finds pending jobs in one queue, restricted to the worker's registered types.
///
/// Polling never claims: a slow claim on one job must not hold up the rest of the batch.
#[derive(Clone)]
pub struct Poller {
    store: Arc<dyn JobStore>,
    queue: String,
    job_types: Vec<String>,
}

impl Poller {
    pub fn new(store: Arc<dyn JobStore>, queue: impl Into<String>, job_types: Vec<String>) -> Self {
        Self {
            store,
            queue: queue.into(),
            job_types,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Up to `available_slots` eligible jobs at `now`, in queue order.
    ///
    /// Zero slots or no registered types is a no-op that does not touch the store.
    pub async fn poll(
        &self,
        available_slots: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        if available_slots == 0 || self.job_types.is_empty() {
            return Ok(Vec::new());
        }

        self.store
            .fetch_eligible(&EligibleQuery {
                queue: &self.queue,
                job_types: &self.job_types,
                now,
                limit: available_slots,
            })
            .await
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("queue", &self.queue)
            .field("job_types", &self.job_types)
            .finish()
    }
}
