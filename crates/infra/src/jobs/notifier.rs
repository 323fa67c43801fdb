//! Job change notifications.
//!
//! One `JobChanged` is published per job row write, after the write returned.
//! Delivery is whatever the bus provides; a failed publish is logged and the
//! transition stands.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use tidecrm_core::{JobId, WorkspaceId};
use tidecrm_events::{EventBus, InMemoryEventBus, Subscription, WorkspaceScoped};

use super::types::{Job, JobStatus};

/// Snapshot of a job right after a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobChanged {
    pub job_id: JobId,
    pub workspace_id: WorkspaceId,
    pub new_status: JobStatus,
    pub changed_at: DateTime<Utc>,
    pub snapshot: Job,
}

impl JobChanged {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            workspace_id: job.workspace_id,
            new_status: job.status,
            changed_at: job.updated_at,
            snapshot: job.clone(),
        }
    }
}

impl WorkspaceScoped for JobChanged {
    fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }
}

/// Object-safe view of an `EventBus<JobChanged>`.
pub trait JobChangeBus: Send + Sync {
    fn publish_change(&self, change: JobChanged);

    fn subscribe_changes(&self) -> Subscription<JobChanged>;
}

impl<B> JobChangeBus for B
where
    B: EventBus<JobChanged>,
{
    fn publish_change(&self, change: JobChanged) {
        let job_id = change.job_id;
        if let Err(err) = self.publish(change) {
            warn!(job_id = %job_id, error = ?err, "failed to publish job change");
        }
    }

    fn subscribe_changes(&self) -> Subscription<JobChanged> {
        self.subscribe()
    }
}

/// Publishes a `JobChanged` for each store write handed to it.
#[derive(Clone)]
pub struct ChangeNotifier {
    bus: Arc<dyn JobChangeBus>,
}

impl ChangeNotifier {
    pub fn new(bus: Arc<dyn JobChangeBus>) -> Self {
        Self { bus }
    }

    /// Notifier backed by a fresh in-process bus.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryEventBus::<JobChanged>::new()))
    }

    pub fn job_changed(&self, job: &Job) {
        self.bus.publish_change(JobChanged::from_job(job));
    }

    pub fn subscribe(&self) -> Subscription<JobChanged> {
        self.bus.subscribe_changes()
    }

    pub fn bus(&self) -> Arc<dyn JobChangeBus> {
        self.bus.clone()
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier").finish_non_exhaustive()
    }
}
