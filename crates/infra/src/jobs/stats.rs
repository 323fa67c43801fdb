//! Point-in-time job statistics for a workspace.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use tidecrm_core::WorkspaceId;

use super::store::{CountQuery, JobStore};
use super::types::JobStatus;

/// Dashboard figures. Counts cover the last hour where noted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub queue_depth: u64,
    pub processing: u64,
    pub completed_last_hour: u64,
    pub failed_last_hour: u64,
    pub average_duration_ms: f64,
    pub throughput_per_minute: f64,
}

#[derive(Clone)]
pub struct StatsAggregator {
    store: Arc<dyn JobStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Compute stats at `now`, optionally restricting queue depth to one queue.
    ///
    /// A figure whose read fails is logged and reported as 0.
    pub async fn compute(
        &self,
        workspace_id: WorkspaceId,
        queue: Option<&str>,
        now: DateTime<Utc>,
    ) -> JobStats {
        let hour_ago = now - chrono::Duration::hours(1);

        let queue_depth = self
            .count(workspace_id, CountQuery::status(JobStatus::Pending).in_queue(queue), "queue_depth")
            .await;
        let processing = self
            .count(workspace_id, CountQuery::status(JobStatus::Processing), "processing")
            .await;
        let completed_last_hour = self
            .count(
                workspace_id,
                CountQuery::status(JobStatus::Completed).since(hour_ago),
                "completed_last_hour",
            )
            .await;
        let failed_last_hour = self
            .count(
                workspace_id,
                CountQuery::status(JobStatus::Failed).since(hour_ago),
                "failed_last_hour",
            )
            .await;

        let average_duration_ms = match self.store.average_duration_ms(workspace_id, hour_ago).await {
            Ok(avg) => avg.unwrap_or(0.0),
            Err(err) => {
                warn!(workspace_id = %workspace_id, figure = "average_duration_ms", error = %err, "job stats read failed");
                0.0
            }
        };

        JobStats {
            queue_depth,
            processing,
            completed_last_hour,
            failed_last_hour,
            average_duration_ms,
            throughput_per_minute: completed_last_hour as f64 / 60.0,
        }
    }

    async fn count(&self, workspace_id: WorkspaceId, query: CountQuery, figure: &'static str) -> u64 {
        match self.store.count(workspace_id, &query).await {
            Ok(n) => n,
            Err(err) => {
                warn!(workspace_id = %workspace_id, figure, error = %err, "job stats read failed");
                0
            }
        }
    }
}
