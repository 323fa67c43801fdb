//! Duplicate record scans.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use tidecrm_core::WorkspaceId;

use crate::jobs::{Job, JobContext, Processor, ProcessorError};

pub const DUPLICATE_SCAN: &str = "duplicate_scan";

/// Similarity used when the payload does not set one.
pub const DEFAULT_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateScanRequest {
    pub workspace_id: WorkspaceId,
    pub entity_type: String,
    /// Minimum similarity, in (0, 1]
    pub threshold: f64,
}

/// Records the scanner considers the same entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub entity_ids: Vec<String>,
    pub score: f64,
}

#[async_trait]
pub trait DuplicateScanner: Send + Sync {
    async fn scan(&self, request: &DuplicateScanRequest) -> anyhow::Result<Vec<DuplicateGroup>>;
}

#[derive(Debug, Deserialize)]
struct ScanPayload {
    entity_type: String,
    #[serde(default)]
    threshold: Option<f64>,
}

/// Handles `duplicate_scan`.
#[derive(Clone)]
pub struct DuplicateDetectionProcessor {
    scanner: Arc<dyn DuplicateScanner>,
}

impl DuplicateDetectionProcessor {
    pub fn new(scanner: Arc<dyn DuplicateScanner>) -> Self {
        Self { scanner }
    }
}

#[async_trait]
impl Processor for DuplicateDetectionProcessor {
    fn job_types(&self) -> Vec<String> {
        vec![DUPLICATE_SCAN.to_string()]
    }

    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<JsonValue, ProcessorError> {
        let payload: ScanPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| ProcessorError::invalid_payload(&job.job_type, e))?;

        if payload.entity_type.trim().is_empty() {
            return Err(ProcessorError::invalid_payload(&job.job_type, "entity_type must not be empty"));
        }
        let threshold = payload.threshold.unwrap_or(DEFAULT_THRESHOLD);
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ProcessorError::invalid_payload(
                &job.job_type,
                format!("threshold must be in (0, 1], got {threshold}"),
            ));
        }

        ctx.report_progress(10, format!("scanning {} for duplicates", payload.entity_type))
            .await?;

        let request = DuplicateScanRequest {
            workspace_id: job.workspace_id,
            entity_type: payload.entity_type,
            threshold,
        };
        let groups = self.scanner.scan(&request).await?;

        ctx.report_progress(90, format!("found {} duplicate groups", groups.len()))
            .await?;
        ctx.info(format!("found {} duplicate groups", groups.len())).await?;

        Ok(json!({
            "entity_type": request.entity_type,
            "threshold": threshold,
            "groups_found": groups.len(),
            "groups": groups,
        }))
    }
}

impl std::fmt::Debug for DuplicateDetectionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplicateDetectionProcessor").finish_non_exhaustive()
    }
}
