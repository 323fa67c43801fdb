//! Account and contact enrichment.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use tidecrm_core::WorkspaceId;

use crate::jobs::{Job, JobContext, Processor, ProcessorError};

pub const ENRICH_ACCOUNT: &str = "enrich_account";
pub const ENRICH_CONTACT: &str = "enrich_contact";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Account,
    Contact,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Account => "account",
            EntityKind::Contact => "contact",
        }
    }

    fn for_job_type(job_type: &str) -> Option<Self> {
        match job_type {
            ENRICH_ACCOUNT => Some(EntityKind::Account),
            ENRICH_CONTACT => Some(EntityKind::Contact),
            _ => None,
        }
    }
}

/// What the provider is asked to look up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentRequest {
    pub workspace_id: WorkspaceId,
    pub entity_type: EntityKind,
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Source of enrichment data (firmographics, social profiles, ...).
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Enriched fields for one record, as a JSON object.
    async fn enrich(&self, request: &EnrichmentRequest) -> anyhow::Result<JsonValue>;
}

#[derive(Debug, Deserialize)]
struct EnrichmentPayload {
    id: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// Handles `enrich_account` and `enrich_contact`.
#[derive(Clone)]
pub struct EnrichmentProcessor {
    provider: Arc<dyn EnrichmentProvider>,
}

impl EnrichmentProcessor {
    pub fn new(provider: Arc<dyn EnrichmentProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Processor for EnrichmentProcessor {
    fn job_types(&self) -> Vec<String> {
        vec![ENRICH_ACCOUNT.to_string(), ENRICH_CONTACT.to_string()]
    }

    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<JsonValue, ProcessorError> {
        let kind = EntityKind::for_job_type(&job.job_type)
            .ok_or_else(|| ProcessorError::not_registered(&job.job_type))?;
        let payload: EnrichmentPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| ProcessorError::invalid_payload(&job.job_type, e))?;
        if payload.id.trim().is_empty() {
            return Err(ProcessorError::invalid_payload(&job.job_type, "id must not be empty"));
        }

        ctx.report_progress(10, format!("enriching {} {}", kind.as_str(), payload.id))
            .await?;

        let request = EnrichmentRequest {
            workspace_id: job.workspace_id,
            entity_type: kind,
            entity_id: payload.id,
            domain: payload.domain,
            email: payload.email,
        };
        let fields = self.provider.enrich(&request).await?;

        let enriched = fields.as_object().map_or(0, |f| f.len());
        ctx.info(format!("enriched {enriched} fields")).await?;

        Ok(json!({
            "entity_id": request.entity_id,
            "entity_type": kind.as_str(),
            "fields": fields,
        }))
    }
}

impl std::fmt::Debug for EnrichmentProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentProcessor").finish_non_exhaustive()
    }
}
