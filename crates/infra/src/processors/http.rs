//! HTTP clients for the enrichment and duplicate-scan services.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use super::duplicate_detection::{DuplicateGroup, DuplicateScanRequest, DuplicateScanner};
use super::enrichment::{EnrichmentProvider, EnrichmentRequest};

/// Timeout for a single request; the job's retry policy handles the rest.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// POSTs JSON to one endpoint, optionally with a bearer token.
#[derive(Debug, Clone)]
struct JsonEndpoint {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl JsonEndpoint {
    fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
            token: None,
        })
    }

    async fn post<B, R>(&self, body: &B) -> anyhow::Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(&self.url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("POST {} returned HTTP {}: {}", self.url, status.as_u16(), detail.trim());
        }

        response
            .json::<R>()
            .await
            .with_context(|| format!("POST {} returned an unreadable body", self.url))
    }
}

#[derive(Debug, serde::Deserialize)]
struct EnrichmentResponse {
    fields: JsonValue,
}

/// `EnrichmentProvider` backed by an HTTP enrichment API.
///
/// Expects `{"fields": {...}}` in response to the serialized `EnrichmentRequest`.
#[derive(Debug, Clone)]
pub struct HttpEnrichmentProvider {
    endpoint: JsonEndpoint,
}

impl HttpEnrichmentProvider {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            endpoint: JsonEndpoint::new(url)?,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.endpoint.token = Some(token.into());
        self
    }
}

#[async_trait]
impl EnrichmentProvider for HttpEnrichmentProvider {
    async fn enrich(&self, request: &EnrichmentRequest) -> anyhow::Result<JsonValue> {
        let response: EnrichmentResponse = self.endpoint.post(request).await?;
        Ok(response.fields)
    }
}

#[derive(Debug, serde::Deserialize)]
struct ScanResponse {
    groups: Vec<DuplicateGroup>,
}

/// `DuplicateScanner` backed by an HTTP matching service.
///
/// Expects `{"groups": [{"entity_ids": [...], "score": 0.93}, ...]}`.
#[derive(Debug, Clone)]
pub struct HttpDuplicateScanner {
    endpoint: JsonEndpoint,
}

impl HttpDuplicateScanner {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            endpoint: JsonEndpoint::new(url)?,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.endpoint.token = Some(token.into());
        self
    }
}

#[async_trait]
impl DuplicateScanner for HttpDuplicateScanner {
    async fn scan(&self, request: &DuplicateScanRequest) -> anyhow::Result<Vec<DuplicateGroup>> {
        let response: ScanResponse = self.endpoint.post(request).await?;
        Ok(response.groups)
    }
}
