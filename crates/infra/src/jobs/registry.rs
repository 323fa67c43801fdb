//! Processor contract and the registry that routes job types to processors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::sidecar::JobContext;
use super::types::Job;

/// Failure reported by a processor. Stored verbatim on the job row.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProcessorError {
    pub message: String,
    pub stack: Option<String>,
}

impl ProcessorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// The processor panicked; keeps the panic message when it is a string.
    pub fn panicked(payload: Box<dyn std::any::Any + Send>) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned());
        match detail {
            Some(detail) => Self::new(format!("processor panicked: {detail}")),
            None => Self::new("processor panicked"),
        }
    }

    /// No processor is registered for the job's type.
    pub fn not_registered(job_type: &str) -> Self {
        Self::new(format!("processor not registered for job type '{job_type}'"))
    }

    /// The payload does not have the shape the processor expects.
    pub fn invalid_payload(job_type: &str, err: impl std::fmt::Display) -> Self {
        Self::new(format!("invalid payload for '{job_type}': {err}"))
    }
}

impl From<anyhow::Error> for ProcessorError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            stack: Some(format!("{err:?}")),
        }
    }
}

/// Pluggable handler for one or more job types.
#[async_trait]
pub trait Processor: Send + Sync {
    fn job_types(&self) -> Vec<String>;

    /// Run the job. `ctx` reports progress and log lines for this job.
    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<JsonValue, ProcessorError>;
}

/// Registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("job type '{0}' already has a processor")]
    DuplicateJobType(String),
    #[error("processor declares no job types")]
    NoJobTypes,
}

/// Job type -> processor. Built once at worker start.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for every type it declares.
    ///
    /// Fails without registering anything if one of its types is already taken.
    pub fn register(&mut self, processor: Arc<dyn Processor>) -> Result<(), RegistryError> {
        let types = processor.job_types();
        if types.is_empty() {
            return Err(RegistryError::NoJobTypes);
        }
        if let Some(taken) = types.iter().find(|t| self.processors.contains_key(*t)) {
            return Err(RegistryError::DuplicateJobType(taken.clone()));
        }
        for job_type in types {
            self.processors.insert(job_type, processor.clone());
        }
        Ok(())
    }

    /// Builder-style `register`.
    pub fn with(mut self, processor: Arc<dyn Processor>) -> Result<Self, RegistryError> {
        self.register(processor)?;
        Ok(self)
    }

    pub fn processor_for(&self, job_type: &str) -> Option<Arc<dyn Processor>> {
        self.processors.get(job_type).cloned()
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.processors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static [&'static str]);

    #[async_trait]
    impl Processor for Fixed {
        fn job_types(&self) -> Vec<String> {
            self.0.iter().map(|t| t.to_string()).collect()
        }

        async fn process(&self, _job: &Job, _ctx: &JobContext) -> Result<JsonValue, ProcessorError> {
            Ok(JsonValue::Null)
        }
    }

    #[test]
    fn panic_payloads_keep_their_message() {
        let err = ProcessorError::panicked(Box::new("index out of bounds"));
        assert_eq!(err.message, "processor panicked: index out of bounds");

        let err = ProcessorError::panicked(Box::new(String::from("bad row 7")));
        assert_eq!(err.message, "processor panicked: bad row 7");

        let err = ProcessorError::panicked(Box::new(42_u32));
        assert_eq!(err.message, "processor panicked");
    }

    #[test]
    fn routes_every_declared_type() {
        let registry = ProcessorRegistry::new()
            .with(Arc::new(Fixed(&["enrich_account", "enrich_contact"])))
            .unwrap()
            .with(Arc::new(Fixed(&["duplicate_scan"])))
            .unwrap();

        assert_eq!(
            registry.job_types(),
            vec!["duplicate_scan", "enrich_account", "enrich_contact"]
        );
        assert!(registry.processor_for("enrich_contact").is_some());
        assert!(registry.processor_for("csv_import").is_none());
    }

    #[test]
    fn duplicate_types_are_rejected_atomically() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(Fixed(&["enrich_account"]))).unwrap();

        let err = registry
            .register(Arc::new(Fixed(&["duplicate_scan", "enrich_account"])))
            .unwrap_err();

        assert_eq!(err, RegistryError::DuplicateJobType("enrich_account".into()));
        assert!(registry.processor_for("duplicate_scan").is_none());
    }

    #[test]
    fn processors_must_declare_a_type() {
        let mut registry = ProcessorRegistry::new();
        assert_eq!(registry.register(Arc::new(Fixed(&[]))), Err(RegistryError::NoJobTypes));
        assert!(registry.is_empty());
    }

    #[test]
    fn anyhow_errors_keep_their_chain_as_stack() {
        let err = anyhow::anyhow!("connection reset").context("calling enrichment api");
        let converted = ProcessorError::from(err);

        assert_eq!(converted.message, "calling enrichment api");
        assert!(converted.stack.unwrap().contains("connection reset"));
    }
}
