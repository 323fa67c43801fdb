//! Background job engine for workspace-scoped CRM work.
//!
//! ## Design
//!
//! - Jobs are rows; the store is the only source of truth
//! - Workers poll their queue, then claim with one conditional update
//!   (`pending -> processing`); a lost race is skipped silently
//! - Failed attempts back off exponentially (`min(60s * 2^(n-1), 1h)`) until
//!   `max_attempts`, then the job is `failed`
//! - Every row write publishes a `JobChanged` after it succeeded
//! - A reaper hands back jobs whose worker stopped heartbeating
//!
//! ## Components
//!
//! - `JobStore`: persistence (`InMemoryJobStore`, `PostgresJobStore`)
//! - `Poller` / `JobExecutor` / `StaleJobReaper`: the per-worker machinery,
//!   driven by `Worker`
//! - `ProcessorRegistry`: job type -> `Processor`
//! - `JobSidecar` / `JobContext`: progress and log writes from a running job
//! - `JobService`: producer and operator API
//! - `StatsAggregator`: dashboard figures

pub mod config;
pub mod executor;
pub mod notifier;
pub mod poller;
pub mod postgres;
pub mod reaper;
pub mod registry;
pub mod service;
pub mod sidecar;
pub mod stats;
pub mod store;
pub mod types;
pub mod worker;

pub use config::WorkerConfig;
pub use executor::{ExecutionOutcome, JobExecutor};
pub use notifier::{ChangeNotifier, JobChangeBus, JobChanged};
pub use poller::Poller;
pub use postgres::PostgresJobStore;
pub use reaper::StaleJobReaper;
pub use registry::{Processor, ProcessorError, ProcessorRegistry, RegistryError};
pub use service::{JobService, JobServiceError, JobServiceResult, JobWithLogs};
pub use sidecar::{JobContext, JobSidecar};
pub use stats::{JobStats, StatsAggregator};
pub use store::{
    CountQuery, EligibleQuery, InMemoryJobStore, JobFilter, JobPage, JobSort, JobStore, JobStoreError,
    Pagination,
};
pub use types::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE, FailureRecord, Job, JobAction, JobLog, JobStatus, LogLevel,
    NewJob, RetryDecision, RetryPolicy,
};
pub use worker::{Worker, WorkerHandle, WorkerStats};
