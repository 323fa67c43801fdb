use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use tidecrm_infra::jobs::{ChangeNotifier, PostgresJobStore, ProcessorRegistry, Worker, WorkerConfig};
use tidecrm_infra::processors::{
    DuplicateDetectionProcessor, EnrichmentProcessor, HttpDuplicateScanner, HttpEnrichmentProvider,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; the environment may already be set.
    let _ = dotenvy::dotenv();
    tidecrm_observability::init();

    let config = WorkerConfig::from_env();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PostgresJobStore::new(pool);
    store.ensure_schema().await.context("failed to prepare job schema")?;

    let registry = build_registry()?;
    if registry.is_empty() {
        anyhow::bail!("no processors configured; set ENRICHMENT_API_URL and/or DUPLICATE_SCAN_API_URL");
    }

    let notifier = build_notifier()?;

    tracing::info!(
        worker_id = %config.worker_id,
        job_queue = %config.job_queue,
        max_concurrent = config.max_concurrent,
        job_types = ?registry.job_types(),
        "starting worker"
    );
    let handle = Worker::new(config, Arc::new(store), registry, notifier).spawn();

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested, draining in-flight jobs");
    handle.shutdown().await;

    Ok(())
}

fn build_registry() -> anyhow::Result<ProcessorRegistry> {
    let mut registry = ProcessorRegistry::new();

    if let Ok(url) = std::env::var("ENRICHMENT_API_URL") {
        let mut provider = HttpEnrichmentProvider::new(url).context("failed to build enrichment client")?;
        if let Ok(token) = std::env::var("ENRICHMENT_API_TOKEN") {
            provider = provider.with_token(token);
        }
        registry.register(Arc::new(EnrichmentProcessor::new(Arc::new(provider))))?;
    }

    if let Ok(url) = std::env::var("DUPLICATE_SCAN_API_URL") {
        let mut scanner = HttpDuplicateScanner::new(url).context("failed to build duplicate scan client")?;
        if let Ok(token) = std::env::var("DUPLICATE_SCAN_API_TOKEN") {
            scanner = scanner.with_token(token);
        }
        registry.register(Arc::new(DuplicateDetectionProcessor::new(Arc::new(scanner))))?;
    }

    Ok(registry)
}

#[cfg(feature = "redis")]
fn build_notifier() -> anyhow::Result<ChangeNotifier> {
    use tidecrm_infra::event_bus::{DEFAULT_JOB_CHANNEL, RedisPubSubBus};
    use tidecrm_infra::jobs::JobChanged;

    match std::env::var("REDIS_URL") {
        Ok(url) => {
            let bus = RedisPubSubBus::<JobChanged>::new(&url, DEFAULT_JOB_CHANNEL)
                .context("failed to create Redis pub/sub bus")?;
            tracing::info!(channel = DEFAULT_JOB_CHANNEL, "publishing job changes to redis");
            Ok(ChangeNotifier::new(Arc::new(bus)))
        }
        Err(_) => Ok(ChangeNotifier::in_memory()),
    }
}

#[cfg(not(feature = "redis"))]
fn build_notifier() -> anyhow::Result<ChangeNotifier> {
    if std::env::var("REDIS_URL").is_ok() {
        tracing::warn!("REDIS_URL is set but this build lacks the `redis` feature; job changes stay in-process");
    }
    Ok(ChangeNotifier::in_memory())
}
