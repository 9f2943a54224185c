//! HealthTrail - Health Monitoring Service

use healthtrail::config::ServerConfig;
use healthtrail::db::Store;
use healthtrail::history::RetentionReader;
use healthtrail::notify::Notifier;
use healthtrail::probe::ProbeRegistry;
use healthtrail::queue::LocalQueue;
use healthtrail::scheduler::{
    HealthCheckExecutor, HealthCheckPayload, HealthCheckScheduler, RetentionManager, RollupManager,
};
use healthtrail::web::{AppState, Server};

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("healthtrail=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting HealthTrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let registry = Arc::new(ProbeRegistry::with_builtins()?);
    let reader = Arc::new(RetentionReader::new(store.clone(), registry.clone()));
    let notifier = Arc::new(Notifier::new(store.clone(), cfg.webhook_url.clone()));

    let queue = Arc::new(LocalQueue::<HealthCheckPayload>::new());
    let scheduler = Arc::new(HealthCheckScheduler::new(store.clone(), queue.clone()));
    let executor = Arc::new(HealthCheckExecutor::new(
        store.clone(),
        registry.clone(),
        reader.clone(),
        notifier,
        cfg.execution_timeout,
    ));

    let report = scheduler
        .start(executor, &cfg.consumer_group, cfg.worker_concurrency)
        .await?;
    tracing::info!(
        "Scheduled {} health checks ({} failed, {} orphaned jobs removed)",
        report.scheduled,
        report.failed,
        report.orphans_removed
    );

    let grace = ChronoDuration::from_std(cfg.rollup_grace)?;
    let rollups = RollupManager::new(store.clone(), registry.clone(), cfg.rollup_interval, grace);
    rollups.start();
    let retention = RetentionManager::new(store.clone(), cfg.retention_interval);
    retention.start();

    let server = Server::new(AppState {
        config: cfg,
        store,
        registry,
        scheduler,
        reader,
    });
    server.start().await?;

    rollups.stop().await;
    retention.stop().await;
    queue.shutdown().await;

    Ok(())
}
