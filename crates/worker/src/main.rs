use std::sync::Arc;

use anyhow::{Context, Result};
use benchrun_scheduler::prelude::*;
use benchrun_worker::telemetry::{init_telemetry, TelemetryConfig};
use benchrun_worker::{CronSubmitter, SourceRepo, WorkerConfig};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is fine, the environment may be set directly
    let _ = dotenvy::dotenv();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "benchrun_worker=info,benchrun_scheduler=info")
    init_telemetry(TelemetryConfig::from_env());

    tracing::info!("benchrun-worker starting...");

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;

    let (store, measurements): (Arc<dyn RunStore>, Option<Measurements>) =
        match &config.database_url {
            Some(url) => {
                let store = PostgresRunStore::connect(url)
                    .await
                    .context("Failed to connect to PostgreSQL")?;
                store.migrate().await.context("Failed to run migrations")?;
                let measurements = Measurements::postgres(
                    store.pool().clone(),
                    config.regression_threshold_percent,
                );
                let store: Arc<dyn RunStore> = Arc::new(store);
                (store, Some(measurements))
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory store; comparisons are disabled");
                let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
                (store, None)
            }
        };

    let notifier: Arc<dyn Notifier> = match &config.slack_webhook_url {
        Some(url) => Arc::new(SlackNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };

    let comparator = measurements.map(|measurements| {
        Arc::new(
            Comparator::new(store.clone(), measurements, notifier)
                .with_config(config.comparator_config()),
        )
    });

    let executor = LifecycleExecutor::new(store.clone()).with_deadline(config.execution_timeout);
    let scheduler = Scheduler::new(
        config.scheduler_config(),
        store.clone(),
        Arc::new(executor),
        comparator,
    );

    tracing::info!(
        max_concurrent_jobs = config.max_concurrent_jobs,
        retries = config.run_retries,
        execution_timeout = ?config.execution_timeout,
        "Starting scheduler"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(scheduler.clone().run(shutdown_rx.clone()));

    let cron_handle = if config.cron_enabled() {
        let source = SourceRepo::new(
            &config.source_dir,
            config.repository_url.clone(),
            config.source_branch.clone(),
        );
        let cron = CronSubmitter::new(
            scheduler.clone(),
            source,
            config.cron_benchmarks.clone(),
            config.run_config.clone(),
            config.cron_interval,
        );
        Some(tokio::spawn(cron.run(shutdown_rx)))
    } else {
        tracing::info!("Cron loop disabled");
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!(
        queued = scheduler.len(),
        in_flight = scheduler.in_flight(),
        grace = ?config.shutdown_grace,
        "Received shutdown signal"
    );
    let _ = shutdown_tx.send(true);

    // Returns once running executions finished or the grace period expired
    scheduler_handle.await.context("Scheduler task failed")?;
    if let Some(handle) = cron_handle {
        handle.await.context("Cron task failed")?;
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
