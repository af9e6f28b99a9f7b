//! Finplan background worker
//!
//! Runs billing maintenance on a cron schedule:
//! - invariant checks every 15 minutes
//! - dead-letter and stuck-delivery report every hour
//! - webhook record retention cleanup daily at 03:30 UTC

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod config;
mod jobs;

use std::sync::Arc;

use anyhow::Context;
use finplan_billing::{InvariantChecker, PgStore};
use tokio::signal;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::WorkerConfig;

const INVARIANT_SCHEDULE: &str = "0 */15 * * * *";
const DEAD_LETTER_SCHEDULE: &str = "0 0 * * * *";
const RETENTION_SCHEDULE: &str = "0 30 3 * * *";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env().context("Invalid configuration")?;
    init_tracing(config.log_json);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Finplan worker");

    let pool = finplan_shared::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;

    let checker = Arc::new(InvariantChecker::new(pool.clone()));
    let store = Arc::new(PgStore::new(pool));
    let retention_days = config.webhook_retention_days;

    let mut scheduler = JobScheduler::new().await?;

    scheduler
        .add(Job::new_async(INVARIANT_SCHEDULE, move |_id, _scheduler| {
            let checker = checker.clone();
            Box::pin(async move { jobs::run_invariant_checks(&checker).await })
        })?)
        .await?;

    let dead_letter_store = store.clone();
    scheduler
        .add(Job::new_async(DEAD_LETTER_SCHEDULE, move |_id, _scheduler| {
            let store = dead_letter_store.clone();
            Box::pin(async move {
                jobs::report_dead_letters(store.as_ref()).await;
                jobs::report_stuck_deliveries(store.as_ref()).await;
            })
        })?)
        .await?;

    scheduler
        .add(Job::new_async(RETENTION_SCHEDULE, move |_id, _scheduler| {
            let store = store.clone();
            Box::pin(async move {
                jobs::purge_webhook_events(store.as_ref(), retention_days).await;
            })
        })?)
        .await?;

    scheduler.start().await?;
    tracing::info!(
        retention_days = retention_days,
        "Maintenance jobs scheduled"
    );

    shutdown_signal().await;
    scheduler.shutdown().await?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, stopping worker"),
        _ = terminate => tracing::info!("Received SIGTERM, stopping worker"),
    }
}
