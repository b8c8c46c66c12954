// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runplane Scheduler - Run Queue Server
//!
//! Recovers run queues from PostgreSQL, dispatches runs one workspace at a
//! time, and relays events to other scheduler processes.

use std::sync::Arc;
use tracing::{info, warn};

use runplane_core::{PostgresStore, migrations};
use runplane_scheduler::config::Config;
use runplane_scheduler::lock::PgAdvisoryLocker;
use runplane_scheduler::runtime::SchedulerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runplane_scheduler=info,runplane_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        max_connections = config.max_connections,
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        notify_channel = %config.notify_channel,
        "Starting Runplane Scheduler"
    );

    // Connect to database
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    migrations::run(&pool).await?;

    info!("Database migrations applied");

    let store = Arc::new(PostgresStore::new(pool.clone()));
    let locker =
        Arc::new(PgAdvisoryLocker::new(pool.clone()).with_retry_interval(config.lock_retry_interval));

    // Start the runtime
    let runtime = SchedulerRuntime::builder()
        .config(&config)
        .store(store)
        .locker(locker)
        .relay_pool(pool)
        .build()?
        .start()
        .await?;

    info!("Scheduler ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Runplane Scheduler shut down");

    Ok(())
}
