//! Missive message queue service.
//!
//! Main entry point. Loads configuration, connects to PostgreSQL, bootstraps
//! the schema, runs the queue engine and shuts it down gracefully on
//! CTRL+C or SIGTERM.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use missive_core::{
    storage::{schema, Storage},
    RealClock,
};
use missive_queue::QueueEngine;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use crate::config::{Config, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config)?;

    info!("Starting missive message queue");
    info!(
        database_url = %config.database_url_masked(),
        external_api_url = %config.external_api_url,
        max_connections = config.database_max_connections,
        delivery_batch_size = config.delivery_batch_size,
        bulk_batch_size = config.bulk_batch_size,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    schema::ensure_schema(&db_pool).await.context("Failed to bootstrap database schema")?;
    info!("Database schema ready");

    let mut engine = QueueEngine::with_postgres(
        Storage::new(db_pool.clone()),
        config.to_queue_config(),
        Arc::new(RealClock::new()),
    )
    .context("Failed to create queue engine")?;

    engine.start().context("Failed to start queue engine")?;
    info!(
        lease_timeout_secs = engine.config().lease_timeout.as_secs(),
        shutdown_timeout_secs = engine.config().shutdown_timeout.as_secs(),
        "Missive is processing the queue"
    );

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    let stats = engine.stats().await;
    info!(
        messages_sent = stats.messages_sent,
        messages_failed = stats.messages_failed,
        envelopes_done = stats.envelopes_done,
        leases_reaped = stats.leases_reaped,
        outcomes_unrecorded = stats.outcomes_unrecorded,
        "Queue statistics at shutdown"
    );

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "Queue engine did not shut down cleanly");
    } else {
        info!("Queue engine stopped");
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Missive shutdown complete");
    Ok(())
}

/// Initializes tracing from the configured filter and format.
///
/// `RUST_LOG` in the environment wins over the configured directives.
fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.rust_log))
        .context("Invalid log filter directives")?;

    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true))
            .try_init(),
    }
    .context("Failed to install tracing subscriber")
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
