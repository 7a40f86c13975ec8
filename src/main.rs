//! Courier content delivery service.
//!
//! Opens the SQLite store, recovers jobs interrupted by a previous run and
//! keeps delivering queued content until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{Storage, TracingNotifier};
use courier_delivery::{
    client::HttpClient, DefaultPublisherFactory, QueueManager, SqliteDeliveryStorage,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;

use config::Config;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        database_url = %config.database_url,
        max_concurrent = config.max_concurrent,
        conflict_policy = %config.conflict_policy,
        max_retries = config.max_retries,
        "starting courier"
    );

    let storage = Storage::connect(&config.database_url, config.database_max_connections)
        .await
        .context("failed to open database")?;
    let storage = Arc::new(storage);
    info!("database ready");

    let client =
        HttpClient::new(config.to_client_config()).context("failed to build HTTP client")?;
    let queue = QueueManager::with_storage(
        Arc::new(SqliteDeliveryStorage::new(storage.clone())),
        Arc::new(DefaultPublisherFactory::new(client)),
    )
    .config(config.to_queue_config())
    .retry_policy(config.to_retry_policy())
    .notifier(Arc::new(TracingNotifier))
    .build();

    let recovered = queue.start().await.context("failed to start queue")?;
    info!(recovered, "courier is delivering");

    let stop = CancellationToken::new();
    let purge = config.purge_after().map(|retention| {
        let queue = queue.clone();
        let stop = stop.clone();
        tokio::spawn(async move { run_purge(queue, retention, stop).await })
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight jobs");

    stop.cancel();
    if let Some(handle) = purge {
        if let Err(e) = handle.await {
            error!(error = %e, "purge task failed");
        }
    }

    if !queue.shutdown(SHUTDOWN_TIMEOUT).await {
        warn!("unfinished jobs will be recovered on next start");
    }

    storage.close().await;
    info!("courier shutdown complete");
    Ok(())
}

/// Installs the fmt subscriber. `RUST_LOG` wins over the configured filter.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Deletes old finished jobs every hour until `stop` fires.
async fn run_purge(queue: QueueManager, retention: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = queue.purge_finished(retention).await {
                    warn!(error = %e, "purging finished jobs failed");
                }
            },
        }
    }
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for CTRL+C");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C"),
        () = terminate => info!("received SIGTERM"),
    }
}
