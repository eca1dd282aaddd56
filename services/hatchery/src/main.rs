//! Hatchery binary.
//!
//! Wires the configured backend and queue into the control loop and serves
//! the worker registration API next to it. Ctrl+C stops both: the control
//! loop drains idle workers and waits for in-flight operations until the
//! shutdown grace period runs out.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hatchery::api::{self, AppState};
use hatchery::backend;
use hatchery::config::Config;
use hatchery::control_loop::MainControlLoop;
use hatchery::governor::ConcurrencyGovernor;
use hatchery::lifecycle::WorkerLifecycleManager;
use hatchery::queue::{HttpQueueClient, MemoryQueue, QueueService};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load hatchery configuration")?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        hatchery = %config.name,
        session = %config.session,
        mode = ?config.mode,
        models = config.models.len(),
        max_workers = config.limits.max_workers,
        "Starting hatchery"
    );

    // The only fatal failure after configuration: no backend session.
    let backend = backend::connect(&config)
        .await
        .context("failed to connect to the provisioning backend")?;
    info!(backend = backend.name(), "Backend connected");

    let queue: Arc<dyn QueueService> = match &config.queue_url {
        Some(url) => Arc::new(
            HttpQueueClient::new(url, config.queue_token.clone(), &config.name)
                .context("failed to build queue client")?,
        ),
        None => {
            warn!("HATCHERY_QUEUE_URL not set; using an in-memory queue");
            Arc::new(MemoryQueue::new())
        }
    };

    let manager = Arc::new(WorkerLifecycleManager::new(
        &config.name,
        config.mode,
        &config.limits,
    ));
    let governor = Arc::new(ConcurrencyGovernor::new(&config.limits));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control_loop = MainControlLoop::new(
        &config,
        backend,
        queue,
        Arc::clone(&manager),
        Arc::clone(&governor),
    );
    let mut loop_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { control_loop.run(shutdown_rx).await }
    });

    let app = api::router(AppState::new(&config, manager, governor));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, public_url = %config.public_url, "Listening for workers");

    let mut server_handle = tokio::spawn(async move {
        let mut shutdown_rx = shutdown_rx;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
        result = &mut loop_handle => {
            if let Err(e) = result {
                error!(error = %e, "Control loop task panicked");
            }
        }
    }

    let _ = shutdown_tx.send(true);

    // The loop bounds itself by the grace period; allow a little slack.
    let wait = config.limits.shutdown_grace + config.limits.operation_timeout;
    if !loop_handle.is_finished() && tokio::time::timeout(wait, loop_handle).await.is_err() {
        warn!("Control loop did not stop in time");
    }
    if !server_handle.is_finished()
        && tokio::time::timeout(std::time::Duration::from_secs(5), server_handle)
            .await
            .is_err()
    {
        warn!("HTTP server did not stop in time");
    }

    info!("Hatchery shutdown complete");
    Ok(())
}
