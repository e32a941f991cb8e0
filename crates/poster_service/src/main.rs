mod config;
mod metrics;
mod routes;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::routes::AppState;
use anyhow::Context;
use area_locator::{Catalog, Georeferencer, MultiScaleMatcher};
use clap::Parser;
use dashmap::DashMap;
use render_pipeline::{CommandTemplate, CpuPool, OutboxDelivery, RenderQueue, RenderWorker, WorkerConfig};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    // Load and check configuration
    let config = Config::parse();
    config.validate()?;
    tracing::info!(config = ?config, "Loaded configuration");

    for dir in [&config.tmp_dir, &config.work_dir, &config.outbox_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create directory '{}'", dir.display()))?;
    }

    // Dropping the sender signals every receiver.
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // Build shared services
    let metrics = Arc::new(Metrics::new().context("Failed to create metrics registry")?);
    let pool = CpuPool::new(config.cpu_threads).context("Failed to build CPU pool")?;
    let georeferencer = Arc::new(Georeferencer::new(
        Catalog::new(&config.files_root),
        MultiScaleMatcher::new(config.matcher()),
        &config.tmp_dir,
    ));

    // Spawn the render worker
    let (queue, jobs) = RenderQueue::new();
    let worker_handle = RenderWorker::new(
        jobs,
        Arc::new(OutboxDelivery::new(&config.outbox_dir)),
        pool.clone(),
        WorkerConfig {
            preview_max_dimension: config.preview_max_dimension,
        },
    )
    .spawn(shutdown_rx.clone());

    // Spawn the metrics recorder
    let recorder_handle = metrics.clone().spawn_recorder(queue.clone(), shutdown_rx.clone());

    // Spawn the area sweeper
    let areas = Arc::new(DashMap::new());
    let sweeper_handle = routes::spawn_area_sweeper(areas.clone(), config.area_ttl(), shutdown_rx.clone());

    // Spawn the HTTP server
    let app = routes::router(AppState {
        georeferencer,
        pool,
        queue,
        template: CommandTemplate::new(config.render_command.clone()),
        work_dir: config.work_dir.clone(),
        areas: areas.clone(),
        metrics,
        max_upload_bytes: config.max_upload_bytes,
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    let http_handle = {
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
                .context("HTTP server failed")
        })
    };

    tracing::info!(addr = %config.listen_addr, "All services started. Awaiting shutdown signal...");

    // Wait for shutdown signal
    shutdown_signal().await;

    tracing::info!("Shutdown signal received. Terminating services...");
    drop(shutdown_tx);

    // Await all tasks to ensure clean shutdown
    let (worker_res, recorder_res, sweeper_res, http_res) =
        tokio::join!(worker_handle, recorder_handle, sweeper_handle, http_handle);

    if let Err(e) = worker_res {
        tracing::error!(error = %e, "Render worker task failed.");
    }
    if let Err(e) = recorder_res {
        tracing::error!(error = %e, "Metrics recorder task failed.");
    }
    if let Err(e) = sweeper_res {
        tracing::error!(error = %e, "Area sweeper task failed.");
    }
    match http_res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server stopped with an error."),
        Err(e) => tracing::error!(error = %e, "HTTP server task failed."),
    }

    // Areas left unclaimed at exit are never picked up again.
    routes::discard_pending_areas(&areas).await;

    tracing::info!("Poster service shut down gracefully.");
    Ok(())
}

/// Listens for OS shutdown signals (SIGINT, SIGTERM) and resolves when one is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
