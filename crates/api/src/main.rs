use std::sync::Arc;

use anyhow::Context;

use patchflow_api::app;
use patchflow_infra::config::PatchflowConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PatchflowConfig::load().context("failed to load configuration")?;
    patchflow_observability::tracing::init(&config.logging);

    let services = Arc::new(app::build_services(&config, app::passthrough_registry()).await?);
    let workers = services.spawn_workers().context("failed to start worker pool")?;
    tracing::info!(
        backend = services.backend().as_str(),
        threads = config.worker.threads,
        "worker pool started"
    );

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app::build_app(services))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Workers finish their current job before the pool joins.
    tokio::task::spawn_blocking(move || workers.shutdown()).await?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested");
}
