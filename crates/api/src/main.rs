use std::sync::Arc;

use anyhow::Context;

use fieldops_api::app::{AppServices, Stores, build_app};
use fieldops_api::config::AppConfig;
use fieldops_api::delivery::{build_runner, log_only_handlers};
use fieldops_core::{Clock, SystemClock};
use fieldops_outbox::{AssumeTargetExists, NoCircuit};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fieldops_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let stores = Stores::from_config(&config)
        .await
        .context("failed to initialize outbox stores")?;

    let runner = Arc::new(build_runner(
        &stores,
        log_only_handlers(),
        Arc::new(NoCircuit),
        clock.clone(),
        &config.runner,
    ));
    let runner_handle = runner.spawn();

    let services = Arc::new(AppServices::new(
        stores,
        Arc::new(AssumeTargetExists),
        clock,
    ));
    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    tracing::info!("http server stopped; draining delivery runner");
    runner_handle.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c; shutting down");
    }
}
