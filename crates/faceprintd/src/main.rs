use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("faceprintd starting");

    let config = config::Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        localization = config.localization.name(),
        batch_policy = config.batch_policy.name(),
        min_image_size = config.min_image_size,
        max_batch_size = config.max_batch_size,
        timeout_secs = config.request_timeout.as_secs(),
        "configuration loaded"
    );

    let engine = engine::spawn_engine(&config).context("failed to start embedding engine")?;

    let state = server::AppState {
        engine,
        request_timeout: config.request_timeout,
        localization: config.localization.name(),
    };
    let router = server::build_router(state, config.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "faceprintd ready");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_on(tokio::signal::ctrl_c()))
        .await?;

    Ok(())
}

/// Resolve when `signal` fires. A signal that could not be installed never fires.
async fn shutdown_on(signal: impl std::future::Future<Output = std::io::Result<()>>) {
    if let Err(e) = signal.await {
        tracing::error!(error = %e, "failed to install Ctrl-C handler, running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("faceprintd shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_on_signal() {
        let done = tokio::time::timeout(Duration::from_millis(100), shutdown_on(async { Ok(()) })).await;
        assert!(done.is_ok());
    }

    #[tokio::test]
    async fn test_failed_signal_install_keeps_serving() {
        let failed = async { Err(std::io::Error::other("no signal driver")) };
        let done = tokio::time::timeout(Duration::from_millis(100), shutdown_on(failed)).await;
        assert!(done.is_err());
    }
}
