// src/main.rs
// threadwire server binary: loads configuration, wires the shared
// application state, starts the background analysis worker, and serves the
// HTTP surface described in spec.md §6.

use tracing_subscriber::EnvFilter;

use threadwire::api::http::router;
use threadwire::config::AppConfig;
use threadwire::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env();
    config.validate()?;

    if config.metrics_enabled {
        threadwire::metrics::install()?;
    }

    let bind_address = config.bind_address();
    let (state, worker) = AppState::build(config).await?;

    if state.config.analysis.enabled {
        worker.spawn();
    }

    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(bind_address, "threadwire listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.storage.close().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
