use std::net::{IpAddr, SocketAddr};

use priority_infer_gateway::{build_app, build_state};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let default_log_level =
        std::env::var("GATEWAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{default_log_level},priority_infer_gateway={default_log_level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = build_state().await?;
    let app = build_app(state.clone());

    let host: IpAddr = state
        .config
        .host
        .parse()
        .map_err(|error| format!("invalid GATEWAY_HOST {:?}: {error}", state.config.host))?;
    let addr = SocketAddr::from((host, state.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;
    Ok(())
}

/// Waits for SIGINT/SIGTERM, then drains within `graceful_shutdown_timeout` before returning
/// control to `axum::serve`, which stops accepting new connections at that point.
async fn shutdown_signal(state: priority_infer_gateway::state::AppState) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining");
    let timeout = state.config.graceful_shutdown_timeout;
    if tokio::time::timeout(timeout, state.shutdown()).await.is_err() {
        tracing::warn!("graceful shutdown timed out, forcing close");
    }
}
