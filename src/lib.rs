pub mod backend;
pub mod errors;
pub mod handlers;
pub mod limits;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod stream;
pub mod types;
pub mod worker;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    routing::{get, post},
    Router,
};
use tracing::info;

use backend::{http::HttpBackend, mock::MockBackend, ModelBackend};
use registry::ModelLoader;
use state::AppState;
use types::{BatchConfig, Device, ModelConfig, ServerConfig};

/// Loads a backend for any model name: an HTTP adapter when `<PREFIX>_URL` is configured in the
/// environment, otherwise a deterministic mock. `prefix` lets distinct model names point at
/// distinct upstreams (`GATEWAY_BACKEND_<NAME>_URL`).
pub struct EnvBackendLoader;

#[async_trait]
impl ModelLoader for EnvBackendLoader {
    async fn load(&self, config: &ModelConfig) -> Result<Arc<dyn ModelBackend>, String> {
        let prefix = format!(
            "GATEWAY_BACKEND_{}",
            config.name.to_uppercase().replace(['-', '.'], "_")
        );
        match HttpBackend::from_env(&prefix) {
            Ok(Some(backend)) => Ok(Arc::new(backend)),
            Ok(None) => Ok(Arc::new(MockBackend::named(config.name.clone()))),
            Err(error) => Err(error),
        }
    }
}

pub async fn build_state() -> Result<AppState, std::io::Error> {
    let config = ServerConfig::from_env().map_err(std::io::Error::other)?;
    let batch_config = BatchConfig::from_env();
    let state = AppState::new(config, batch_config);

    let default_model = ModelConfig::new(
        std::env::var("GATEWAY_DEFAULT_MODEL").unwrap_or_else(|_| "mock".to_owned()),
        "1.0",
        Device::Cpu,
    )
    .map_err(std::io::Error::other)?;

    state
        .register_model(default_model, Arc::new(EnvBackendLoader))
        .await
        .map_err(std::io::Error::other)?;

    info!("model registry initialized");
    Ok(state)
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/infer", post(handlers::infer))
        .route("/infer_stream", post(handlers::infer_stream))
        .route("/health", get(handlers::health))
        .route("/models", get(handlers::models))
        .route("/metrics", get(handlers::metrics))
        .route("/status", get(handlers::status))
        .with_state(state)
}
