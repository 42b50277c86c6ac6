pub mod http;
pub mod mock;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::types::StreamToken;

pub type GenerateStream = BoxStream<'static, Result<StreamToken, BackendError>>;

/// The single capability a model loader must supply: a generate call plus two optional
/// lifecycle hooks. No other methods are invoked by the registry or worker supervisor.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<GenerateStream, BackendError>;

    async fn health_check(&self) -> bool {
        true
    }

    async fn cleanup(&self) {}
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timeout: {0}")]
    Timeout(String),
    #[error("backend invalid response: {0}")]
    InvalidResponse(String),
}
