use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::mpsc, time::sleep};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::backend::{BackendError, GenerateStream, ModelBackend};
use crate::types::StreamToken;

/// Deterministic backend used for local development and tests: emits a canned sequence of
/// tokens derived from the prompt, one every `token_delay`, never touching the network.
#[derive(Debug, Clone)]
pub struct MockBackend {
    name: String,
    token_delay: Duration,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            name: "mock-backend".to_owned(),
            token_delay: Duration::from_millis(20),
        }
    }
}

impl MockBackend {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        _temperature: f32,
    ) -> Result<GenerateStream, BackendError> {
        let words = render_response(prompt, max_tokens);
        let delay = self.token_delay;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            for (index, word) in words.into_iter().enumerate() {
                let token = StreamToken {
                    token: word,
                    token_id: index as i64,
                    logprob: Some(-0.1),
                    is_special: false,
                };
                if tx.send(Ok(token)).await.is_err() {
                    return;
                }
                sleep(delay).await;
            }
        });

        debug!(backend = %self.name, "mock stream prepared");
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn cleanup(&self) {}
}

fn render_response(prompt: &str, max_tokens: u32) -> Vec<String> {
    let seed = prompt.split_whitespace().take(6).collect::<Vec<_>>().join(" ");
    let body = if seed.is_empty() {
        "hello world".to_owned()
    } else {
        seed
    };

    let mut words: Vec<String> = body.split_whitespace().map(ToString::to_string).collect();
    if words.is_empty() {
        words.push("ok".to_owned());
    }

    let limit = max_tokens.max(1) as usize;
    words.into_iter().cycle().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn generates_requested_token_count() {
        let backend = MockBackend::default().with_token_delay(Duration::from_millis(1));
        let mut stream = backend.generate("hi there", 5, 1.0).await.unwrap();

        let mut count = 0;
        while let Some(token) = stream.next().await {
            token.unwrap();
            count += 1;
        }
        assert_eq!(count, 5);
    }
}
