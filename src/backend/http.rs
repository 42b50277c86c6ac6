use std::{env, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::backend::{BackendError, GenerateStream, ModelBackend};
use crate::types::StreamToken;

/// Adapter to a generic HTTP generation endpoint: POSTs `{prompt, max_tokens, temperature,
/// stream}` and, when the server streams, reads newline-delimited `data: {...}` frames the
/// same way an SSE body would read, without assuming any particular vendor's wire shape beyond
/// that convention.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| format!("failed to build backend HTTP client: {error}"))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key,
        })
    }

    pub fn from_env(prefix: &str) -> Result<Option<Self>, String> {
        let Some(base_url) = env::var(format!("{prefix}_URL")).ok().filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        let api_key = env::var(format!("{prefix}_API_KEY")).ok().filter(|v| !v.is_empty());
        let timeout_secs = env::var(format!("{prefix}_TIMEOUT_SECS"))
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(60);

        Self::new(base_url, api_key, Duration::from_secs(timeout_secs)).map(Some)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl ModelBackend for HttpBackend {
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<GenerateStream, BackendError> {
        let payload = json!({
            "prompt": prompt,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "stream": true,
        });

        let response = self
            .request(self.client.post(self.url("/generate")))
            .json(&payload)
            .send()
            .await
            .map_err(|error| BackendError::Unavailable(error.to_string()))?;

        if !response.status().is_success() {
            return Err(map_http_error(
                response.status(),
                response.text().await.unwrap_or_else(|_| "unknown backend error".to_owned()),
            ));
        }

        let mut upstream = response.bytes_stream();
        let mut buffer = String::new();

        let stream = async_stream::stream! {
            let mut token_id: i64 = 0;

            while let Some(next) = upstream.next().await {
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        yield Err(BackendError::Unavailable(error.to_string()));
                        break;
                    }
                };

                let text = match std::str::from_utf8(&bytes) {
                    Ok(text) => text,
                    Err(error) => {
                        yield Err(BackendError::InvalidResponse(error.to_string()));
                        break;
                    }
                };

                buffer.push_str(text);

                while let Some(index) = buffer.find('\n') {
                    let line = buffer[..index].trim().to_owned();
                    buffer.drain(..=index);
                    if line.is_empty() {
                        continue;
                    }

                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        continue;
                    }

                    let parsed: UpstreamChunk = match serde_json::from_str(payload) {
                        Ok(parsed) => parsed,
                        Err(error) => {
                            yield Err(BackendError::InvalidResponse(error.to_string()));
                            continue;
                        }
                    };

                    yield Ok(StreamToken {
                        token: parsed.text,
                        token_id,
                        logprob: parsed.logprob,
                        is_special: false,
                    });
                    token_id += 1;
                }
            }
        };

        debug!(base_url = %self.base_url, "http backend stream prepared");
        Ok(stream.boxed())
    }

    async fn health_check(&self) -> bool {
        self.request(self.client.get(self.url("/health")))
            .send()
            .await
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }

    async fn cleanup(&self) {}
}

fn map_http_error(status: StatusCode, body: String) -> BackendError {
    let trimmed = body.chars().take(400).collect::<String>();
    match status {
        StatusCode::TOO_MANY_REQUESTS => BackendError::Unavailable(format!("rate limited: {trimmed}")),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            BackendError::Timeout(format!("upstream timeout: {trimmed}"))
        }
        _ => BackendError::InvalidResponse(format!("status {}: {trimmed}", status.as_u16())),
    }
}

#[derive(Debug, Deserialize)]
struct UpstreamChunk {
    text: String,
    #[serde(default)]
    logprob: Option<f32>,
}
