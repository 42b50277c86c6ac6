use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Index into a fixed-size array of per-priority queues, ordered high-to-low.
    pub fn rank(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatInferRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub request_id: String,
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub priority: Priority,
    pub timeout_seconds: f64,
    pub client_id: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub enqueued_at: Option<std::time::Instant>,
}

impl ChatInferRequest {
    /// Validates and normalizes a wire request into an `InferenceRequest`.
    ///
    /// `request_id` is always issued here, never trusted from the client.
    pub fn into_request(self) -> Result<InferenceRequest, AppError> {
        if self.model.trim().is_empty() {
            return Err(AppError::InvalidRequest("model".into(), "must not be empty".into()));
        }

        let max_tokens = self.max_tokens.unwrap_or(100);
        if max_tokens == 0 {
            return Err(AppError::InvalidRequest(
                "max_tokens".into(),
                "must be positive".into(),
            ));
        }

        let temperature = self.temperature.unwrap_or(1.0);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(AppError::InvalidRequest(
                "temperature".into(),
                "must be in [0.0, 2.0]".into(),
            ));
        }

        let top_p = self.top_p.unwrap_or(0.95);
        if !(0.0..=1.0).contains(&top_p) {
            return Err(AppError::InvalidRequest(
                "top_p".into(),
                "must be in [0.0, 1.0]".into(),
            ));
        }

        let timeout_seconds = self.timeout_seconds.unwrap_or(30.0);
        if timeout_seconds <= 0.0 {
            return Err(AppError::InvalidRequest(
                "timeout_seconds".into(),
                "must be positive".into(),
            ));
        }

        Ok(InferenceRequest {
            request_id: format!("req_{}", Uuid::new_v4()),
            model: self.model,
            prompt: self.prompt,
            max_tokens,
            temperature,
            top_p,
            priority: self.priority.unwrap_or(Priority::Normal),
            timeout_seconds,
            client_id: self.client_id.unwrap_or_default(),
            metadata: self.metadata,
            enqueued_at: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamToken {
    pub token: String,
    pub token_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprob: Option<f32>,
    #[serde(default)]
    pub is_special: bool,
}

/// A single event delivered to a stream consumer; `End` is the required out-of-band terminator.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Data(StreamToken),
    End,
    Error(crate::errors::ErrorKind),
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub min_batch_size: usize,
    pub max_wait_ms: u64,
    pub dynamic_batching: bool,
}

impl BatchConfig {
    pub fn new(
        max_batch_size: usize,
        min_batch_size: usize,
        max_wait_ms: u64,
        dynamic_batching: bool,
    ) -> Result<Self, AppError> {
        if max_batch_size == 0 {
            return Err(AppError::InvalidConfig("max_batch_size".into()));
        }
        if min_batch_size == 0 || min_batch_size > max_batch_size {
            return Err(AppError::InvalidConfig("min_batch_size".into()));
        }
        Ok(Self {
            max_batch_size,
            min_batch_size,
            max_wait_ms,
            dynamic_batching,
        })
    }

    pub fn from_env() -> Self {
        let max_batch_size = read_env_usize("GATEWAY_MAX_BATCH_SIZE", 32);
        let min_batch_size = read_env_usize("GATEWAY_MIN_BATCH_SIZE", 1).min(max_batch_size).max(1);
        let max_wait_ms = read_env_u64("GATEWAY_MAX_BATCH_WAIT_MS", 50);
        let dynamic_batching = std::env::var("GATEWAY_DYNAMIC_BATCHING")
            .map(|value| value != "0" && !value.eq_ignore_ascii_case("false"))
            .unwrap_or(true);

        Self::new(max_batch_size, min_batch_size, max_wait_ms, dynamic_batching)
            .expect("env-derived batch config must validate")
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub name: String,
    pub version: String,
    pub device: Device,
    pub dtype: String,
    pub max_seq_length: u32,
    pub warmup_tokens: u32,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    Cpu,
    Mps,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>, device: Device) -> Result<Self, AppError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(AppError::InvalidConfig("name".into()));
        }
        Ok(Self {
            name,
            version: version.into(),
            device,
            dtype: "float16".to_owned(),
            max_seq_length: 4096,
            warmup_tokens: 8,
            metadata: HashMap::new(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(value: &str) -> Result<Self, AppError> {
        match value.to_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            _ => Err(AppError::InvalidConfig("log_level".into())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub request_timeout: Duration,
    pub enable_metrics: bool,
    pub log_level: LogLevel,
    pub rate_limit_per_minute: u64,
    pub graceful_shutdown_timeout: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let host = std::env::var("GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_owned());
        if host.trim().is_empty() {
            return Err(AppError::InvalidConfig("host".into()));
        }

        let port = read_env_u64("GATEWAY_PORT", 8080);
        if port == 0 || port > 65_535 {
            return Err(AppError::InvalidConfig("port".into()));
        }

        let max_connections = read_env_usize("GATEWAY_MAX_CONNECTIONS", 512);
        if max_connections == 0 {
            return Err(AppError::InvalidConfig("max_connections".into()));
        }

        let request_timeout_secs = read_env_u64("GATEWAY_REQUEST_TIMEOUT_SECS", 30);
        if request_timeout_secs == 0 {
            return Err(AppError::InvalidConfig("request_timeout".into()));
        }

        let graceful_shutdown_secs = read_env_u64("GATEWAY_GRACEFUL_SHUTDOWN_SECS", 30);
        if graceful_shutdown_secs == 0 {
            return Err(AppError::InvalidConfig("graceful_shutdown_timeout".into()));
        }

        let log_level = match std::env::var("GATEWAY_LOG_LEVEL") {
            Ok(value) => LogLevel::parse(&value)?,
            Err(_) => LogLevel::Info,
        };

        Ok(Self {
            host,
            port: port as u16,
            max_connections,
            request_timeout: Duration::from_secs(request_timeout_secs),
            enable_metrics: std::env::var("GATEWAY_ENABLE_METRICS")
                .map(|value| value != "0")
                .unwrap_or(true),
            log_level,
            rate_limit_per_minute: read_env_u64("GATEWAY_RATE_LIMIT_PER_MINUTE", 6000),
            graceful_shutdown_timeout: Duration::from_secs(graceful_shutdown_secs),
        })
    }
}

pub(crate) fn read_env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

pub(crate) fn read_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_temperature() {
        let request = ChatInferRequest {
            model: "gpt-test".to_owned(),
            prompt: "hi".to_owned(),
            max_tokens: None,
            temperature: Some(2.0001),
            top_p: None,
            priority: None,
            timeout_seconds: None,
            client_id: None,
            metadata: HashMap::new(),
        };

        let error = request.into_request().expect_err("out of range temperature should fail");
        assert!(matches!(error, AppError::InvalidRequest(field, _) if field == "temperature"));
    }

    #[test]
    fn accepts_boundary_temperature_values() {
        for temperature in [0.0_f32, 2.0_f32] {
            let request = ChatInferRequest {
                model: "gpt-test".to_owned(),
                prompt: "hi".to_owned(),
                max_tokens: None,
                temperature: Some(temperature),
                top_p: None,
                priority: None,
                timeout_seconds: None,
                client_id: None,
                metadata: HashMap::new(),
            };
            request.into_request().expect("boundary temperature should validate");
        }
    }

    #[test]
    fn rejects_empty_model() {
        let request = ChatInferRequest {
            model: "   ".to_owned(),
            prompt: "hi".to_owned(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            priority: None,
            timeout_seconds: None,
            client_id: None,
            metadata: HashMap::new(),
        };

        let error = request.into_request().expect_err("empty model should fail");
        assert!(matches!(error, AppError::InvalidRequest(field, _) if field == "model"));
    }

    #[test]
    fn batch_config_rejects_min_over_max() {
        let error = BatchConfig::new(4, 5, 50, true).expect_err("min > max should fail");
        assert!(matches!(error, AppError::InvalidConfig(field) if field == "min_batch_size"));
    }
}
