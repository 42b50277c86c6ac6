use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use priority_infer_gateway::{
    backend::{mock::MockBackend, ModelBackend},
    build_app,
    registry::ModelLoader,
    state::AppState,
    types::{BatchConfig, Device, LogLevel, ModelConfig, ServerConfig},
};
use tower::util::ServiceExt;

struct StaticMockLoader;

#[async_trait]
impl ModelLoader for StaticMockLoader {
    async fn load(&self, config: &ModelConfig) -> Result<Arc<dyn ModelBackend>, String> {
        Ok(Arc::new(
            MockBackend::named(config.name.clone()).with_token_delay(Duration::from_millis(1)),
        ))
    }
}

async fn test_state() -> AppState {
    let config = ServerConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        max_connections: 16,
        request_timeout: Duration::from_secs(2),
        enable_metrics: true,
        log_level: LogLevel::Info,
        rate_limit_per_minute: 6000,
        graceful_shutdown_timeout: Duration::from_secs(1),
    };
    let batch_config = BatchConfig::new(8, 1, 20, true).unwrap();
    let state = AppState::new(config, batch_config);

    state
        .register_model(ModelConfig::new("mock", "1.0", Device::Cpu).unwrap(), Arc::new(StaticMockLoader))
        .await
        .unwrap();

    state
}

#[tokio::test]
async fn infer_returns_tokens_for_registered_model() {
    let app = build_app(test_state().await);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/infer")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"model":"mock","prompt":"hello there","max_tokens":4}"#))
                .expect("request build"),
        )
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.expect("readable body");
    let body: serde_json::Value = serde_json::from_slice(&bytes).expect("valid json");
    assert_eq!(body["model"], "mock");
    assert_eq!(body["tokens"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn infer_rejects_unknown_model_with_404() {
    let app = build_app(test_state().await);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/infer")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"model":"does-not-exist","prompt":"hi"}"#))
                .expect("request build"),
        )
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn infer_rejects_invalid_temperature_with_400() {
    let app = build_app(test_state().await);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/infer")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"model":"mock","prompt":"hi","temperature":9.0}"#))
                .expect("request build"),
        )
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn infer_stream_emits_sse_token_events() {
    let app = build_app(test_state().await);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/infer_stream")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"model":"mock","prompt":"stream this now","max_tokens":3}"#))
                .expect("request build"),
        )
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.expect("readable body");
    let body = String::from_utf8(bytes.to_vec()).expect("utf8 body");
    assert_eq!(body.matches("data:").count(), 3);
}

#[tokio::test]
async fn health_reports_status_and_counts() {
    let app = build_app(test_state().await);

    let response = app
        .oneshot(Request::builder().method("GET").uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["active_streams"].is_u64());
}

#[tokio::test]
async fn models_lists_registered_versions() {
    let app = build_app(test_state().await);

    let response = app
        .oneshot(Request::builder().method("GET").uri("/models").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["total_models"], 1);
    assert_eq!(body["models"]["mock"][0], "1.0");
}
