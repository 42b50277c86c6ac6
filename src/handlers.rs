use std::{convert::Infallible, sync::atomic::Ordering};

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    errors::AppError,
    limits::Admission,
    state::AppState,
    types::{ChatInferRequest, StreamEvent, StreamToken},
};

struct ConnectionGuard<'a>(&'a AppState);

impl<'a> ConnectionGuard<'a> {
    fn enter(state: &'a AppState) -> Self {
        state.active_connections.fetch_add(1, Ordering::Relaxed);
        Self(state)
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Serialize)]
struct TokenOut {
    token: String,
    token_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    logprob: Option<f32>,
}

impl From<StreamToken> for TokenOut {
    fn from(token: StreamToken) -> Self {
        Self {
            token: token.token,
            token_id: token.token_id,
            logprob: token.logprob,
        }
    }
}

#[derive(Debug, Serialize)]
struct InferResponse {
    request_id: String,
    model: String,
    tokens: Vec<TokenOut>,
}

async fn admit(state: &AppState, client_id: &str, model: &str) -> Result<(), AppError> {
    if state.rate_limiter.check(client_id, 1.0).await == Admission::Denied {
        return Err(AppError::RateLimited(client_id.to_owned()));
    }
    if state.scheduler_for(model).await.is_none() {
        return Err(AppError::UnknownModel(model.to_owned()));
    }
    Ok(())
}

pub async fn infer(State(state): State<AppState>, Json(body): Json<ChatInferRequest>) -> Response {
    let _connection = ConnectionGuard::enter(&state);

    match handle_infer(state, body).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn handle_infer(state: AppState, body: ChatInferRequest) -> Result<Response, AppError> {
    let request = body.into_request()?;
    admit(&state, &request.client_id, &request.model).await?;

    let scheduler = state
        .scheduler_for(&request.model)
        .await
        .ok_or_else(|| AppError::UnknownModel(request.model.clone()))?;

    let mut consumer = state.streams.create_stream(&request.request_id, None).await?;
    let request_id = request.request_id.clone();
    let model = request.model.clone();
    scheduler.enqueue(request).await?;

    let mut tokens = Vec::new();
    loop {
        match consumer.next_event().await {
            StreamEvent::Data(token) => tokens.push(TokenOut::from(token)),
            StreamEvent::End => break,
            StreamEvent::Error(kind) => {
                warn!(request_id = %request_id, ?kind, "inference ended in error");
                return Err(error_for_kind(kind, &request_id));
            }
        }
    }

    info!(request_id = %request_id, model = %model, tokens = tokens.len(), "infer completed");
    Ok(Json(InferResponse {
        request_id,
        model,
        tokens,
    })
    .into_response())
}

pub async fn infer_stream(State(state): State<AppState>, Json(body): Json<ChatInferRequest>) -> Response {
    let _connection = ConnectionGuard::enter(&state);

    match handle_infer_stream(state, body).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn handle_infer_stream(state: AppState, body: ChatInferRequest) -> Result<Response, AppError> {
    let request = body.into_request()?;
    admit(&state, &request.client_id, &request.model).await?;

    let scheduler = state
        .scheduler_for(&request.model)
        .await
        .ok_or_else(|| AppError::UnknownModel(request.model.clone()))?;

    let mut consumer = state.streams.create_stream(&request.request_id, None).await?;
    scheduler.enqueue(request).await?;

    let outbound = async_stream::stream! {
        loop {
            match consumer.next_event().await {
                StreamEvent::Data(token) => {
                    let payload = TokenOut::from(token);
                    yield Ok::<Event, Infallible>(json_event(&payload));
                }
                StreamEvent::End => break,
                StreamEvent::Error(kind) => {
                    warn!(stream_id = %consumer.id(), ?kind, "stream ended in error");
                    break;
                }
            }
        }
    };

    Ok(Sse::new(outbound)
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(10)))
        .into_response())
}

fn json_event<T: Serialize>(payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(serialized) => Event::default().data(serialized),
        Err(error) => Event::default().data(format!("{{\"error\":\"{error}\"}}")),
    }
}

fn error_for_kind(kind: crate::errors::ErrorKind, request_id: &str) -> AppError {
    match kind {
        crate::errors::ErrorKind::RequestTimeout => AppError::RequestTimeout(request_id.to_owned()),
        crate::errors::ErrorKind::StreamTimeout => AppError::StreamTimeout(request_id.to_owned()),
        crate::errors::ErrorKind::BackendError => AppError::BackendError(request_id.to_owned()),
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_connections: usize,
    active_streams: usize,
}

pub async fn health(State(state): State<AppState>) -> Response {
    let active_streams = state.streams.active_streams().await;
    Json(HealthResponse {
        status: "healthy",
        active_connections: state.active_connections.load(Ordering::Relaxed),
        active_streams,
    })
    .into_response()
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    models: std::collections::HashMap<String, Vec<String>>,
    total_models: usize,
}

pub async fn models(State(state): State<AppState>) -> Response {
    let models = state.registry.list_models().await;
    let total_models = models.values().map(Vec::len).sum();
    Json(ModelsResponse { models, total_models }).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    Json(state.metrics.snapshot_all().await).into_response()
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    models: std::collections::HashMap<String, Vec<String>>,
    schedulers: Vec<crate::scheduler::SchedulerStats>,
    active_streams: usize,
    active_connections: usize,
}

pub async fn status(State(state): State<AppState>) -> Response {
    Json(StatusResponse {
        models: state.registry.list_models().await,
        schedulers: state.scheduler_stats().await,
        active_streams: state.streams.active_streams().await,
        active_connections: state.active_connections.load(Ordering::Relaxed),
    })
    .into_response()
}
