use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tracing::{error, info, warn};

use crate::{
    errors::ErrorKind,
    metrics::MetricsCollector,
    registry::ModelRegistry,
    scheduler::BatchScheduler,
    stream::StreamManager,
    types::InferenceRequest,
};

/// Drives one model's `get_batch -> generate -> push_token` loop for its whole lifetime. Spawned
/// by `AppState::register_model` and torn down by closing the scheduler, which causes `get_batch`
/// to return empty batches and the loop to exit cleanly.
///
/// A panic inside a single iteration must not take the model offline: the outer task only ever
/// restarts the inner loop, never propagates the panic.
pub fn spawn(
    model: String,
    scheduler: Arc<BatchScheduler>,
    registry: Arc<ModelRegistry>,
    streams: Arc<StreamManager>,
    metrics: Arc<MetricsCollector>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let scheduler = scheduler.clone();
            let registry = registry.clone();
            let streams = streams.clone();
            let metrics = metrics.clone();
            let model_name = model.clone();

            let inner = tokio::spawn(async move {
                run_loop(model_name, scheduler, registry, streams, metrics).await;
            });

            match inner.await {
                Ok(()) => break,
                Err(join_error) if join_error.is_panic() => {
                    let restarts = scheduler.record_restart();
                    error!(model = %model, restarts, "worker loop panicked, restarting");
                    continue;
                }
                Err(_cancelled) => break,
            }
        }
        info!(model = %model, "worker loop stopped");
    })
}

async fn run_loop(
    model: String,
    scheduler: Arc<BatchScheduler>,
    registry: Arc<ModelRegistry>,
    streams: Arc<StreamManager>,
    metrics: Arc<MetricsCollector>,
) {
    loop {
        let outcome = scheduler.get_batch().await;

        for timed_out in outcome.timed_out {
            metrics.record_timeout(&model);
            streams.fail_stream(&timed_out.request_id, ErrorKind::RequestTimeout).await;
        }

        if outcome.batch.is_empty() {
            if scheduler.is_closed() {
                return;
            }
            continue;
        }

        for request in outcome.batch {
            let registry = registry.clone();
            let streams = streams.clone();
            let metrics = metrics.clone();
            let model = model.clone();
            tokio::spawn(async move {
                serve_one(model, request, registry, streams, metrics).await;
            });
        }
    }
}

async fn serve_one(
    model: String,
    request: InferenceRequest,
    registry: Arc<ModelRegistry>,
    streams: Arc<StreamManager>,
    metrics: Arc<MetricsCollector>,
) {
    let started = Instant::now();

    let Some(handle) = registry.get_model(&model, None).await else {
        warn!(model = %model, request_id = %request.request_id, "model disappeared before dispatch");
        streams.close_stream(&request.request_id).await;
        metrics.record_error(&model);
        return;
    };

    let generated = handle
        .backend
        .generate(&request.prompt, request.max_tokens, request.temperature)
        .await;

    let mut stream = match generated {
        Ok(stream) => stream,
        Err(error) => {
            warn!(model = %model, request_id = %request.request_id, %error, "backend generate failed");
            streams.fail_stream(&request.request_id, ErrorKind::BackendError).await;
            metrics.record_error(&model);
            return;
        }
    };

    let mut token_count: u64 = 0;
    let mut failed = false;
    while let Some(item) = stream.next().await {
        match item {
            Ok(token) => {
                token_count += 1;
                let outcome = streams.push_token(&request.request_id, token).await;
                if !matches!(outcome, crate::stream::PushOutcome::Pushed) {
                    break;
                }
            }
            Err(error) => {
                warn!(model = %model, request_id = %request.request_id, %error, "backend stream error");
                streams.fail_stream(&request.request_id, ErrorKind::BackendError).await;
                failed = true;
                break;
            }
        }
    }

    streams.close_stream(&request.request_id).await;
    handle.record_usage(token_count);
    metrics.record_request(&model, started.elapsed(), failed, token_count);
}
