use std::{
    collections::HashMap,
    sync::{atomic::AtomicUsize, Arc},
    time::Duration,
};

use tokio::sync::RwLock;
use tracing::info;

use crate::{
    errors::AppError,
    limits::RateLimiter,
    metrics::MetricsCollector,
    registry::{ModelLoader, ModelRegistry},
    scheduler::BatchScheduler,
    stream::StreamManager,
    types::{BatchConfig, ModelConfig, ServerConfig},
    worker,
};

/// Composes the four core subsystems plus one scheduler/worker pair per registered model.
/// Cloning `AppState` is cheap: every field is an `Arc` or an `Arc`-wrapped lock.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub streams: Arc<StreamManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricsCollector>,
    pub config: ServerConfig,
    pub batch_config: BatchConfig,
    schedulers: Arc<RwLock<HashMap<String, Arc<BatchScheduler>>>>,
    workers: Arc<RwLock<HashMap<String, tokio::task::JoinHandle<()>>>>,
    pub active_connections: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(config: ServerConfig, batch_config: BatchConfig) -> Self {
        Self {
            registry: Arc::new(ModelRegistry::new()),
            streams: Arc::new(StreamManager::new(config.request_timeout, 64)),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit_per_minute)),
            metrics: Arc::new(MetricsCollector::new()),
            config,
            batch_config,
            schedulers: Arc::new(RwLock::new(HashMap::new())),
            workers: Arc::new(RwLock::new(HashMap::new())),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Registers a loader, loads `config` into the registry, and — the first time this model
    /// name is seen — spins up its scheduler and worker supervisor.
    pub async fn register_model(
        &self,
        config: ModelConfig,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<(), AppError> {
        let name = config.name.clone();
        self.registry.register_loader(&name, loader).await;
        self.registry.load_model(config).await?;

        let mut schedulers = self.schedulers.write().await;
        if !schedulers.contains_key(&name) {
            let scheduler = BatchScheduler::new(name.clone(), self.batch_config);
            let handle = worker::spawn(
                name.clone(),
                scheduler.clone(),
                self.registry.clone(),
                self.streams.clone(),
                self.metrics.clone(),
            );
            schedulers.insert(name.clone(), scheduler);
            self.workers.write().await.insert(name.clone(), handle);
            info!(model = %name, "scheduler and worker registered");
        }
        Ok(())
    }

    pub async fn scheduler_for(&self, model: &str) -> Option<Arc<BatchScheduler>> {
        self.schedulers.read().await.get(model).cloned()
    }

    pub async fn scheduler_stats(&self) -> Vec<crate::scheduler::SchedulerStats> {
        let schedulers = self.schedulers.read().await;
        let mut stats = Vec::with_capacity(schedulers.len());
        for scheduler in schedulers.values() {
            stats.push(scheduler.stats().await);
        }
        stats
    }

    /// Waits for active streams to finish naturally (polled, bounded by
    /// `graceful_shutdown_timeout`), force-closes whatever remains, closes every scheduler
    /// (workers exit once their queues empty), then unloads all models.
    pub async fn shutdown(&self) {
        self.drain_streams(self.config.graceful_shutdown_timeout).await;
        self.streams.shutdown().await;

        let schedulers: Vec<Arc<BatchScheduler>> = self.schedulers.read().await.values().cloned().collect();
        for scheduler in &schedulers {
            scheduler.close();
        }

        let workers: Vec<tokio::task::JoinHandle<()>> =
            std::mem::take(&mut *self.workers.write().await).into_values().collect();
        for handle in workers {
            let _ = handle.await;
        }

        self.registry.shutdown().await;
    }

    /// Polls `active_streams()` every 100ms until it reaches zero or `timeout` elapses, giving
    /// in-flight requests a chance to finish before `shutdown` force-closes whatever is left.
    async fn drain_streams(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.streams.active_streams().await > 0 {
            if tokio::time::Instant::now() >= deadline {
                info!("graceful shutdown timed out waiting for streams to drain");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

