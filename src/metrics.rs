use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

/// Bound on the per-model latency sample window; enough for stable p99s without unbounded
/// memory growth on long-lived models.
const LATENCY_WINDOW: usize = 2048;

struct ModelMetrics {
    created_at: Instant,
    request_count: AtomicU64,
    error_count: AtomicU64,
    timeout_count: AtomicU64,
    total_tokens: AtomicU64,
    latencies_ms: Mutex<VecDeque<f64>>,
}

impl ModelMetrics {
    fn new() -> Self {
        Self {
            created_at: Instant::now(),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyStats {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl LatencyStats {
    fn from_samples(samples: &mut [f64]) -> Self {
        if samples.is_empty() {
            return Self {
                p50: 0.0,
                p95: 0.0,
                p99: 0.0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
            };
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let len = samples.len();
        let percentile = |p: f64| -> f64 {
            let rank = ((p * (len as f64 - 1.0)).round()) as usize;
            samples[rank.min(len - 1)]
        };
        let mean = samples.iter().sum::<f64>() / len as f64;

        Self {
            p50: percentile(0.50),
            p95: percentile(0.95),
            p99: percentile(0.99),
            min: samples[0],
            max: samples[len - 1],
            mean,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetricsSnapshot {
    pub request_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub total_tokens: u64,
    pub latency_ms: LatencyStats,
    pub throughput_tokens_per_sec: f64,
}

/// Per-model counters and a bounded latency sample window, rendered as the JSON `/metrics`
/// contract. `throughput_tokens_per_sec` is `total_tokens / elapsed_seconds` — the source system
/// this was modeled on divided by a millisecond value there, which is corrected here.
pub struct MetricsCollector {
    per_model: RwLock<HashMap<String, Arc<ModelMetrics>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            per_model: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, model: &str) -> Arc<ModelMetrics> {
        if let Some(existing) = self.per_model.read().await.get(model) {
            return existing.clone();
        }
        let mut guard = self.per_model.write().await;
        guard
            .entry(model.to_owned())
            .or_insert_with(|| Arc::new(ModelMetrics::new()))
            .clone()
    }

    pub async fn record_request(&self, model: &str, latency: Duration, is_error: bool, tokens: u64) {
        let entry = self.entry(model).await;
        entry.request_count.fetch_add(1, Ordering::Relaxed);
        if is_error {
            entry.error_count.fetch_add(1, Ordering::Relaxed);
        }
        entry.total_tokens.fetch_add(tokens, Ordering::Relaxed);

        let mut latencies = entry.latencies_ms.lock().await;
        if latencies.len() >= LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(latency.as_secs_f64() * 1000.0);
    }

    pub async fn record_error(&self, model: &str) {
        let entry = self.entry(model).await;
        entry.request_count.fetch_add(1, Ordering::Relaxed);
        entry.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn record_timeout(&self, model: &str) {
        let entry = self.entry(model).await;
        entry.request_count.fetch_add(1, Ordering::Relaxed);
        entry.error_count.fetch_add(1, Ordering::Relaxed);
        entry.timeout_count.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn snapshot(&self, model: &str) -> Option<ModelMetricsSnapshot> {
        let entry = self.per_model.read().await.get(model).cloned()?;
        Some(render_snapshot(&entry).await)
    }

    pub async fn snapshot_all(&self) -> HashMap<String, ModelMetricsSnapshot> {
        let models: Vec<(String, Arc<ModelMetrics>)> = self
            .per_model
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();

        let mut out = HashMap::with_capacity(models.len());
        for (name, entry) in models {
            out.insert(name, render_snapshot(&entry).await);
        }
        out
    }
}

async fn render_snapshot(entry: &ModelMetrics) -> ModelMetricsSnapshot {
    let request_count = entry.request_count.load(Ordering::Relaxed);
    let error_count = entry.error_count.load(Ordering::Relaxed);
    let total_tokens = entry.total_tokens.load(Ordering::Relaxed);
    let elapsed_seconds = entry.created_at.elapsed().as_secs_f64();

    let mut samples: Vec<f64> = entry.latencies_ms.lock().await.iter().copied().collect();

    ModelMetricsSnapshot {
        request_count,
        error_count,
        error_rate: if request_count > 0 {
            error_count as f64 / request_count as f64
        } else {
            0.0
        },
        total_tokens,
        latency_ms: LatencyStats::from_samples(&mut samples),
        throughput_tokens_per_sec: if elapsed_seconds > 0.0 {
            total_tokens as f64 / elapsed_seconds
        } else {
            0.0
        },
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_model_has_no_snapshot() {
        let metrics = MetricsCollector::new();
        assert!(metrics.snapshot("ghost").await.is_none());
    }

    #[tokio::test]
    async fn error_rate_and_throughput_are_computed_from_elapsed_seconds() {
        let metrics = MetricsCollector::new();
        metrics.record_request("gpt2", Duration::from_millis(100), false, 50).await;
        metrics.record_request("gpt2", Duration::from_millis(50), true, 25).await;

        let snapshot = metrics.snapshot("gpt2").await.unwrap();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.error_count, 1);
        assert!((snapshot.error_rate - 0.5).abs() < 1e-9);
        assert_eq!(snapshot.total_tokens, 75);
        assert!(snapshot.throughput_tokens_per_sec > 0.0);
        assert!(snapshot.latency_ms.max >= snapshot.latency_ms.min);
    }

    #[tokio::test]
    async fn timeout_counts_as_both_request_and_error() {
        let metrics = MetricsCollector::new();
        metrics.record_timeout("gpt2").await;
        let snapshot = metrics.snapshot("gpt2").await.unwrap();
        assert_eq!(snapshot.request_count, 1);
        assert_eq!(snapshot.error_count, 1);
    }
}
