use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::{
    errors::AppError,
    types::{BatchConfig, InferenceRequest, Priority},
};

/// Requests that missed their own deadline while queued, pruned out of the batch in `get_batch`
/// rather than left to linger (see the scheduler's per-request deadline note).
pub struct GetBatchOutcome {
    pub batch: Vec<InferenceRequest>,
    pub timed_out: Vec<InferenceRequest>,
}

#[derive(Default)]
struct Queues {
    high: VecDeque<InferenceRequest>,
    normal: VecDeque<InferenceRequest>,
    low: VecDeque<InferenceRequest>,
}

impl Queues {
    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<InferenceRequest> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn depth(&self) -> [usize; 3] {
        [self.high.len(), self.normal.len(), self.low.len()]
    }

    fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty() && self.low.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub model: String,
    pub total_requests: u64,
    pub total_batches: u64,
    pub avg_wait_ms: f64,
    pub queue_depth_high: usize,
    pub queue_depth_normal: usize,
    pub queue_depth_low: usize,
    pub restart_count: u64,
}

/// Priority-aware dynamic batch scheduler for a single model.
///
/// Three FIFO queues (HIGH, NORMAL, LOW) feed `get_batch`, which greedily drains highest priority
/// first, returns early once `min_batch_size` is met, otherwise waits up to `max_wait_ms` for more
/// arrivals, and finally blocks without a timeout to guarantee at least one request per call.
pub struct BatchScheduler {
    model: String,
    config: BatchConfig,
    queues: Mutex<Queues>,
    notify: Notify,
    closed: AtomicBool,
    total_requests: AtomicU64,
    total_batches: AtomicU64,
    total_wait_ms: AtomicU64,
    batch_counter: AtomicU64,
    restart_count: AtomicU64,
}

impl BatchScheduler {
    pub fn new(model: impl Into<String>, config: BatchConfig) -> Arc<Self> {
        Arc::new(Self {
            model: model.into(),
            config,
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            total_requests: AtomicU64::new(0),
            total_batches: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
            batch_counter: AtomicU64::new(0),
            restart_count: AtomicU64::new(0),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Called by the worker supervisor each time it restarts `model`'s loop after a panic.
    pub fn record_restart(&self) -> u64 {
        self.restart_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Enqueues `request`, never blocking. Fails with `QueueFull` once the scheduler has been
    /// closed (the same error a caller would see under real backpressure).
    pub async fn enqueue(&self, mut request: InferenceRequest) -> Result<(), AppError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::QueueFull(self.model.clone()));
        }

        request.enqueued_at = Some(Instant::now());
        let priority = request.priority;
        {
            let mut queues = self.queues.lock().await;
            queues.queue_mut(priority).push_back(request);
        }
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Collects the next batch. See module docs for the algorithm; honors `dynamic_batching`:
    /// when disabled every call returns exactly `min_batch_size` items (or blocks for them).
    pub async fn get_batch(&self) -> GetBatchOutcome {
        let batch_start = Instant::now();
        let mut batch: Vec<InferenceRequest> = Vec::new();
        let mut timed_out: Vec<InferenceRequest> = Vec::new();
        // With `dynamic_batching = false` callers are expected to set `min_batch_size ==
        // max_batch_size`, so waiting for `min_batch_size` already yields exactly that many items.
        let target = self.config.min_batch_size;

        self.drain_priority_into(&mut batch, &mut timed_out).await;

        if batch.len() >= target {
            self.record_batch(batch_start);
            return GetBatchOutcome { batch, timed_out };
        }

        if self.closed.load(Ordering::Acquire) {
            self.record_batch(batch_start);
            return GetBatchOutcome { batch, timed_out };
        }

        let deadline = batch_start + self.config.max_wait();
        while batch.len() < target {
            let now = Instant::now();
            if now >= deadline || self.closed.load(Ordering::Acquire) {
                break;
            }
            let remaining = deadline - now;

            let notified = self.notify.notified();
            if self.queues_nonempty().await {
                self.drain_priority_into(&mut batch, &mut timed_out).await;
                continue;
            }

            if tokio::time::timeout(remaining, notified).await.is_err() {
                break;
            }
            self.drain_priority_into(&mut batch, &mut timed_out).await;
        }

        if batch.is_empty() && !self.closed.load(Ordering::Acquire) {
            loop {
                let notified = self.notify.notified();
                if self.queues_nonempty().await {
                    self.drain_priority_into(&mut batch, &mut timed_out).await;
                } else {
                    notified.await;
                    self.drain_priority_into(&mut batch, &mut timed_out).await;
                }

                if !batch.is_empty() || self.closed.load(Ordering::Acquire) {
                    break;
                }
            }
        }

        self.record_batch(batch_start);
        GetBatchOutcome { batch, timed_out }
    }

    /// Pending `get_batch` calls observe `closed` and return whatever they already have (possibly
    /// empty); subsequent `enqueue` calls fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn queues_nonempty(&self) -> bool {
        !self.queues.lock().await.is_empty()
    }

    /// Greedy priority drain: HIGH, then NORMAL, then LOW, up to `max_batch_size` total, pruning
    /// any request whose own deadline has already elapsed instead of placing it in the batch.
    async fn drain_priority_into(
        &self,
        batch: &mut Vec<InferenceRequest>,
        timed_out: &mut Vec<InferenceRequest>,
    ) {
        let mut queues = self.queues.lock().await;
        let now = Instant::now();

        for priority in Priority::ALL {
            let queue = queues.queue_mut(priority);
            while batch.len() < self.config.max_batch_size {
                let Some(request) = queue.pop_front() else {
                    break;
                };
                if request_deadline_elapsed(&request, now) {
                    timed_out.push(request);
                    continue;
                }
                batch.push(request);
            }
        }
    }

    fn record_batch(&self, batch_start: Instant) {
        let wait_ms = batch_start.elapsed().as_millis() as u64;
        self.total_wait_ms.fetch_add(wait_ms, Ordering::Relaxed);
        self.total_batches.fetch_add(1, Ordering::Relaxed);
        let count = self.batch_counter.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(model = %self.model, batch = count, wait_ms, "assembled batch");
    }

    pub async fn stats(&self) -> SchedulerStats {
        let depth = self.queues.lock().await.depth();
        let total_batches = self.total_batches.load(Ordering::Relaxed);
        let total_wait_ms = self.total_wait_ms.load(Ordering::Relaxed);
        let avg_wait_ms = if total_batches > 0 {
            total_wait_ms as f64 / total_batches as f64
        } else {
            0.0
        };

        SchedulerStats {
            model: self.model.clone(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_batches,
            avg_wait_ms,
            queue_depth_high: depth[0],
            queue_depth_normal: depth[1],
            queue_depth_low: depth[2],
            restart_count: self.restart_count.load(Ordering::Relaxed),
        }
    }
}

fn request_deadline_elapsed(request: &InferenceRequest, now: Instant) -> bool {
    match request.enqueued_at {
        Some(enqueued_at) => {
            now.duration_since(enqueued_at) > Duration::from_secs_f64(request.timeout_seconds)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatInferRequest;
    use std::collections::HashMap;

    fn request(priority: Priority) -> InferenceRequest {
        let chat = ChatInferRequest {
            model: "mock".to_owned(),
            prompt: "hi".to_owned(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            priority: Some(priority),
            timeout_seconds: Some(5.0),
            client_id: None,
            metadata: HashMap::new(),
        };
        chat.into_request().expect("valid request")
    }

    #[tokio::test]
    async fn priority_wins_within_and_across_batches() {
        let config = BatchConfig::new(2, 1, 0, true).unwrap();
        let scheduler = BatchScheduler::new("mock", config);

        let r1 = request(Priority::Low);
        let r2 = request(Priority::Low);
        let r3 = request(Priority::High);
        let r1_id = r1.request_id.clone();
        let r2_id = r2.request_id.clone();
        let r3_id = r3.request_id.clone();

        scheduler.enqueue(r1).await.unwrap();
        scheduler.enqueue(r2).await.unwrap();
        scheduler.enqueue(r3).await.unwrap();

        let first = scheduler.get_batch().await;
        let first_ids: Vec<_> = first.batch.iter().map(|r| r.request_id.clone()).collect();
        assert_eq!(first_ids, vec![r3_id, r1_id]);

        let second = scheduler.get_batch().await;
        let second_ids: Vec<_> = second.batch.iter().map(|r| r.request_id.clone()).collect();
        assert_eq!(second_ids, vec![r2_id]);
    }

    #[tokio::test]
    async fn batch_floor_waits_then_falls_back_to_minimum_one() {
        let config = BatchConfig::new(4, 3, 100, true).unwrap();
        let scheduler = BatchScheduler::new("mock", config);

        scheduler.enqueue(request(Priority::Normal)).await.unwrap();

        let started = Instant::now();
        let outcome = scheduler.get_batch().await;
        let elapsed = started.elapsed();

        assert_eq!(outcome.batch.len(), 1);
        assert!(elapsed >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn returns_immediately_once_floor_is_met() {
        let config = BatchConfig::new(4, 2, 1000, true).unwrap();
        let scheduler = BatchScheduler::new("mock", config);
        scheduler.enqueue(request(Priority::Normal)).await.unwrap();
        scheduler.enqueue(request(Priority::Normal)).await.unwrap();

        let started = Instant::now();
        let outcome = scheduler.get_batch().await;
        assert_eq!(outcome.batch.len(), 2);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn get_batch_blocks_until_first_arrival() {
        let config = BatchConfig::new(4, 1, 0, true).unwrap();
        let scheduler = BatchScheduler::new("mock", config);

        let scheduler_clone = scheduler.clone();
        let handle = tokio::spawn(async move { scheduler_clone.get_batch().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.enqueue(request(Priority::High)).await.unwrap();

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.batch.len(), 1);
    }

    #[tokio::test]
    async fn close_causes_pending_get_batch_to_return_empty() {
        let config = BatchConfig::new(4, 1, 5_000, true).unwrap();
        let scheduler = BatchScheduler::new("mock", config);

        let scheduler_clone = scheduler.clone();
        let handle = tokio::spawn(async move { scheduler_clone.get_batch().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.close();

        let outcome = handle.await.unwrap();
        assert!(outcome.batch.is_empty());

        let error = scheduler.enqueue(request(Priority::Normal)).await.unwrap_err();
        assert!(matches!(error, AppError::QueueFull(_)));
    }
}
