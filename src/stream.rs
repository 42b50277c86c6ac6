use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::{
    errors::{AppError, ErrorKind},
    types::{StreamEvent, StreamToken},
};

const BACKPRESSURE_WAIT: Duration = Duration::from_secs(1);
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    Closed,
    Dropped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub stream_id: String,
    pub elapsed_seconds: f64,
    pub token_count: u64,
    pub tokens_per_second: f64,
    pub backpressure_events: u64,
    pub is_closed: bool,
}

struct StreamEntry {
    sender: mpsc::Sender<StreamEvent>,
    closed: Mutex<bool>,
    created_at: Instant,
    last_token_at: Mutex<Instant>,
    token_count: AtomicU64,
    backpressure_events: AtomicU64,
}

/// Per-request bounded token pipe from a model worker to a response writer.
///
/// The manager's outer map is a concurrent `RwLock<HashMap>`; each stream additionally holds its
/// own `closed` mutex so that the "check closed, then push" sequence is atomic without forcing all
/// streams through one lock.
pub struct StreamManager {
    buffer_size: usize,
    default_timeout: Duration,
    streams: Arc<RwLock<HashMap<String, Arc<StreamEntry>>>>,
}

/// A lazy, finite sequence yielding `Data`/`End`/`Error` on demand — never a language-specific
/// iterator or generator, so it crosses the HTTP boundary (SSE, unary accumulation) unchanged.
pub struct StreamConsumer {
    id: String,
    receiver: mpsc::Receiver<StreamEvent>,
    timeout: Duration,
    entry: Arc<StreamEntry>,
    streams: Arc<RwLock<HashMap<String, Arc<StreamEntry>>>>,
    ended: bool,
}

impl StreamManager {
    pub fn new(default_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            buffer_size,
            default_timeout,
            streams: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn create_stream(
        &self,
        stream_id: &str,
        timeout: Option<Duration>,
    ) -> Result<StreamConsumer, AppError> {
        let mut streams = self.streams.write().await;
        if streams.contains_key(stream_id) {
            return Err(AppError::StreamExists(stream_id.to_owned()));
        }

        let (sender, receiver) = mpsc::channel(self.buffer_size.max(1));
        let entry = Arc::new(StreamEntry {
            sender,
            closed: Mutex::new(false),
            created_at: Instant::now(),
            last_token_at: Mutex::new(Instant::now()),
            token_count: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
        });
        streams.insert(stream_id.to_owned(), entry.clone());
        debug!(stream_id, "created stream");

        Ok(StreamConsumer {
            id: stream_id.to_owned(),
            receiver,
            timeout: timeout.unwrap_or(self.default_timeout),
            entry,
            streams: self.streams.clone(),
            ended: false,
        })
    }

    /// Pushes a token, waiting up to one second on a full buffer before giving up. A timed-out
    /// push closes the stream and increments `backpressure_events`; further pushes to that id
    /// observe `Closed`.
    pub async fn push_token(&self, stream_id: &str, token: StreamToken) -> PushOutcome {
        let Some(entry) = self.streams.read().await.get(stream_id).cloned() else {
            return PushOutcome::Dropped;
        };

        let mut closed = entry.closed.lock().await;
        if *closed {
            return PushOutcome::Closed;
        }

        match entry.sender.try_send(StreamEvent::Data(token)) {
            Ok(()) => {
                drop(closed);
                self.record_push(&entry).await;
                PushOutcome::Pushed
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(stream_id, "backpressure, waiting for capacity");
                entry.backpressure_events.fetch_add(1, Ordering::Relaxed);
                match tokio::time::timeout(BACKPRESSURE_WAIT, entry.sender.send(event)).await {
                    Ok(Ok(())) => {
                        drop(closed);
                        self.record_push(&entry).await;
                        PushOutcome::Pushed
                    }
                    _ => {
                        *closed = true;
                        drop(closed);
                        self.schedule_removal(stream_id.to_owned());
                        PushOutcome::Dropped
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                *closed = true;
                PushOutcome::Closed
            }
        }
    }

    /// Pushes a terminal `Error(kind)` event and immediately closes the stream. Used by the
    /// worker supervisor for per-request timeouts and backend failures.
    pub async fn fail_stream(&self, stream_id: &str, kind: ErrorKind) {
        let Some(entry) = self.streams.read().await.get(stream_id).cloned() else {
            return;
        };
        let mut closed = entry.closed.lock().await;
        if *closed {
            return;
        }
        let _ = entry.sender.try_send(StreamEvent::Error(kind));
        *closed = true;
        drop(closed);
        self.schedule_removal(stream_id.to_owned());
    }

    async fn record_push(&self, entry: &StreamEntry) {
        entry.token_count.fetch_add(1, Ordering::Relaxed);
        *entry.last_token_at.lock().await = Instant::now();
    }

    /// Marks the stream closed, drains nothing further (the channel carries any buffered events
    /// through to the consumer), and schedules metadata removal after a grace window.
    ///
    /// Schedules removal unconditionally, even if something else (e.g. a dropped
    /// `StreamConsumer`) already flipped `closed` — removal is the only path that ever evicts an
    /// entry from `streams`, so it must not be skipped just because the entry was already marked
    /// closed by someone else.
    pub async fn close_stream(&self, stream_id: &str) {
        let Some(entry) = self.streams.read().await.get(stream_id).cloned() else {
            return;
        };
        let mut closed = entry.closed.lock().await;
        let already_closed = *closed;
        *closed = true;
        drop(closed);
        if !already_closed {
            debug!(
                stream_id,
                tokens = entry.token_count.load(Ordering::Relaxed),
                backpressure_events = entry.backpressure_events.load(Ordering::Relaxed),
                "closing stream"
            );
        }
        self.schedule_removal(stream_id.to_owned());
    }

    /// Removes the stream's metadata after the grace window, independent of whether `self` (the
    /// manager) is still reachable from the caller's stack frame by that point.
    fn schedule_removal(&self, stream_id: String) {
        spawn_removal(self.streams.clone(), stream_id);
    }

    pub async fn cleanup_idle_streams(&self, idle_timeout: Duration) -> usize {
        let ids: Vec<String> = {
            let streams = self.streams.read().await;
            let mut idle = Vec::new();
            for (id, entry) in streams.iter() {
                if *entry.closed.lock().await {
                    continue;
                }
                if entry.last_token_at.lock().await.elapsed() > idle_timeout {
                    idle.push(id.clone());
                }
            }
            idle
        };

        for id in &ids {
            self.close_stream(id).await;
        }
        ids.len()
    }

    pub async fn active_streams(&self) -> usize {
        let streams = self.streams.read().await;
        let mut count = 0;
        for entry in streams.values() {
            if !*entry.closed.lock().await {
                count += 1;
            }
        }
        count
    }

    pub async fn stream_stats(&self, stream_id: &str) -> Option<StreamStats> {
        let entry = self.streams.read().await.get(stream_id).cloned()?;
        let elapsed = entry.created_at.elapsed().as_secs_f64();
        let token_count = entry.token_count.load(Ordering::Relaxed);
        Some(StreamStats {
            stream_id: stream_id.to_owned(),
            elapsed_seconds: elapsed,
            token_count,
            tokens_per_second: if elapsed > 0.0 {
                token_count as f64 / elapsed
            } else {
                0.0
            },
            backpressure_events: entry.backpressure_events.load(Ordering::Relaxed),
            is_closed: *entry.closed.lock().await,
        })
    }

    /// Closes every stream, used by graceful shutdown after the drain window elapses.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.streams.read().await.keys().cloned().collect();
        for id in ids {
            self.close_stream(&id).await;
        }
    }
}

/// Removes `stream_id` from `streams` after the grace window. Shared by `StreamManager` (closed
/// via `close_stream`/`fail_stream`) and `StreamConsumer::drop` (closed via client disconnect) so
/// every path that marks a stream closed also guarantees its metadata eventually gets removed.
fn spawn_removal(streams: Arc<RwLock<HashMap<String, Arc<StreamEntry>>>>, stream_id: String) {
    tokio::spawn(async move {
        tokio::time::sleep(CLOSE_GRACE_PERIOD).await;
        streams.write().await.remove(&stream_id);
    });
}

impl StreamConsumer {
    /// Yields the next event: `Data`, a terminal `Error`, or `End` once the producer closes the
    /// stream cleanly or no event arrives within the stream's configured inter-token timeout.
    /// Finite: once `End` or `Error` is returned, every subsequent call returns `End` again.
    pub async fn next_event(&mut self) -> StreamEvent {
        if self.ended {
            return StreamEvent::End;
        }

        match tokio::time::timeout(self.timeout, self.receiver.recv()).await {
            Ok(Some(StreamEvent::Error(kind))) => {
                self.ended = true;
                StreamEvent::Error(kind)
            }
            Ok(Some(event)) => event,
            Ok(None) => {
                self.ended = true;
                StreamEvent::End
            }
            Err(_) => {
                self.ended = true;
                StreamEvent::Error(ErrorKind::StreamTimeout)
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        // Client disconnect (consumer dropped) must close the stream; since `close_stream` is
        // async we only flip the flag here. Removal is scheduled unconditionally, mirroring
        // `close_stream`, so a consumer dropped before the producer ever calls `close_stream`
        // doesn't leak its `StreamEntry` forever.
        if let Ok(mut closed) = self.entry.closed.try_lock() {
            *closed = true;
        }
        spawn_removal(self.streams.clone(), self.id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(id: i64) -> StreamToken {
        StreamToken {
            token: format!("tok{id}"),
            token_id: id,
            logprob: None,
            is_special: false,
        }
    }

    #[tokio::test]
    async fn duplicate_stream_id_fails() {
        let manager = StreamManager::new(Duration::from_secs(5), 4);
        manager.create_stream("s1", None).await.unwrap();
        let error = manager.create_stream("s1", None).await.unwrap_err();
        assert!(matches!(error, AppError::StreamExists(id) if id == "s1"));
    }

    #[tokio::test]
    async fn push_then_consume_preserves_order_and_ends() {
        let manager = StreamManager::new(Duration::from_secs(5), 4);
        let mut consumer = manager.create_stream("s2", None).await.unwrap();

        assert_eq!(manager.push_token("s2", token(1)).await, PushOutcome::Pushed);
        assert_eq!(manager.push_token("s2", token(2)).await, PushOutcome::Pushed);
        manager.close_stream("s2").await;

        let first = consumer.next_event().await;
        let second = consumer.next_event().await;
        let third = consumer.next_event().await;
        assert!(matches!(first, StreamEvent::Data(t) if t.token_id == 1));
        assert!(matches!(second, StreamEvent::Data(t) if t.token_id == 2));
        assert!(matches!(third, StreamEvent::End));
    }

    #[tokio::test]
    async fn fail_stream_yields_terminal_error() {
        let manager = StreamManager::new(Duration::from_secs(5), 4);
        let mut consumer = manager.create_stream("s2e", None).await.unwrap();

        manager.fail_stream("s2e", ErrorKind::BackendError).await;
        let event = consumer.next_event().await;
        assert!(matches!(event, StreamEvent::Error(ErrorKind::BackendError)));
        assert!(matches!(consumer.next_event().await, StreamEvent::End));
    }

    #[tokio::test]
    async fn backpressure_drops_after_one_second_and_closes() {
        let manager = StreamManager::new(Duration::from_secs(5), 2);
        let _consumer = manager.create_stream("s3", None).await.unwrap();

        assert_eq!(manager.push_token("s3", token(1)).await, PushOutcome::Pushed);
        assert_eq!(manager.push_token("s3", token(2)).await, PushOutcome::Pushed);

        let started = Instant::now();
        let outcome = manager.push_token("s3", token(3)).await;
        assert_eq!(outcome, PushOutcome::Dropped);
        assert!(started.elapsed() >= Duration::from_millis(950));

        let stats = manager.stream_stats("s3").await.unwrap();
        assert_eq!(stats.backpressure_events, 1);
        assert!(stats.is_closed);
    }

    #[tokio::test]
    async fn active_streams_tracks_open_count_across_close_grace_window() {
        let manager = StreamManager::new(Duration::from_secs(5), 4);
        manager.create_stream("s4", None).await.unwrap();
        assert_eq!(manager.active_streams().await, 1);

        manager.close_stream("s4").await;
        assert_eq!(manager.active_streams().await, 0);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(manager.stream_stats("s4").await.is_none());
    }
}
