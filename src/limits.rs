use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    time::Instant,
};

use tokio::sync::Mutex;

use crate::types::read_env_u64;

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens_available: f64,
    last_refill: Instant,
}

impl Bucket {
    fn fresh(capacity: f64, now: Instant) -> Self {
        Self {
            tokens_available: capacity,
            last_refill: now,
        }
    }
}

/// Per-client token bucket, capacity `C = tokens_per_minute`, refilled continuously at `C/60`
/// tokens/sec. The bucket map is sharded by a hash of `client_id` so that concurrent clients do
/// not serialize on one lock; each shard is still a single mutex, which is sufficient per-shard
/// contention.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    shards: Vec<Mutex<HashMap<String, Bucket>>>,
}

impl RateLimiter {
    pub fn new(tokens_per_minute: u64) -> Self {
        let capacity = tokens_per_minute.max(1) as f64;
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            shards,
        }
    }

    pub fn from_env() -> Self {
        Self::new(read_env_u64("GATEWAY_RATE_LIMIT_PER_MINUTE", 6000))
    }

    fn shard_for(&self, client_id: &str) -> &Mutex<HashMap<String, Bucket>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        client_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Refills, then admits or denies `cost` tokens for `client_id`. Unknown clients start with a
    /// full bucket, so the first call for any client always succeeds (cost permitting).
    pub async fn check(&self, client_id: &str, cost: f64) -> Admission {
        let now = Instant::now();
        let shard = self.shard_for(client_id);
        let mut buckets = shard.lock().await;
        let bucket = buckets
            .entry(client_id.to_owned())
            .or_insert_with(|| Bucket::fresh(self.capacity, now));

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens_available =
            (bucket.tokens_available + elapsed * self.refill_per_sec).clamp(0.0, self.capacity);
        bucket.last_refill = now;

        if bucket.tokens_available >= cost {
            bucket.tokens_available -= cost;
            Admission::Allowed
        } else {
            Admission::Denied
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_call_for_unknown_client_always_succeeds() {
        let limiter = RateLimiter::new(60);
        assert_eq!(limiter.check("client-a", 1.0).await, Admission::Allowed);
    }

    #[tokio::test]
    async fn denies_once_capacity_is_exhausted() {
        let limiter = RateLimiter::new(60);
        for _ in 0..60 {
            assert_eq!(limiter.check("client-b", 1.0).await, Admission::Allowed);
        }
        assert_eq!(limiter.check("client-b", 1.0).await, Admission::Denied);
    }

    #[tokio::test]
    async fn clients_are_independent() {
        let limiter = RateLimiter::new(1);
        assert_eq!(limiter.check("client-c", 1.0).await, Admission::Allowed);
        assert_eq!(limiter.check("client-c", 1.0).await, Admission::Denied);
        assert_eq!(limiter.check("client-d", 1.0).await, Admission::Allowed);
    }
}
