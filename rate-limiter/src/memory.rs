//! Single-process `BucketStore` (spec §6: "in-memory reference
//! implementation"). Bucket state is not shared across replicas; use
//! `redis_store::RedisBucketStore` for that.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use common::error::AppError;
use parking_lot::Mutex;

use crate::store::{BucketParams, BucketStore, ConsumeOutcome};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    content_length: Option<u64>,
}

/// `parking_lot::Mutex`-guarded `HashMap`, matching this workspace's
/// established idiom for shared in-process state.
#[derive(Default)]
pub struct InMemoryBucketStore {
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn consume(
        &self,
        key: &str,
        amount: i64,
        params: BucketParams,
        content_length: Option<u64>,
    ) -> Result<ConsumeOutcome, AppError> {
        let mut buckets = self.buckets.lock();
        let now = Instant::now();
        let state = buckets.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: params.capacity as f64,
            last_refill: now,
            content_length: None,
        });

        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * params.refill_rate_per_sec).min(params.capacity as f64);
        state.last_refill = now;

        let allowed = amount <= 0 || state.tokens >= amount as f64;
        if allowed {
            state.tokens -= amount as f64;
        }
        if let Some(len) = content_length {
            state.content_length = Some(len);
        }

        Ok(ConsumeOutcome {
            allowed,
            tokens_remaining: state.tokens,
        })
    }

    async fn record_content_length(&self, key: &str, content_length: u64) -> Result<(), AppError> {
        let mut buckets = self.buckets.lock();
        let state = buckets.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: 0.0,
            last_refill: Instant::now(),
            content_length: None,
        });
        state.content_length = Some(content_length);
        Ok(())
    }

    async fn cached_content_length(&self, key: &str) -> Result<Option<u64>, AppError> {
        Ok(self.buckets.lock().get(key).and_then(|s| s.content_length))
    }
}
