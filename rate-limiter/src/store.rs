//! The `BucketStore` seam (spec §4.J, §6): an atomic "refill then
//! conditionally consume" operation against whatever shared store backs the
//! buckets. `memory` and `redis_store` are the two concrete implementations.

use async_trait::async_trait;
use common::error::AppError;

/// Capacity/refill tunables for one bucket axis, plus the TTL an idle
/// bucket is allowed to sit for before the store may forget it.
#[derive(Debug, Clone, Copy)]
pub struct BucketParams {
    pub capacity: u64,
    pub refill_rate_per_sec: f64,
    pub ttl_seconds: u64,
}

/// Result of one atomic consume call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    pub tokens_remaining: f64,
}

/// Atomically refills a named bucket from elapsed time, then attempts to
/// subtract `amount` tokens (spec §4.J "Atomic bucket get-or-create-and-
/// consume"). A non-positive `amount` always succeeds — it models a
/// rollback or a corrective refund, never a gate.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn consume(
        &self,
        key: &str,
        amount: i64,
        params: BucketParams,
        content_length: Option<u64>,
    ) -> Result<ConsumeOutcome, AppError>;

    /// Records the observed response size against the bucket's cached
    /// `contentLength` hint without touching its token count (spec §4.J
    /// step 5: "the resource bucket learns the observed contentLength").
    async fn record_content_length(&self, key: &str, content_length: u64) -> Result<(), AppError>;

    /// The cached `contentLength` hint, if any (spec §4.J step 2).
    async fn cached_content_length(&self, key: &str) -> Result<Option<u64>, AppError>;
}
