//! Distributed two-axis token-bucket rate limiter (spec §4.J): a resource
//! bucket keyed by `(method, host, canonicalPath)` and an IP bucket keyed by
//! the canonical client address, each backed by an atomic get-or-create-
//! and-consume operation against a shared `BucketStore`.

pub mod key;
pub mod limiter;
pub mod memory;
pub mod middleware;
pub mod redis_store;
pub mod store;

pub use limiter::{PredictiveDecision, PredictiveResult, RateLimiter, RateLimiterMetrics};
pub use middleware::{rate_limit_layer, RateLimitState};
pub use store::{BucketParams, BucketStore, ConsumeOutcome};
