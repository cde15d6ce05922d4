//! Coordinates the two independent buckets a request is charged against
//! (spec §4.J): a resource bucket keyed by `(method, host, canonicalPath)`
//! and an IP bucket keyed by the canonical client address. Predictive
//! consumption happens before the handler runs; corrective adjustment
//! happens after the response completes and never delays it.

use std::collections::HashMap;
use std::sync::Arc;

use common::config::{BucketConfig, RateLimiterConfig};
use common::error::{AppError, RateLimitKind};
use parking_lot::Mutex;
use tracing::warn;

use crate::store::{BucketParams, BucketStore};

fn ceil_div_1024(bytes: u64) -> u64 {
    bytes.saturating_add(1023) / 1024
}

fn bucket_params(bucket: &BucketConfig, ttl_seconds: u64) -> BucketParams {
    BucketParams {
        capacity: bucket.capacity,
        refill_rate_per_sec: bucket.refill_rate_per_sec,
        ttl_seconds,
    }
}

/// What the predictive phase consumed, carried forward to the corrective
/// phase once the actual response size is known.
#[derive(Debug, Clone)]
pub struct PredictiveDecision {
    pub resource_key: String,
    pub ip_key: String,
    pub resource_consumed: u64,
    pub ip_consumed: u64,
}

#[derive(Debug, Clone)]
pub enum PredictiveResult {
    Allowed(PredictiveDecision),
    Blocked {
        kind: RateLimitKind,
        bytes_blocked: Option<u64>,
    },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DomainCounters {
    pub requests_total: u64,
    pub exceeded_resource_total: u64,
    pub exceeded_ip_total: u64,
    pub bytes_blocked_total: u64,
}

/// `rate_limit_requests_total{domain}` / `rate_limit_exceeded_total
/// {limit_type, domain}` / `rate_limit_bytes_blocked_total{domain}` (spec
/// §4.J "Metrics"), broken out per domain.
#[derive(Debug, Default)]
pub struct RateLimiterMetrics {
    domains: Mutex<HashMap<String, DomainCounters>>,
}

impl RateLimiterMetrics {
    pub fn snapshot(&self, domain: &str) -> DomainCounters {
        self.domains.lock().get(domain).copied().unwrap_or_default()
    }

    fn record_request(&self, domain: &str) {
        self.domains.lock().entry(domain.to_string()).or_default().requests_total += 1;
    }

    fn record_exceeded(&self, domain: &str, kind: RateLimitKind) {
        let mut domains = self.domains.lock();
        let counters = domains.entry(domain.to_string()).or_default();
        match kind {
            RateLimitKind::Resource => counters.exceeded_resource_total += 1,
            RateLimitKind::Ip => counters.exceeded_ip_total += 1,
        }
    }

    fn record_bytes_blocked(&self, domain: &str, bytes: u64) {
        let mut domains = self.domains.lock();
        let counters = domains.entry(domain.to_string()).or_default();
        counters.bytes_blocked_total = counters.bytes_blocked_total.saturating_add(bytes);
    }
}

/// Drives the predictive/corrective accounting over an injected
/// `BucketStore` (spec §4.J).
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    config: RateLimiterConfig,
    pub metrics: Arc<RateLimiterMetrics>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn BucketStore>, config: RateLimiterConfig) -> Self {
        Self {
            store,
            config,
            metrics: Arc::new(RateLimiterMetrics::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// spec §4.J steps 2-3: predictive resource consumption, then predictive
    /// IP consumption with rollback of the resource bucket on IP failure.
    /// When the limiter is disabled, returns an `Allowed` decision that
    /// consumed nothing, so the corrective phase has somewhere to no-op
    /// into (spec step 2 parenthetical: "or if limits disabled, pass
    /// through with no consumption").
    pub async fn predictive(
        &self,
        resource_key: &str,
        ip_key: &str,
        domain: &str,
    ) -> Result<PredictiveResult, AppError> {
        self.metrics.record_request(domain);

        if !self.config.enabled {
            return Ok(PredictiveResult::Allowed(PredictiveDecision {
                resource_key: resource_key.to_string(),
                ip_key: ip_key.to_string(),
                resource_consumed: 0,
                ip_consumed: 0,
            }));
        }

        let resource_params = bucket_params(&self.config.resource_bucket, self.config.bucket_ttl_seconds);
        let resource_outcome = self.store.consume(resource_key, 1, resource_params, None).await?;

        if !resource_outcome.allowed {
            self.metrics.record_exceeded(domain, RateLimitKind::Resource);
            let cached = self.store.cached_content_length(resource_key).await?;
            if let Some(len) = cached {
                self.metrics.record_bytes_blocked(domain, len);
            }
            return Ok(PredictiveResult::Blocked {
                kind: RateLimitKind::Resource,
                bytes_blocked: cached,
            });
        }

        let cached_len = self.store.cached_content_length(resource_key).await?;
        let actual = cached_len.filter(|&len| len > 0).map(ceil_div_1024).unwrap_or(1);

        let ip_params = bucket_params(&self.config.ip_bucket, self.config.bucket_ttl_seconds);
        let ip_amount = i64::try_from(actual).unwrap_or(i64::MAX);
        let ip_outcome = self.store.consume(ip_key, ip_amount, ip_params, None).await?;

        if !ip_outcome.allowed {
            if let Err(e) = self.store.consume(resource_key, -1, resource_params, None).await {
                warn!(error = %e, "failed to roll back resource bucket after IP bucket rejection");
            }
            self.metrics.record_exceeded(domain, RateLimitKind::Ip);
            return Ok(PredictiveResult::Blocked {
                kind: RateLimitKind::Ip,
                bytes_blocked: None,
            });
        }

        Ok(PredictiveResult::Allowed(PredictiveDecision {
            resource_key: resource_key.to_string(),
            ip_key: ip_key.to_string(),
            resource_consumed: 1,
            ip_consumed: actual,
        }))
    }

    /// spec §4.J step 5: corrective adjustment once the actual response
    /// size is known. Both adjustments run concurrently; either may fail
    /// without rolling back the other.
    pub async fn corrective(&self, decision: &PredictiveDecision, observed_bytes: u64) {
        if !self.config.enabled || (decision.resource_consumed == 0 && decision.ip_consumed == 0) {
            return;
        }

        let needed = ceil_div_1024(observed_bytes).max(1);
        let needed_signed = i64::try_from(needed).unwrap_or(i64::MAX);
        let resource_adj = needed_signed.saturating_sub(i64::try_from(decision.resource_consumed).unwrap_or(i64::MAX));
        let ip_adj = needed_signed.saturating_sub(i64::try_from(decision.ip_consumed).unwrap_or(i64::MAX));

        let resource_params = bucket_params(&self.config.resource_bucket, self.config.bucket_ttl_seconds);
        let ip_params = bucket_params(&self.config.ip_bucket, self.config.bucket_ttl_seconds);

        let resource_fut = async {
            if resource_adj == 0 {
                if let Err(e) = self.store.record_content_length(&decision.resource_key, observed_bytes).await {
                    warn!(error = %e, "failed to record observed content length");
                }
            } else if let Err(e) = self
                .store
                .consume(&decision.resource_key, resource_adj, resource_params, Some(observed_bytes))
                .await
            {
                warn!(error = %e, "resource bucket corrective adjustment failed");
            }
        };

        let ip_fut = async {
            if ip_adj != 0 {
                if let Err(e) = self.store.consume(&decision.ip_key, ip_adj, ip_params, None).await {
                    warn!(error = %e, "ip bucket corrective adjustment failed");
                }
            }
        };

        futures::join!(resource_fut, ip_fut);
    }
}
