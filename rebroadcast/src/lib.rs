//! Rebroadcasting chunk source wrapper (spec §4.I). Wraps any
//! `ChunkFetchSource`: delegates the fetch, then registers a fire-and-forget
//! background task that tries to rebroadcast the chunk to the network.
//! The wrapped fetch's result is returned to the caller immediately; the
//! caller never waits on (or sees failures from) the rebroadcast attempt.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chunk_retrieval::{ChunkFetchParams, ChunkFetchSource};
use common::config::RebroadcastConfig as RebroadcastSettings;
use common::error::AppError;
use common::model::Chunk;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Gates how many chunks get rebroadcast per unit time. Implemented by
/// `rate-limiter`'s token bucket in production; a fixed-allowance fake in
/// tests.
#[async_trait]
pub trait TokenBucket: Send + Sync {
    async fn try_remove(&self, count: u32) -> bool;
}

/// Announces a chunk to the network. `broadcast` returns how many peers
/// accepted it.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, payload: Bytes) -> Result<usize, AppError>;
}

/// Why a rebroadcast attempt was skipped without ever reaching the
/// broadcaster (spec §4.I "Rebroadcast decision").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    CacheSourced,
    SourceNotAllowed,
    Deduplicated,
    NoToken,
    ConcurrencySaturated,
}

#[derive(Debug, Default)]
pub struct RebroadcastMetrics {
    pub attempts: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub skipped_cache_sourced: AtomicU64,
    pub skipped_source_not_allowed: AtomicU64,
    pub skipped_deduplicated: AtomicU64,
    pub skipped_no_token: AtomicU64,
    pub skipped_concurrency_saturated: AtomicU64,
}

impl RebroadcastMetrics {
    fn record_skip(&self, reason: SkipReason) {
        let counter = match reason {
            SkipReason::CacheSourced => &self.skipped_cache_sourced,
            SkipReason::SourceNotAllowed => &self.skipped_source_not_allowed,
            SkipReason::Deduplicated => &self.skipped_deduplicated,
            SkipReason::NoToken => &self.skipped_no_token,
            SkipReason::ConcurrencySaturated => &self.skipped_concurrency_saturated,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

fn dedup_key(data_root: &str, relative_offset: u64) -> String {
    format!("{data_root}:{relative_offset}")
}

type DedupMap = Arc<Mutex<LruCache<String, Instant>>>;

pub struct RebroadcastingSource {
    inner: Arc<dyn ChunkFetchSource>,
    broadcaster: Arc<dyn Broadcaster>,
    token_bucket: Arc<dyn TokenBucket>,
    allowed_sources: HashSet<String>,
    dedup_ttl: Duration,
    min_success_count: usize,
    dedup: DedupMap,
    concurrency: Arc<Semaphore>,
    pub metrics: Arc<RebroadcastMetrics>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl RebroadcastingSource {
    pub fn new(
        inner: Arc<dyn ChunkFetchSource>,
        broadcaster: Arc<dyn Broadcaster>,
        token_bucket: Arc<dyn TokenBucket>,
        allowed_sources: HashSet<String>,
        settings: &RebroadcastSettings,
    ) -> Self {
        let capacity = NonZeroUsize::new(settings.dedup_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            broadcaster,
            token_bucket,
            allowed_sources,
            dedup_ttl: Duration::from_secs(settings.dedup_ttl_seconds),
            min_success_count: settings.min_success_count,
            dedup: Arc::new(Mutex::new(LruCache::new(capacity))),
            concurrency: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
            metrics: Arc::new(RebroadcastMetrics::default()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Awaits every background rebroadcast task spawned so far. Exposed for
    /// tests and callers that want a clean shutdown.
    pub async fn drain(&self) {
        let handles = std::mem::take(&mut *self.pending.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// A dedup entry older than the TTL is treated as absent, evicting it
    /// so a later success can re-seed the key.
    fn dedup_contains(&self, key: &str, now: Instant) -> bool {
        let mut dedup = self.dedup.lock();
        match dedup.get(key) {
            Some(inserted) if now.duration_since(*inserted) < self.dedup_ttl => true,
            Some(_) => {
                dedup.pop(key);
                false
            }
            None => false,
        }
    }

    /// spec §4.I "Rebroadcast decision" (the checks knowable synchronously,
    /// before the token bucket is consulted). `None` means proceed.
    fn skip_reason(&self, chunk: &Chunk, key: &str, now: Instant) -> Option<SkipReason> {
        if chunk.source.is_cache() {
            return Some(SkipReason::CacheSourced);
        }
        if !self.allowed_sources.contains(chunk.source.as_str()) {
            return Some(SkipReason::SourceNotAllowed);
        }
        if self.dedup_contains(key, now) {
            return Some(SkipReason::Deduplicated);
        }
        None
    }

    fn spawn_rebroadcast(&self, chunk: Chunk, key: String) {
        if let Some(reason) = self.skip_reason(&chunk, &key, Instant::now()) {
            debug!(?reason, "skipping rebroadcast");
            self.metrics.record_skip(reason);
            return;
        }

        let broadcaster = Arc::clone(&self.broadcaster);
        let token_bucket = Arc::clone(&self.token_bucket);
        let concurrency = Arc::clone(&self.concurrency);
        let metrics = Arc::clone(&self.metrics);
        let dedup = Arc::clone(&self.dedup);
        let min_success_count = self.min_success_count;

        let handle = tokio::spawn(async move {
            if !token_bucket.try_remove(1).await {
                metrics.record_skip(SkipReason::NoToken);
                return;
            }

            let Ok(_permit) = concurrency.try_acquire_owned() else {
                metrics.record_skip(SkipReason::ConcurrencySaturated);
                return;
            };

            metrics.attempts.fetch_add(1, Ordering::Relaxed);
            let payload = match serde_json::to_vec(&chunk) {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) => {
                    warn!(error = %e, "failed to serialize chunk for rebroadcast");
                    metrics.failures.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };

            match broadcaster.broadcast(payload).await {
                Ok(success_count) if success_count >= min_success_count => {
                    metrics.successes.fetch_add(1, Ordering::Relaxed);
                    // Only a success marks the key as seen (spec §4.I).
                    dedup.lock().put(key, Instant::now());
                }
                Ok(success_count) => {
                    debug!(success_count, min_success_count, "rebroadcast below required success count");
                    metrics.failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(error = %e, "rebroadcast attempt failed");
                    metrics.failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        self.pending.lock().push(handle);
    }
}

#[async_trait]
impl ChunkFetchSource for RebroadcastingSource {
    async fn get_chunk_by_any(
        &self,
        params: ChunkFetchParams,
        cancel: &CancellationToken,
    ) -> Result<Chunk, AppError> {
        let chunk = self.inner.get_chunk_by_any(params.clone(), cancel).await?;
        let key = dedup_key(&params.data_root, params.relative_offset);
        self.spawn_rebroadcast(chunk.clone(), key);
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::ChunkSource;
    use std::sync::atomic::AtomicBool;

    struct FixedInner {
        source: ChunkSource,
    }

    #[async_trait]
    impl ChunkFetchSource for FixedInner {
        async fn get_chunk_by_any(
            &self,
            params: ChunkFetchParams,
            _cancel: &CancellationToken,
        ) -> Result<Chunk, AppError> {
            Ok(Chunk {
                hash: Chunk::sha256(b"payload"),
                bytes: Bytes::from_static(b"payload"),
                data_root: [1u8; 32],
                data_size: params.tx_size,
                data_path: vec![0xaa],
                offset: params.relative_offset,
                tx_path: None,
                source: self.source.clone(),
                source_host: None,
            })
        }
    }

    struct AlwaysAllow;

    #[async_trait]
    impl TokenBucket for AlwaysAllow {
        async fn try_remove(&self, _count: u32) -> bool {
            true
        }
    }

    struct NeverAllow;

    #[async_trait]
    impl TokenBucket for NeverAllow {
        async fn try_remove(&self, _count: u32) -> bool {
            false
        }
    }

    struct CountingBroadcaster {
        calls: Arc<AtomicU64>,
        success_count: usize,
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Broadcaster for CountingBroadcaster {
        async fn broadcast(&self, _payload: Bytes) -> Result<usize, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::Internal("broadcast failed".to_string()));
            }
            Ok(self.success_count)
        }
    }

    fn default_settings() -> RebroadcastSettings {
        RebroadcastSettings {
            enabled: true,
            max_concurrent: 4,
            min_success_count: 1,
            dedup_ttl_seconds: 60,
            dedup_capacity: 1000,
            allowed_sources: vec!["ar.io".to_string()],
        }
    }

    fn allowed_sources() -> HashSet<String> {
        ["ar.io".to_string()].into_iter().collect()
    }

    fn params() -> ChunkFetchParams {
        ChunkFetchParams {
            tx_size: 1000,
            absolute_offset: 500,
            data_root: "root-1".to_string(),
            relative_offset: 42,
        }
    }

    #[tokio::test]
    async fn successful_fetch_rebroadcasts_and_never_blocks_the_caller() {
        let calls = Arc::new(AtomicU64::new(0));
        let inner = Arc::new(FixedInner { source: ChunkSource::named("ar.io") });
        let broadcaster = Arc::new(CountingBroadcaster {
            calls: Arc::clone(&calls),
            success_count: 2,
            fail: Arc::new(AtomicBool::new(false)),
        });
        let source = RebroadcastingSource::new(inner, broadcaster, Arc::new(AlwaysAllow), allowed_sources(), &default_settings());

        let chunk = source.get_chunk_by_any(params(), &CancellationToken::new()).await.expect("fetch");
        assert_eq!(chunk.bytes, Bytes::from_static(b"payload"));

        source.drain().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.metrics.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(source.metrics.successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_sourced_chunks_are_never_rebroadcast() {
        let calls = Arc::new(AtomicU64::new(0));
        let inner = Arc::new(FixedInner { source: ChunkSource::cache() });
        let broadcaster = Arc::new(CountingBroadcaster {
            calls: Arc::clone(&calls),
            success_count: 1,
            fail: Arc::new(AtomicBool::new(false)),
        });
        let source = RebroadcastingSource::new(inner, broadcaster, Arc::new(AlwaysAllow), allowed_sources(), &default_settings());

        source.get_chunk_by_any(params(), &CancellationToken::new()).await.expect("fetch");
        source.drain().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(source.metrics.skipped_cache_sourced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disallowed_source_is_skipped() {
        let inner = Arc::new(FixedInner { source: ChunkSource::named("untrusted-peer") });
        let calls = Arc::new(AtomicU64::new(0));
        let broadcaster = Arc::new(CountingBroadcaster {
            calls: Arc::clone(&calls),
            success_count: 1,
            fail: Arc::new(AtomicBool::new(false)),
        });
        let source = RebroadcastingSource::new(inner, broadcaster, Arc::new(AlwaysAllow), allowed_sources(), &default_settings());

        source.get_chunk_by_any(params(), &CancellationToken::new()).await.expect("fetch");
        source.drain().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(source.metrics.skipped_source_not_allowed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_fetch_of_same_key_dedups_after_a_success() {
        let calls = Arc::new(AtomicU64::new(0));
        let inner = Arc::new(FixedInner { source: ChunkSource::named("ar.io") });
        let broadcaster = Arc::new(CountingBroadcaster {
            calls: Arc::clone(&calls),
            success_count: 1,
            fail: Arc::new(AtomicBool::new(false)),
        });
        let source = RebroadcastingSource::new(inner, broadcaster, Arc::new(AlwaysAllow), allowed_sources(), &default_settings());

        source.get_chunk_by_any(params(), &CancellationToken::new()).await.expect("fetch");
        source.drain().await;
        source.get_chunk_by_any(params(), &CancellationToken::new()).await.expect("fetch");
        source.drain().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.metrics.skipped_deduplicated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_failed_broadcast_does_not_populate_the_dedup_entry() {
        let calls = Arc::new(AtomicU64::new(0));
        let fail = Arc::new(AtomicBool::new(true));
        let inner = Arc::new(FixedInner { source: ChunkSource::named("ar.io") });
        let broadcaster = Arc::new(CountingBroadcaster {
            calls: Arc::clone(&calls),
            success_count: 1,
            fail: Arc::clone(&fail),
        });
        let source = RebroadcastingSource::new(inner, broadcaster, Arc::new(AlwaysAllow), allowed_sources(), &default_settings());

        source.get_chunk_by_any(params(), &CancellationToken::new()).await.expect("fetch");
        source.drain().await;
        source.get_chunk_by_any(params(), &CancellationToken::new()).await.expect("fetch");
        source.drain().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(source.metrics.failures.load(Ordering::SeqCst), 2);
        assert_eq!(source.metrics.skipped_deduplicated.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_token_skips_before_reaching_the_broadcaster() {
        let calls = Arc::new(AtomicU64::new(0));
        let inner = Arc::new(FixedInner { source: ChunkSource::named("ar.io") });
        let broadcaster = Arc::new(CountingBroadcaster {
            calls: Arc::clone(&calls),
            success_count: 1,
            fail: Arc::new(AtomicBool::new(false)),
        });
        let source = RebroadcastingSource::new(inner, broadcaster, Arc::new(NeverAllow), allowed_sources(), &default_settings());

        source.get_chunk_by_any(params(), &CancellationToken::new()).await.expect("fetch");
        source.drain().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(source.metrics.skipped_no_token.load(Ordering::SeqCst), 1);
    }
}
