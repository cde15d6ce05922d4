//! Cross-crate end-to-end scenarios (spec §8), wiring the real crates
//! together rather than the in-crate test doubles each component already
//! exercises on its own.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::error::{AppError, ChunkNotFoundKind};
use common::model::{Chunk, ChunkRetrievalResult, ChunkSource, TxBoundary};
use tokio_util::sync::CancellationToken;

use cdb64::{Reader, Writer};
use cdb64_shard::{ShardSource, ShardedIndex};
use chunk_retrieval::{retrieve_chunk, BoundarySource, ChunkFetchParams, ChunkFetchSource};
use chunk_store::memory::{MemoryChunkDataStore, MemoryChunkMetadataStore};
use chunk_store::{ChunkDataStore, ChunkMetadata, ChunkMetadataStore};
use composite_source::{CompositeSource, FallbackSubSource};
use rate_limiter::memory::InMemoryBucketStore;
use rate_limiter::store::BucketStore;
use rate_limiter::RateLimiter;
use resolution_cache::{ResolutionCache, ResolutionPage, ResolutionUpstream, ResolvedName};

struct PanicBoundarySource;

#[async_trait]
impl BoundarySource for PanicBoundarySource {
    async fn resolve_boundary(&self, _absolute_offset: u64, _cancel: &CancellationToken) -> Result<Option<TxBoundary>, AppError> {
        panic!("boundary source must not be consulted on a cache hit");
    }
}

struct PanicChunkSource;

#[async_trait]
impl ChunkFetchSource for PanicChunkSource {
    async fn get_chunk_by_any(&self, _params: ChunkFetchParams, _cancel: &CancellationToken) -> Result<Chunk, AppError> {
        panic!("chunk source must not be consulted on a cache hit");
    }
}

/// Scenario 1: cache hit (spec §8.1).
#[tokio::test]
async fn cache_hit_short_circuits_boundary_and_chunk_sources() {
    let data_store = MemoryChunkDataStore::new();
    let metadata_store = MemoryChunkMetadataStore::new();

    let hash = Chunk::sha256(&[2u8; 256]);
    data_store
        .set(hash, 51_530_681_327_863, Bytes::from(vec![2u8; 256]))
        .await
        .expect("seed data store");
    metadata_store
        .set(
            hash,
            51_530_681_327_863,
            ChunkMetadata {
                data_root: [9u8; 32],
                data_size: 256_000,
                offset: 0,
                data_path: vec![0xaa],
                tx_path: None,
            },
        )
        .await
        .expect("seed metadata store");

    let result = retrieve_chunk(
        51_530_681_327_863,
        Some(&data_store),
        Some(&metadata_store),
        &PanicBoundarySource,
        &PanicChunkSource,
        &CancellationToken::new(),
    )
    .await
    .expect("retrieve_chunk");

    assert!(matches!(result, ChunkRetrievalResult::CacheHit(_)));
    assert_eq!(result.fields().data_size, 256_000);
    assert_eq!(result.fields().chunk.source, ChunkSource::cache());
}

struct CountingBoundarySubSource {
    boundary: Option<TxBoundary>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl FallbackSubSource<TxBoundary> for CountingBoundarySubSource {
    async fn try_fetch(&self, _cancel: &CancellationToken) -> Result<Option<TxBoundary>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.boundary.clone())
    }
}

struct CompositeBoundarySource {
    inner: CompositeSource<TxBoundary>,
}

#[async_trait]
impl BoundarySource for CompositeBoundarySource {
    async fn resolve_boundary(&self, _absolute_offset: u64, cancel: &CancellationToken) -> Result<Option<TxBoundary>, AppError> {
        self.inner.resolve(cancel).await
    }
}

struct CountingChunkSource {
    payload: Bytes,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ChunkFetchSource for CountingChunkSource {
    async fn get_chunk_by_any(&self, params: ChunkFetchParams, _cancel: &CancellationToken) -> Result<Chunk, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Chunk {
            hash: Chunk::sha256(&self.payload),
            bytes: self.payload.clone(),
            data_root: [7u8; 32],
            data_size: params.tx_size,
            data_path: vec![0xbb],
            offset: params.relative_offset,
            tx_path: None,
            source: ChunkSource::named("ar.io"),
            source_host: Some("ar.io".to_string()),
        })
    }
}

/// Scenario 2: boundary-fetch fallback, with the boundary lookup backed
/// by a real `composite_source::CompositeSource` rather than a direct
/// `BoundarySource` impl.
#[tokio::test]
async fn boundary_fetch_fallback_through_a_real_composite_source() {
    let boundary_calls = Arc::new(AtomicUsize::new(0));
    let chunk_calls = Arc::new(AtomicUsize::new(0));

    let boundary = TxBoundary {
        data_root: "wRq6f05oRupfTW_M5dcYBtwK5P8rSNYu20vC6D_o-M4".to_string(),
        id: Some("test-tx-id-12345".to_string()),
        data_size: 256_000,
        weave_offset: 51_530_681_583_862,
    };
    let composite = CompositeSource::new().add_source(
        Arc::new(CountingBoundarySubSource {
            boundary: Some(boundary),
            calls: Arc::clone(&boundary_calls),
        }),
        None,
    );
    let boundary_source = CompositeBoundarySource { inner: composite };
    let chunk_source = CountingChunkSource {
        payload: Bytes::from_static(b"fetched chunk bytes"),
        calls: Arc::clone(&chunk_calls),
    };

    let result = retrieve_chunk(
        51_530_681_583_862 + 137,
        None,
        None,
        &boundary_source,
        &chunk_source,
        &CancellationToken::new(),
    )
    .await
    .expect("retrieve_chunk");

    assert!(result.has_tx_id());
    assert!(matches!(result, ChunkRetrievalResult::BoundaryFetch { tx_id: Some(ref id), .. } if id == "test-tx-id-12345"));
    assert_eq!(boundary_calls.load(Ordering::SeqCst), 1);
    assert_eq!(chunk_calls.load(Ordering::SeqCst), 1);
}

/// Scenario 3: the boundary source throwing is reported as
/// `offset_lookup_failed`, distinct from a clean "not found".
#[tokio::test]
async fn a_throwing_boundary_source_is_reported_as_offset_lookup_failed() {
    struct ThrowingBoundarySource;

    #[async_trait]
    impl BoundarySource for ThrowingBoundarySource {
        async fn resolve_boundary(&self, _absolute_offset: u64, _cancel: &CancellationToken) -> Result<Option<TxBoundary>, AppError> {
            Err(AppError::Internal("upstream boundary lookup unreachable".to_string()))
        }
    }

    let chunk_calls = Arc::new(AtomicUsize::new(0));
    let chunk_source = CountingChunkSource {
        payload: Bytes::new(),
        calls: Arc::clone(&chunk_calls),
    };

    let err = retrieve_chunk(42, None, None, &ThrowingBoundarySource, &chunk_source, &CancellationToken::new())
        .await
        .expect_err("boundary throw must surface as an error");

    assert!(matches!(err, AppError::ChunkNotFound(ChunkNotFoundKind::OffsetLookupFailed)));
    assert_eq!(chunk_calls.load(Ordering::SeqCst), 0);
}

/// Composite source's own contract: a failing sub-source is swallowed
/// into "no result", not propagated — so wrapping it behind
/// `BoundarySource` produces `boundary_not_found`, not
/// `offset_lookup_failed`. Extends scenario 3's boundary with the
/// sub-source-failure half of composite-source's quantified invariant.
#[tokio::test]
async fn a_failing_composite_source_tier_is_reported_as_boundary_not_found() {
    struct FailingSubSource;

    #[async_trait]
    impl FallbackSubSource<TxBoundary> for FailingSubSource {
        async fn try_fetch(&self, _cancel: &CancellationToken) -> Result<Option<TxBoundary>, AppError> {
            Err(AppError::Internal("transient upstream failure".to_string()))
        }
    }

    let composite = CompositeSource::new().add_source(Arc::new(FailingSubSource), None);
    let boundary_source = CompositeBoundarySource { inner: composite };
    let chunk_source = CountingChunkSource {
        payload: Bytes::new(),
        calls: Arc::new(AtomicUsize::new(0)),
    };

    let err = retrieve_chunk(42, None, None, &boundary_source, &chunk_source, &CancellationToken::new())
        .await
        .expect_err("no tier produced a boundary");

    assert!(matches!(err, AppError::ChunkNotFound(ChunkNotFoundKind::BoundaryNotFound)));
}

/// Scenario 4: CDB64 duplicate-key iteration, across real on-disk shard
/// files rather than a single in-memory `Reader`.
#[tokio::test]
async fn duplicate_keys_and_multi_shard_first_match_wins() {
    let dir = tempfile::tempdir().expect("tempdir");

    let single = dir.path().join("dupes.cdb");
    let mut writer = Writer::create(&single).expect("create writer");
    writer.add(b"k", b"v1").expect("add v1");
    writer.add(b"k", b"v2").expect("add v2");
    writer.add(b"k", b"v3").expect("add v3");
    writer.finalize().expect("finalize");

    let reader = Reader::open(&single).expect("open reader");
    assert_eq!(reader.get(b"k").expect("get"), Some(b"v1".to_vec()));
    let values: Vec<Vec<u8>> = reader.entries().map(|e| e.expect("entry").1).collect();
    assert_eq!(values, vec![b"v1".to_vec(), b"v2".to_vec(), b"v3".to_vec()]);
    reader.close();

    let shard_dir = dir.path().join("shards");
    std::fs::create_dir_all(&shard_dir).expect("mkdir");
    write_single_entry_shard(&shard_dir.join("a.cdb"), b"k", b"from-a");
    write_single_entry_shard(&shard_dir.join("b.cdb"), b"k", b"from-b");

    let index = ShardedIndex::new(ShardSource::Dir(shard_dir), false);
    assert_eq!(index.get(b"k").expect("get"), Some(b"from-a".to_vec()));
}

fn write_single_entry_shard(path: &Path, key: &[u8], value: &[u8]) {
    let mut writer = Writer::create(path).expect("create writer");
    writer.add(key, value).expect("add");
    writer.finalize().expect("finalize");
}

/// Scenario 5: rate limiter corrective accounting, matching the spec's
/// numbers: 100-token buckets, a 10 240-byte response (10 tokens), and
/// the resource bucket remembering that content length for the next
/// request's predictive phase.
#[tokio::test]
async fn rate_limiter_corrective_accounting_remembers_content_length() {
    use common::config::{BucketConfig, RateLimiterConfig};

    let store = Arc::new(InMemoryBucketStore::new());
    let config = RateLimiterConfig {
        enabled: true,
        resource_bucket: BucketConfig { capacity: 100, refill_rate_per_sec: 10.0 },
        ip_bucket: BucketConfig { capacity: 100, refill_rate_per_sec: 10.0 },
        allow_listed_ips: Vec::new(),
        bucket_ttl_seconds: 3600,
    };
    let limiter = RateLimiter::new(Arc::clone(&store) as Arc<dyn BucketStore>, config);

    let decision = match limiter.predictive("res", "ip", "host").await.expect("predictive") {
        rate_limiter::PredictiveResult::Allowed(d) => d,
        rate_limiter::PredictiveResult::Blocked { .. } => panic!("expected allowed"),
    };
    assert_eq!(decision.resource_consumed, 1);
    assert_eq!(decision.ip_consumed, 1);

    limiter.corrective(&decision, 10_240).await;
    assert_eq!(store.cached_content_length("res").await.expect("read"), Some(10_240));

    let decision2 = match limiter.predictive("res", "ip", "host").await.expect("predictive") {
        rate_limiter::PredictiveResult::Allowed(d) => d,
        rate_limiter::PredictiveResult::Blocked { .. } => panic!("expected allowed"),
    };
    assert_eq!(decision2.resource_consumed, 1);
    assert_eq!(decision2.ip_consumed, 10);
}

/// Returns an empty page on its first call (establishing a hydrated-but-
/// empty cache) and `name` from the given call number onward. Each call
/// takes `delay` to resolve, so a test can land a second `get()` while the
/// scheduled refresh is still running.
struct DelayedUpstream {
    calls: AtomicUsize,
    delay: Duration,
    populate_from_call: usize,
    name: String,
}

#[async_trait]
impl ResolutionUpstream for DelayedUpstream {
    async fn fetch_page(&self, _cursor: Option<String>) -> Result<ResolutionPage, AppError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        if call >= self.populate_from_call {
            Ok(ResolutionPage {
                records: vec![ResolvedName {
                    name: self.name.clone(),
                    process_id: Some("proc-1".to_string()),
                    tx_id: None,
                    ttl_seconds: 3600,
                }],
                next_cursor: None,
            })
        } else {
            Ok(ResolutionPage { records: Vec::new(), next_cursor: None })
        }
    }
}

/// Scenario 6: resolution cache miss-debounce, with real wall-clock
/// sleeps matching the spec's timing. The cache is primed with one empty
/// refresh first, so the miss-debounce request below lands in the
/// unambiguous "a refresh is already in flight and the cache has
/// hydrated before" branch rather than racing the cold-start await path.
#[tokio::test]
async fn resolution_cache_miss_debounce_with_real_wall_clock_sleeps() {
    let upstream = Arc::new(DelayedUpstream {
        calls: AtomicUsize::new(0),
        delay: Duration::from_millis(50),
        populate_from_call: 2,
        name: "ardrive.ar".to_string(),
    });
    let cache = ResolutionCache::new(Arc::clone(&upstream) as Arc<dyn ResolutionUpstream>, Duration::from_millis(60_000), Duration::from_millis(10));
    let cancel = CancellationToken::new();
    let mut epoch = cache.subscribe();

    cache.force_refresh();
    epoch.changed().await.expect("priming refresh completes");
    tokio::time::sleep(Duration::from_millis(15)).await;

    let first = cache.get("ardrive.ar", &cancel).await.expect("get");
    assert!(first.is_none());

    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = cache.get("ardrive.ar", &cancel).await.expect("get");
    assert!(second.is_none());
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);

    epoch.changed().await.expect("miss-debounce refresh completes");
    let third = cache.get("ardrive.ar", &cancel).await.expect("get");
    assert_eq!(third.map(|r| r.name), Some("ardrive.ar".to_string()));
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
}
