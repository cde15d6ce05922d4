//! Read-through data cache (spec §4.F): look up attributes by id; on a
//! store hit, stream the cached bytes straight back. On a miss, fetch from
//! the source, tee the stream to a write-store branch and a streaming
//! SHA-256, and persist `{id -> hash, dataSize, contentType}` once the
//! digest is known. The source stream is returned to the caller
//! immediately; the cache write finishes in the background.

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use common::error::AppError;
use common::storage::store::StorageManager;
use futures::stream::BoxStream;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

pub type ByteStream = BoxStream<'static, Result<Bytes, AppError>>;

const TEE_CHANNEL_CAPACITY: usize = 32;

/// Attributes known about a cached id (spec §4.F step 1/2).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DataAttributes {
    pub hash: Option<[u8; 32]>,
    pub data_size: Option<u64>,
    pub content_type: Option<String>,
    pub verified: bool,
}

/// External attribute lookup/persistence. Implemented by `attribute-cache`.
#[async_trait]
pub trait AttributeSource: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<DataAttributes>, AppError>;
    async fn set(&self, id: &str, patch: DataAttributes) -> Result<(), AppError>;
}

/// External source of data by id, consulted on a cache miss. Returns the
/// byte stream plus any content-type hint the source can supply.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn get_data(&self, id: &str) -> Result<(ByteStream, Option<String>), AppError>;
}

/// A stream over an id's bytes, plus what's known about it so far.
pub struct DataCacheEntry {
    pub stream: ByteStream,
    pub attributes: DataAttributes,
}

fn hash_path(prefix: &str, hash: &[u8; 32]) -> String {
    format!("{prefix}/by-hash/{}", hex_encode(hash))
}

fn staging_path(prefix: &str) -> String {
    format!("{prefix}/staging/{}", Uuid::new_v4())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Read-through cache over a `DataSource`, keyed by SHA-256 once fetched.
pub struct DataCache {
    storage: StorageManager,
    prefix: String,
    source: Arc<dyn DataSource>,
    attributes: Arc<dyn AttributeSource>,
}

impl DataCache {
    pub fn new(
        storage: StorageManager,
        prefix: impl Into<String>,
        source: Arc<dyn DataSource>,
        attributes: Arc<dyn AttributeSource>,
    ) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            source,
            attributes,
        }
    }

    /// spec §4.F `getData(id)`.
    pub async fn get_data(&self, id: &str) -> Result<DataCacheEntry, AppError> {
        if let Some(attrs) = self.attributes.get(id).await? {
            if let Some(hash) = attrs.hash {
                match self.storage.get_stream(&hash_path(&self.prefix, &hash)).await {
                    Ok(stream) => {
                        debug!(id, "data cache hit");
                        return Ok(DataCacheEntry {
                            stream: stream.map(|r| r.map_err(AppError::from)).boxed(),
                            attributes: attrs,
                        });
                    }
                    Err(e) => {
                        let err = AppError::from(e);
                        if !err.is_not_found() {
                            return Err(err);
                        }
                    }
                }
            }
        }

        debug!(id, "data cache miss, fetching from source");
        let (source_stream, content_type) = self.source.get_data(id).await?;
        Ok(self.tee(id.to_string(), source_stream, content_type))
    }

    fn tee(&self, id: String, mut source: ByteStream, content_type: Option<String>) -> DataCacheEntry {
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(TEE_CHANNEL_CAPACITY);
        let staging_key = staging_path(&self.prefix);
        let storage = self.storage.clone();
        let write_handle: JoinHandle<Result<u64, std::io::Error>> = tokio::spawn({
            let staging_key = staging_key.clone();
            let storage = storage.clone();
            async move { storage.put_stream(&staging_key, ReceiverStream::new(rx).boxed()).await }
        });

        let prefix = self.prefix.clone();
        let attributes = Arc::clone(&self.attributes);

        let stream = try_stream! {
            let mut hasher = Sha256::new();

            while let Some(chunk) = source.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tokio::spawn(abort_staging(storage.clone(), staging_key.clone(), write_handle));
                        Err(e)?
                    }
                };
                hasher.update(&chunk);
                if tx.send(Ok(chunk.clone())).await.is_err() {
                    warn!(id = %id, "tee channel closed early, cache write abandoned");
                }
                yield chunk;
            }

            drop(tx);
            let digest: [u8; 32] = hasher.finalize().into();
            tokio::spawn(finalize_success(
                storage.clone(),
                prefix.clone(),
                staging_key.clone(),
                write_handle,
                attributes,
                id.clone(),
                digest,
                content_type.clone(),
            ));
        };

        DataCacheEntry {
            stream: stream.boxed(),
            attributes: DataAttributes::default(),
        }
    }
}

/// Source errored mid-stream: the staging write must never become visible.
async fn abort_staging(
    storage: StorageManager,
    staging_key: String,
    write_handle: JoinHandle<Result<u64, std::io::Error>>,
) {
    write_handle.abort();
    let _ = write_handle.await;
    if let Err(e) = storage.delete(&staging_key).await {
        debug!(error = %e, "failed to clean up staging object after source error");
    }
}

/// Source stream ended cleanly: wait for the staged write, move it into its
/// content-addressed home, and persist the attributes. Runs detached so the
/// consumer of the returned stream never waits on it.
#[allow(clippy::too_many_arguments)]
async fn finalize_success(
    storage: StorageManager,
    prefix: String,
    staging_key: String,
    write_handle: JoinHandle<Result<u64, std::io::Error>>,
    attributes: Arc<dyn AttributeSource>,
    id: String,
    digest: [u8; 32],
    content_type: Option<String>,
) {
    let written = match write_handle.await {
        Ok(Ok(written)) => written,
        Ok(Err(e)) => {
            warn!(id = %id, error = %e, "staging write failed, cache entry abandoned");
            let _ = storage.delete(&staging_key).await;
            return;
        }
        Err(e) => {
            warn!(id = %id, error = %e, "staging write task panicked, cache entry abandoned");
            return;
        }
    };

    let final_key = hash_path(&prefix, &digest);
    if let Err(e) = storage.copy(&staging_key, &final_key).await {
        warn!(id = %id, error = %e, "failed to move staged write into place");
        let _ = storage.delete(&staging_key).await;
        return;
    }
    if let Err(e) = storage.delete(&staging_key).await {
        debug!(id = %id, error = %e, "failed to remove staging object after finalize");
    }

    if let Err(e) = attributes
        .set(
            &id,
            DataAttributes {
                hash: Some(digest),
                data_size: Some(written),
                content_type,
                verified: true,
            },
        )
        .await
    {
        warn!(id = %id, error = %e, "failed to persist attributes after cache write");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::test_config;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    struct FakeAttributeSource {
        records: Mutex<HashMap<String, DataAttributes>>,
    }

    impl FakeAttributeSource {
        fn new() -> Self {
            Self { records: Mutex::new(HashMap::new()) }
        }
    }

    #[async_trait]
    impl AttributeSource for FakeAttributeSource {
        async fn get(&self, id: &str) -> Result<Option<DataAttributes>, AppError> {
            Ok(self.records.lock().get(id).cloned())
        }

        async fn set(&self, id: &str, patch: DataAttributes) -> Result<(), AppError> {
            self.records.lock().insert(id.to_string(), patch);
            Ok(())
        }
    }

    struct FakeDataSource {
        payload: Bytes,
        content_type: Option<String>,
    }

    #[async_trait]
    impl DataSource for FakeDataSource {
        async fn get_data(&self, _id: &str) -> Result<(ByteStream, Option<String>), AppError> {
            let payload = self.payload.clone();
            let stream = futures::stream::once(async move { Ok(payload) }).boxed();
            Ok((stream, self.content_type.clone()))
        }
    }

    struct FailingDataSource;

    #[async_trait]
    impl DataSource for FailingDataSource {
        async fn get_data(&self, _id: &str) -> Result<(ByteStream, Option<String>), AppError> {
            let good = Bytes::from_static(b"partial-");
            let stream = futures::stream::iter(vec![
                Ok(good),
                Err(AppError::Internal("source blew up".to_string())),
            ])
            .boxed();
            Ok((stream, None))
        }
    }

    async fn drain(mut stream: ByteStream) -> Result<Bytes, AppError> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(out))
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn miss_then_hit_round_trips_and_persists_attributes() {
        let storage = StorageManager::new(&test_config()).await.expect("storage");
        let attributes = Arc::new(FakeAttributeSource::new());
        let payload = Bytes::from_static(b"hello arweave");
        let source = Arc::new(FakeDataSource {
            payload: payload.clone(),
            content_type: Some("text/plain".to_string()),
        });
        let cache = DataCache::new(storage, "data", source, Arc::clone(&attributes) as Arc<dyn AttributeSource>);

        let entry = cache.get_data("tx-1").await.expect("get_data");
        let body = drain(entry.stream).await.expect("drain");
        assert_eq!(body, payload);

        let expected_hash = common::model::Chunk::sha256(&payload);
        wait_until(|| {
            attributes
                .records
                .lock()
                .get("tx-1")
                .is_some_and(|a| a.hash == Some(expected_hash))
        })
        .await;

        let persisted = attributes.get("tx-1").await.expect("get").expect("present");
        assert_eq!(persisted.data_size, Some(payload.len() as u64));
        assert_eq!(persisted.content_type.as_deref(), Some("text/plain"));
        assert!(persisted.verified);

        let second = cache.get_data("tx-1").await.expect("second get_data");
        let second_body = drain(second.stream).await.expect("drain");
        assert_eq!(second_body, payload);
        assert_eq!(second.attributes.hash, Some(expected_hash));
    }

    #[tokio::test]
    async fn source_error_surfaces_and_never_persists_a_partial_entry() {
        let storage = StorageManager::new(&test_config()).await.expect("storage");
        let attributes = Arc::new(FakeAttributeSource::new());
        let cache = DataCache::new(
            storage.clone(),
            "data",
            Arc::new(FailingDataSource),
            Arc::clone(&attributes) as Arc<dyn AttributeSource>,
        );

        let entry = cache.get_data("tx-broken").await.expect("get_data");
        let result = drain(entry.stream).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(attributes.get("tx-broken").await.expect("get").is_none());

        let listed = storage.list(Some("data/by-hash")).await.expect("list");
        assert!(listed.is_empty());
    }
}
