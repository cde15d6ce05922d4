use async_trait::async_trait;
use bytes::Bytes;
use common::error::AppError;
use common::storage::store::StorageManager;

use crate::{ChunkDataStore, ChunkMetadata, ChunkMetadataStore};

fn hash_path(prefix: &str, hash: &[u8; 32]) -> String {
    format!("{prefix}/by-hash/{}", hex_encode(hash))
}

fn offset_path(prefix: &str, offset: u64) -> String {
    format!("{prefix}/by-offset/{offset}")
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// `object_store`-backed `ChunkDataStore`. Data is stored once under its
/// hash; the offset index is a secondary pointer record containing the raw
/// 32-byte hash, so both axes stay content-addressed at the root.
pub struct ObjectStoreChunkDataStore {
    storage: StorageManager,
    prefix: String,
}

impl ObjectStoreChunkDataStore {
    pub fn new(storage: StorageManager, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl ChunkDataStore for ObjectStoreChunkDataStore {
    async fn get(&self, hash: &[u8; 32]) -> Result<Option<Bytes>, AppError> {
        match self.storage.get(&hash_path(&self.prefix, hash)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) => {
                let err = AppError::from(e);
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn get_by_absolute_offset(&self, offset: u64) -> Result<Option<Bytes>, AppError> {
        let hash = match self.storage.get(&offset_path(&self.prefix, offset)).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = AppError::from(e);
                return if err.is_not_found() { Ok(None) } else { Err(err) };
            }
        };
        let hash: [u8; 32] = hash
            .as_ref()
            .try_into()
            .map_err(|_| AppError::Corrupt("offset index entry is not 32 bytes".to_string()))?;
        self.get(&hash).await
    }

    async fn set(&self, hash: [u8; 32], offset: u64, data: Bytes) -> Result<(), AppError> {
        self.storage
            .put(&hash_path(&self.prefix, &hash), data)
            .await?;
        self.storage
            .put(
                &offset_path(&self.prefix, offset),
                Bytes::copy_from_slice(&hash),
            )
            .await?;
        Ok(())
    }

    async fn has(&self, hash: &[u8; 32]) -> Result<bool, AppError> {
        Ok(self.storage.exists(&hash_path(&self.prefix, hash)).await?)
    }
}

/// `object_store`-backed `ChunkMetadataStore`, same layout as the data store
/// with JSON-encoded records.
pub struct ObjectStoreChunkMetadataStore {
    storage: StorageManager,
    prefix: String,
}

impl ObjectStoreChunkMetadataStore {
    pub fn new(storage: StorageManager, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl ChunkMetadataStore for ObjectStoreChunkMetadataStore {
    async fn get(&self, hash: &[u8; 32]) -> Result<Option<ChunkMetadata>, AppError> {
        match self.storage.get(&hash_path(&self.prefix, hash)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) => {
                let err = AppError::from(e);
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn get_by_absolute_offset(&self, offset: u64) -> Result<Option<ChunkMetadata>, AppError> {
        let hash = match self.storage.get(&offset_path(&self.prefix, offset)).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = AppError::from(e);
                return if err.is_not_found() { Ok(None) } else { Err(err) };
            }
        };
        let hash: [u8; 32] = hash
            .as_ref()
            .try_into()
            .map_err(|_| AppError::Corrupt("offset index entry is not 32 bytes".to_string()))?;
        self.get(&hash).await
    }

    async fn set(&self, hash: [u8; 32], offset: u64, metadata: ChunkMetadata) -> Result<(), AppError> {
        let encoded = serde_json::to_vec(&metadata)?;
        self.storage
            .put(&hash_path(&self.prefix, &hash), Bytes::from(encoded))
            .await?;
        self.storage
            .put(
                &offset_path(&self.prefix, offset),
                Bytes::copy_from_slice(&hash),
            )
            .await?;
        Ok(())
    }

    async fn has(&self, hash: &[u8; 32]) -> Result<bool, AppError> {
        Ok(self.storage.exists(&hash_path(&self.prefix, hash)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::test_config;

    async fn storage() -> StorageManager {
        StorageManager::new(&test_config()).await.expect("storage")
    }

    #[tokio::test]
    async fn data_store_round_trips_by_hash_and_offset() {
        let store = ObjectStoreChunkDataStore::new(storage().await, "chunks");
        let hash = [3u8; 32];
        store
            .set(hash, 42, Bytes::from_static(b"payload"))
            .await
            .expect("set");

        assert_eq!(
            store.get(&hash).await.expect("get"),
            Some(Bytes::from_static(b"payload"))
        );
        assert_eq!(
            store.get_by_absolute_offset(42).await.expect("get"),
            Some(Bytes::from_static(b"payload"))
        );
        assert!(store.has(&hash).await.expect("has"));
    }

    #[tokio::test]
    async fn metadata_store_round_trips() {
        let store = ObjectStoreChunkMetadataStore::new(storage().await, "meta");
        let hash = [5u8; 32];
        let meta = ChunkMetadata {
            data_root: [2u8; 32],
            data_size: 512,
            offset: 10,
            data_path: vec![1, 2, 3],
            tx_path: Some(vec![4, 5]),
        };
        store.set(hash, 99, meta.clone()).await.expect("set");

        let fetched = store.get(&hash).await.expect("get").expect("present");
        assert_eq!(fetched.data_size, 512);
        let fetched_by_offset = store
            .get_by_absolute_offset(99)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched_by_offset.tx_path, Some(vec![4, 5]));
    }

    #[tokio::test]
    async fn missing_hash_is_absent_not_error() {
        let store = ObjectStoreChunkDataStore::new(storage().await, "chunks");
        assert_eq!(store.get(&[0u8; 32]).await.expect("get"), None);
    }
}
