use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use common::error::AppError;
use parking_lot::RwLock;

use crate::{ChunkDataStore, ChunkMetadata, ChunkMetadataStore};

/// In-memory `ChunkDataStore`, for tests and the `common::test-utils` feature.
#[derive(Default)]
pub struct MemoryChunkDataStore {
    by_hash: RwLock<HashMap<[u8; 32], Bytes>>,
    offset_index: RwLock<HashMap<u64, [u8; 32]>>,
}

impl MemoryChunkDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkDataStore for MemoryChunkDataStore {
    async fn get(&self, hash: &[u8; 32]) -> Result<Option<Bytes>, AppError> {
        Ok(self.by_hash.read().get(hash).cloned())
    }

    async fn get_by_absolute_offset(&self, offset: u64) -> Result<Option<Bytes>, AppError> {
        let Some(hash) = self.offset_index.read().get(&offset).copied() else {
            return Ok(None);
        };
        self.get(&hash).await
    }

    async fn set(&self, hash: [u8; 32], offset: u64, data: Bytes) -> Result<(), AppError> {
        self.by_hash.write().insert(hash, data);
        self.offset_index.write().insert(offset, hash);
        Ok(())
    }

    async fn has(&self, hash: &[u8; 32]) -> Result<bool, AppError> {
        Ok(self.by_hash.read().contains_key(hash))
    }
}

/// In-memory `ChunkMetadataStore`, mirroring `MemoryChunkDataStore`.
#[derive(Default)]
pub struct MemoryChunkMetadataStore {
    by_hash: RwLock<HashMap<[u8; 32], ChunkMetadata>>,
    offset_index: RwLock<HashMap<u64, [u8; 32]>>,
}

impl MemoryChunkMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkMetadataStore for MemoryChunkMetadataStore {
    async fn get(&self, hash: &[u8; 32]) -> Result<Option<ChunkMetadata>, AppError> {
        Ok(self.by_hash.read().get(hash).cloned())
    }

    async fn get_by_absolute_offset(&self, offset: u64) -> Result<Option<ChunkMetadata>, AppError> {
        let Some(hash) = self.offset_index.read().get(&offset).copied() else {
            return Ok(None);
        };
        self.get(&hash).await
    }

    async fn set(&self, hash: [u8; 32], offset: u64, metadata: ChunkMetadata) -> Result<(), AppError> {
        self.by_hash.write().insert(hash, metadata);
        self.offset_index.write().insert(offset, hash);
        Ok(())
    }

    async fn has(&self, hash: &[u8; 32]) -> Result<bool, AppError> {
        Ok(self.by_hash.read().contains_key(hash))
    }
}
