//! Content-addressed chunk storage, keyed by hash and by absolute weave
//! offset (spec §4.D). `ChunkDataStore` and `ChunkMetadataStore` are opaque
//! capabilities to the orchestrator: a memory-backed implementation for
//! tests, an `object_store`-backed one for production.

pub mod memory;
pub mod object_store_backed;

use async_trait::async_trait;
use bytes::Bytes;
use common::error::AppError;
use serde::{Deserialize, Serialize};

/// Everything the retrieval pipeline needs about a chunk besides its bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub data_root: [u8; 32],
    pub data_size: u64,
    pub offset: u64,
    pub data_path: Vec<u8>,
    pub tx_path: Option<Vec<u8>>,
}

#[async_trait]
pub trait ChunkDataStore: Send + Sync {
    async fn get(&self, hash: &[u8; 32]) -> Result<Option<Bytes>, AppError>;
    async fn get_by_absolute_offset(&self, offset: u64) -> Result<Option<Bytes>, AppError>;
    async fn set(&self, hash: [u8; 32], offset: u64, data: Bytes) -> Result<(), AppError>;
    async fn has(&self, hash: &[u8; 32]) -> Result<bool, AppError>;
}

#[async_trait]
pub trait ChunkMetadataStore: Send + Sync {
    async fn get(&self, hash: &[u8; 32]) -> Result<Option<ChunkMetadata>, AppError>;
    async fn get_by_absolute_offset(&self, offset: u64) -> Result<Option<ChunkMetadata>, AppError>;
    async fn set(&self, hash: [u8; 32], offset: u64, metadata: ChunkMetadata) -> Result<(), AppError>;
    async fn has(&self, hash: &[u8; 32]) -> Result<bool, AppError>;
}
