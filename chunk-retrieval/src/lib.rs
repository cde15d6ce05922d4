//! Chunk retrieval orchestrator (spec §4.H). `retrieve_chunk` is the
//! public entry point: cache fast path, then boundary lookup, then chunk
//! fetch, modeled as a typestate pipeline so a stage can't run out of
//! order. The orchestrator itself is stateless across calls; everything
//! it depends on is injected per call.

mod pipeline;

pub use pipeline::PipelineContext;

use async_trait::async_trait;
use chunk_store::{ChunkDataStore, ChunkMetadataStore};
use common::error::AppError;
use common::model::{Chunk, ChunkRetrievalResult, TxBoundary};
use tokio_util::sync::CancellationToken;

/// The transaction-boundary lookup a retrieval call consults on a cache
/// miss. Built on top of `composite-source::CompositeSource<TxBoundary>` by
/// whoever wires the gateway together; this trait is the seam the
/// orchestrator depends on instead of the concrete fallback chain.
#[async_trait]
pub trait BoundarySource: Send + Sync {
    async fn resolve_boundary(
        &self,
        absolute_offset: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<TxBoundary>, AppError>;
}

/// Parameters the chunk-fetch source needs to locate a chunk once the
/// transaction boundary is known (spec §4.H step 3).
#[derive(Debug, Clone)]
pub struct ChunkFetchParams {
    pub tx_size: u64,
    pub absolute_offset: u64,
    pub data_root: String,
    pub relative_offset: u64,
}

/// `getChunkByAny` (spec §4.H step 3, §4.I). Any error is reported to the
/// caller as `ChunkNotFound{fetch_failed}`.
#[async_trait]
pub trait ChunkFetchSource: Send + Sync {
    async fn get_chunk_by_any(
        &self,
        params: ChunkFetchParams,
        cancel: &CancellationToken,
    ) -> Result<Chunk, AppError>;
}

/// spec §4.H `retrieveChunk(absoluteOffset)`.
#[allow(clippy::too_many_arguments)]
pub async fn retrieve_chunk(
    absolute_offset: u64,
    data_store: Option<&dyn ChunkDataStore>,
    metadata_store: Option<&dyn ChunkMetadataStore>,
    boundary_source: &dyn BoundarySource,
    chunk_source: &dyn ChunkFetchSource,
    cancel: &CancellationToken,
) -> Result<ChunkRetrievalResult, AppError> {
    let mut ctx = PipelineContext::new(
        absolute_offset,
        data_store,
        metadata_store,
        boundary_source,
        chunk_source,
        cancel,
    );
    pipeline::drive(&mut ctx).await
}
