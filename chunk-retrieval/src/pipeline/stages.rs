use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chunk_store::{ChunkDataStore, ChunkMetadataStore};
use common::error::{AppError, ChunkNotFoundKind};
use common::model::{ChunkRetrievalResult, RetrievedChunkFields, TxBoundary};
use state_machines::core::GuardError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{BoundarySource, ChunkFetchParams, ChunkFetchSource};

use super::state::{BoundaryResolved, CacheChecked, ChunkRetrievalMachine, Ready};

/// Everything a single `retrieveChunk` call threads through its stages.
pub struct PipelineContext<'a> {
    pub absolute_offset: u64,
    pub data_store: Option<&'a dyn ChunkDataStore>,
    pub metadata_store: Option<&'a dyn ChunkMetadataStore>,
    pub boundary_source: &'a dyn BoundarySource,
    pub chunk_source: &'a dyn ChunkFetchSource,
    pub cancel: &'a CancellationToken,
    cache_result: Option<ChunkRetrievalResult>,
    boundary: Option<TxBoundary>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        absolute_offset: u64,
        data_store: Option<&'a dyn ChunkDataStore>,
        metadata_store: Option<&'a dyn ChunkMetadataStore>,
        boundary_source: &'a dyn BoundarySource,
        chunk_source: &'a dyn ChunkFetchSource,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            absolute_offset,
            data_store,
            metadata_store,
            boundary_source,
            chunk_source,
            cancel,
            cache_result: None,
            boundary: None,
        }
    }

    fn ensure_boundary(&self) -> Result<&TxBoundary, AppError> {
        self.boundary
            .as_ref()
            .ok_or_else(|| AppError::Internal("transaction boundary missing before chunk fetch".to_string()))
    }
}

/// spec §4.H step 1: only consulted when both stores are configured; a hit
/// in only one store is treated as a miss and falls through to the boundary
/// lookup.
#[instrument(level = "trace", skip_all)]
pub async fn check_cache(
    machine: ChunkRetrievalMachine<(), Ready>,
    ctx: &mut PipelineContext<'_>,
) -> Result<ChunkRetrievalMachine<(), CacheChecked>, AppError> {
    if let (Some(data_store), Some(metadata_store)) = (ctx.data_store, ctx.metadata_store) {
        let data = data_store.get_by_absolute_offset(ctx.absolute_offset).await?;
        let meta = metadata_store.get_by_absolute_offset(ctx.absolute_offset).await?;
        if let (Some(bytes), Some(meta)) = (data, meta) {
            debug!(offset = ctx.absolute_offset, "chunk cache hit");
            let weave_offset = ctx
                .absolute_offset
                .saturating_add(meta.data_size.saturating_sub(1).saturating_sub(meta.offset));
            let contiguous_start = ctx.absolute_offset.saturating_sub(meta.offset);
            let chunk = common::model::Chunk {
                hash: common::model::Chunk::sha256(&bytes),
                bytes,
                data_root: meta.data_root,
                data_size: meta.data_size,
                data_path: meta.data_path,
                offset: meta.offset,
                tx_path: meta.tx_path,
                source: common::model::ChunkSource::cache(),
                source_host: None,
            };
            let fields = RetrievedChunkFields {
                chunk,
                data_root: URL_SAFE_NO_PAD.encode(meta.data_root),
                data_size: meta.data_size,
                weave_offset,
                relative_offset: meta.offset,
                contiguous_data_start_delimiter: contiguous_start,
            };
            ctx.cache_result = Some(ChunkRetrievalResult::CacheHit(fields));
        }
    }

    machine
        .check_cache()
        .map_err(|(_, guard)| map_guard_error("check_cache", guard))
}

/// Whether `check_cache` found a usable entry. Consulted by the driver to
/// pick between `cache_hit` and `resolve_boundary`.
pub fn cache_result(ctx: &PipelineContext<'_>) -> Option<&ChunkRetrievalResult> {
    ctx.cache_result.as_ref()
}

#[instrument(level = "trace", skip_all)]
pub fn cache_hit(
    machine: ChunkRetrievalMachine<(), CacheChecked>,
    ctx: &mut PipelineContext<'_>,
) -> Result<ChunkRetrievalResult, AppError> {
    let result = ctx
        .cache_result
        .take()
        .ok_or_else(|| AppError::Internal("cache_hit stage entered without a cached result".to_string()))?;
    let _machine = machine
        .cache_hit()
        .map_err(|(_, guard)| map_guard_error("cache_hit", guard))?;
    Ok(result)
}

/// spec §4.H step 2.
#[instrument(level = "trace", skip_all)]
pub async fn resolve_boundary(
    machine: ChunkRetrievalMachine<(), CacheChecked>,
    ctx: &mut PipelineContext<'_>,
) -> Result<ChunkRetrievalMachine<(), BoundaryResolved>, AppError> {
    let boundary = ctx
        .boundary_source
        .resolve_boundary(ctx.absolute_offset, ctx.cancel)
        .await
        .map_err(|e| {
            if matches!(e, AppError::Cancelled) {
                e
            } else {
                AppError::ChunkNotFound(ChunkNotFoundKind::OffsetLookupFailed)
            }
        })?;

    let boundary = match boundary {
        Some(b) if is_valid_boundary(&b) => b,
        _ => return Err(AppError::ChunkNotFound(ChunkNotFoundKind::BoundaryNotFound)),
    };
    ctx.boundary = Some(boundary);

    machine
        .resolve_boundary()
        .map_err(|(_, guard)| map_guard_error("resolve_boundary", guard))
}

fn is_valid_boundary(boundary: &TxBoundary) -> bool {
    !boundary.data_root.is_empty() && boundary.data_size > 0
}

/// spec §4.H step 3.
#[instrument(level = "trace", skip_all)]
pub async fn fetch_chunk(
    machine: ChunkRetrievalMachine<(), BoundaryResolved>,
    ctx: &mut PipelineContext<'_>,
) -> Result<ChunkRetrievalResult, AppError> {
    let boundary = ctx.ensure_boundary()?.clone();
    let contiguous_start = boundary
        .weave_offset
        .checked_sub(boundary.data_size.saturating_sub(1))
        .ok_or_else(|| AppError::ChunkNotFound(ChunkNotFoundKind::BoundaryNotFound))?;
    let relative_offset = ctx
        .absolute_offset
        .checked_sub(contiguous_start)
        .ok_or_else(|| AppError::ChunkNotFound(ChunkNotFoundKind::BoundaryNotFound))?;

    let params = ChunkFetchParams {
        tx_size: boundary.data_size,
        absolute_offset: ctx.absolute_offset,
        data_root: boundary.data_root.clone(),
        relative_offset,
    };

    let chunk = ctx
        .chunk_source
        .get_chunk_by_any(params, ctx.cancel)
        .await
        .map_err(|e| {
            if matches!(e, AppError::Cancelled) {
                e
            } else {
                AppError::ChunkNotFound(ChunkNotFoundKind::FetchFailed)
            }
        })?;

    let fields = RetrievedChunkFields {
        chunk,
        data_root: boundary.data_root.clone(),
        data_size: boundary.data_size,
        weave_offset: boundary.weave_offset,
        relative_offset,
        contiguous_data_start_delimiter: contiguous_start,
    };

    let _machine = machine
        .fetch_chunk()
        .map_err(|(_, guard)| map_guard_error("fetch_chunk", guard))?;

    Ok(ChunkRetrievalResult::BoundaryFetch { fields, tx_id: boundary.id })
}

fn map_guard_error(stage: &'static str, err: GuardError) -> AppError {
    AppError::Internal(format!(
        "state machine guard '{stage}' failed: guard={}, event={}, kind={:?}",
        err.guard, err.event, err.kind
    ))
}
