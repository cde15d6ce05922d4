mod stages;
mod state;

pub use stages::PipelineContext;

use common::error::AppError;
use common::model::ChunkRetrievalResult;

/// Drives `retrieveChunk` through cache fast path, boundary lookup, and
/// chunk fetch (spec §4.H).
pub async fn drive(ctx: &mut PipelineContext<'_>) -> Result<ChunkRetrievalResult, AppError> {
    let machine = state::ready();
    let machine = stages::check_cache(machine, ctx).await?;

    if stages::cache_result(ctx).is_some() {
        return stages::cache_hit(machine, ctx);
    }

    let machine = stages::resolve_boundary(machine, ctx).await?;
    stages::fetch_chunk(machine, ctx).await
}
