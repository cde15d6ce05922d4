//! Shared data model (spec §3): chunks, transaction boundaries, and the
//! tagged chunk-retrieval result. Every store/source/orchestrator crate in
//! this workspace builds on these types instead of defining its own.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a chunk came from. Modeled as an open string tag rather than a
/// closed enum because the set of named remotes is configuration-driven
/// (spec §3: "source tag (cache, peer, named remote, etc.)").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkSource(String);

impl ChunkSource {
    pub const CACHE: &'static str = "cache";
    pub const PEER: &'static str = "peer";

    pub fn cache() -> Self {
        Self(Self::CACHE.to_string())
    }

    pub fn peer() -> Self {
        Self(Self::PEER.to_string())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_cache(&self) -> bool {
        self.0 == Self::CACHE
    }
}

impl std::fmt::Display for ChunkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Up to 256 KiB of a transaction's data plus its Merkle proof (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub bytes: bytes::Bytes,
    pub data_root: [u8; 32],
    pub data_size: u64,
    pub data_path: Vec<u8>,
    /// Relative offset into the transaction's contiguous data, `0 <= offset < data_size`.
    pub offset: u64,
    pub hash: [u8; 32],
    pub tx_path: Option<Vec<u8>>,
    pub source: ChunkSource,
    pub source_host: Option<String>,
}

impl Chunk {
    /// `hash == SHA-256(bytes)` and `offset < data_size` (spec §3 invariant).
    /// Construction never panics on violation — callers decide whether to
    /// trust chunks from untrusted sources; this is the check they call.
    pub fn verify_hash(&self) -> bool {
        if self.offset >= self.data_size {
            return false;
        }
        let digest: [u8; 32] = Sha256::digest(&self.bytes).into();
        digest == self.hash
    }

    pub fn sha256(bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(bytes).into()
    }
}

/// `{dataRoot, id?, dataSize, weaveOffset}` — locates a transaction in the
/// weave (spec §3). `id` may be absent when the boundary was established
/// purely by `tx_path` validation of peer-supplied data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxBoundary {
    pub data_root: String,
    pub id: Option<String>,
    pub data_size: u64,
    pub weave_offset: u64,
}

/// Fields shared by every `ChunkRetrievalResult` variant (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunkFields {
    pub chunk: Chunk,
    pub data_root: String,
    pub data_size: u64,
    pub weave_offset: u64,
    pub relative_offset: u64,
    pub contiguous_data_start_delimiter: u64,
}

/// Tagged result of `retrieveChunk` (spec §3, §4.H).
///
/// The spec's source history used both "fallback" and "boundary_fetch" as
/// names for the same variant (§9 Open Question (a)); this workspace picks
/// one name, `BoundaryFetch`, and treats the two as synonyms by definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkRetrievalResult {
    CacheHit(RetrievedChunkFields),
    TxPathValidated(RetrievedChunkFields),
    BoundaryFetch {
        #[serde(flatten)]
        fields: RetrievedChunkFields,
        tx_id: Option<String>,
    },
}

impl ChunkRetrievalResult {
    pub fn fields(&self) -> &RetrievedChunkFields {
        match self {
            Self::CacheHit(f) | Self::TxPathValidated(f) => f,
            Self::BoundaryFetch { fields, .. } => fields,
        }
    }

    /// True exactly when `type in {boundary_fetch}` (the sole carrier of the
    /// fallback/boundary_fetch synonym pair) and a tx id is present.
    pub fn has_tx_id(&self) -> bool {
        matches!(self, Self::BoundaryFetch { tx_id: Some(_), .. })
    }

    /// True for `cache_hit` and `tx_path_validated` — the two variants that
    /// never touch the boundary-lookup-then-fetch pipeline.
    pub fn used_fast_path(&self) -> bool {
        matches!(self, Self::CacheHit(_) | Self::TxPathValidated(_))
    }
}
