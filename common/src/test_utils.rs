//! Fixture builders shared by every crate's test suite. Gated behind the
//! `test-utils` feature and pulled in as a dev-dependency, mirroring the
//! teacher's `common = { path = "../common", features = ["test-utils"] }`
//! convention.

use crate::model::{Chunk, ChunkSource, TxBoundary};

/// Build a well-formed chunk of `len` bytes whose hash and offset invariants
/// hold, filled with a repeating byte so assertions can distinguish chunks.
pub fn fixture_chunk(fill: u8, len: usize, offset: u64, data_size: u64, source: ChunkSource) -> Chunk {
    let bytes = bytes::Bytes::from(vec![fill; len]);
    let hash = Chunk::sha256(&bytes);
    Chunk {
        bytes,
        data_root: [fill; 32],
        data_size,
        data_path: vec![0xaa, 0xbb],
        offset,
        hash,
        tx_path: None,
        source,
        source_host: None,
    }
}

pub fn fixture_boundary(data_root: &str, id: Option<&str>, data_size: u64, weave_offset: u64) -> TxBoundary {
    TxBoundary {
        data_root: data_root.to_string(),
        id: id.map(str::to_string),
        data_size,
        weave_offset,
    }
}
