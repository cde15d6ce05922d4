use thiserror::Error;

/// Reason a chunk retrieval ultimately failed, per the retrieval pipeline's
/// tagged failure contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkNotFoundKind {
    OffsetLookupFailed,
    TxNotFound,
    BoundaryNotFound,
    FetchFailed,
}

impl std::fmt::Display for ChunkNotFoundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OffsetLookupFailed => "offset_lookup_failed",
            Self::TxNotFound => "tx_not_found",
            Self::BoundaryNotFound => "boundary_not_found",
            Self::FetchFailed => "fetch_failed",
        };
        f.write_str(s)
    }
}

/// Which axis of the two-axis rate limiter rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKind {
    Resource,
    Ip,
}

impl std::fmt::Display for RateLimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Resource => "resource",
            Self::Ip => "ip",
        };
        f.write_str(s)
    }
}

/// Core internal error type shared across the data-plane crates.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("chunk not found: {0}")]
    ChunkNotFound(ChunkNotFoundKind),

    #[error("rate limited on {0} axis")]
    RateLimited(RateLimitKind),

    #[error("operation cancelled")]
    Cancelled,

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("messagepack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("messagepack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    /// True for the class of errors that a fallback tier should treat as
    /// "this sub-source had nothing" rather than a hard failure — everything
    /// except cancellation, which must always propagate (§4.E, §5).
    pub fn is_transient(&self) -> bool {
        !matches!(self, AppError::Cancelled)
    }

    /// True when this error represents a missing file/object rather than a
    /// genuine failure — the sharded CDB64 index downgrades this to "skip
    /// this shard" (§4.C) instead of treating it as fatal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
            || matches!(self, AppError::NotFound(_))
            || matches!(self, AppError::ObjectStore(object_store::Error::NotFound { .. }))
    }
}
