use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Tagged failure kinds surfaced by the engine. Recovery is local wherever
/// possible: a single skipped item, a dropped background write. Only a whole
/// query or a whole index cycle that cannot make progress reaches the host.
#[derive(Debug, Error)]
pub enum Error {
    /// The embedding provider could not produce a vector (network error,
    /// 5xx, malformed response, inference failure). Transient — the indexer
    /// skips the affected item for this cycle and never retries internally.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The durable cache tier failed. Reads degrade to a miss, writes are
    /// dropped; the in-memory tier keeps serving.
    #[error("embedding cache I/O: {0}")]
    CacheIo(#[source] sqlx::Error),

    /// The graph could not be rebuilt or persisted. Fatal for the calling
    /// search; the next search retries the rebuild.
    #[error("vector index rebuild failed: {0}")]
    IndexRebuildFailed(String),

    /// The metadata store failed. Aborts the current indexing job; the
    /// debounce re-schedules on the next inventory event.
    #[error("metadata store I/O: {0}")]
    MetadataIo(#[source] sqlx::Error),

    /// Programmer error (malformed input reaching a public seam).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// `shutdown()` has been observed; all public operations refuse work.
    #[error("shutdown in progress")]
    ShutdownInProgress,
}

impl Error {
    pub(crate) fn cache(e: sqlx::Error) -> Self {
        Self::CacheIo(e)
    }

    pub(crate) fn metadata(e: sqlx::Error) -> Self {
        Self::MetadataIo(e)
    }

    pub(crate) fn embedding(e: impl std::fmt::Display) -> Self {
        Self::EmbeddingUnavailable(e.to_string())
    }
}
