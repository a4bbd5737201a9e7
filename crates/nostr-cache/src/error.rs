//! Error types for the layered cache.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Storage error kinds (spec.md §7 "Storage"): the policy is to evict the
/// corrupted entry and continue without cache, never to propagate a disk
/// failure out of a read/write path that has a perfectly good fallback.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("disk cache error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("entry corrupted at key {0}")]
    Corrupted(String),
}
