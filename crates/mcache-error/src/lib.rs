#![forbid(unsafe_code)]
//! Error types for the mirrored buffer cache.
//!
//! Defines `CacheError` and a `Result<T>` alias used throughout the
//! workspace.

use thiserror::Error;

/// Unified error type for cache and serializer operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk state failed validation (CRC mismatch, unknown patch kind,
    /// inconsistent replay version). Fatal: the cache refuses to open.
    #[error("corrupt data at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("block {0} is out of range for this device")]
    BlockOutOfRange(u64),

    #[error("no free block IDs left on device")]
    NoSpace,

    #[error("cache is shutting down")]
    ShuttingDown,
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;
