//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by the write-back page cache.
///
/// Variants map directly onto the error kinds in the design's error-handling
/// section: argument errors fail fast with no state change, I/O errors are
/// returned and (on the flusher) also reported through the background
/// exception event, shutdown timeouts are a hard error, and interruption
/// preserves the caller's intent to stop.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown file: {0}")]
    UnknownFile(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(std::time::Duration),

    #[error("operation interrupted")]
    Interrupted,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
