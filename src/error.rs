//! Error types for heapfile
//!
//! Provides a unified error type for the address space and both allocators.
//!
//! None of the variants are retried internally. A failure that happens in the
//! middle of a multi-step boundary-tag rewrite leaves the heap inconsistent;
//! there is no rollback.

use thiserror::Error;

/// Result type alias using HeapError
pub type Result<T> = std::result::Result<T, HeapError>;

/// Unified error type for heapfile operations
#[derive(Debug, Error)]
pub enum HeapError {
    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    /// Malformed size, misaligned or out-of-range address, corrupt header or
    /// boundary tag.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Mutation of a read-only space, or an allocator protocol violation
    /// such as closing a block that was never opened.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    /// Mapping, remapping, resizing or flushing the backing file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HeapError {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        HeapError::InvalidArgument(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        HeapError::InvalidState(msg.into())
    }
}
