//! Heap error types.
//!
//! Out-of-memory is the only failure the heap reports to the embedder at
//! run time. Broken marking invariants (an illegal bitmap pattern, a black
//! object turned white, an impossible state transition) are programming
//! errors and panic; embedders that want them to be fatal build with
//! `panic = "abort"`.

use std::fmt;
use std::io;

/// Result alias for fallible heap operations.
pub type HeapResult<T> = Result<T, HeapError>;

/// Errors surfaced by the heap.
#[derive(Debug)]
pub enum HeapError {
    /// The allocation could not be satisfied, even after a full collection.
    OutOfMemory {
        /// Bytes requested by the failing allocation.
        requested: usize,
        /// Committed heap bytes at the time of failure.
        committed: usize,
        /// Configured heap limit.
        limit: usize,
    },
    /// The memory backend failed to map or release pages.
    Backend(io::Error),
    /// The requested allocation size is not supported.
    InvalidSize(usize),
    /// The heap was configured single-threaded and cannot hand out
    /// additional thread-local heaps.
    SingleThreaded,
    /// The heap has been torn down.
    TornDown,
}

impl HeapError {
    /// Returns `true` for [`HeapError::OutOfMemory`].
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                committed,
                limit,
            } => write!(
                f,
                "out of memory: requested {requested} bytes with {committed} of {limit} bytes committed"
            ),
            Self::Backend(err) => write!(f, "page backend failure: {err}"),
            Self::InvalidSize(size) => write!(f, "invalid allocation size: {size}"),
            Self::SingleThreaded => {
                f.write_str("heap is single-threaded and has no background local heaps")
            }
            Self::TornDown => f.write_str("heap has been torn down"),
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for HeapError {
    fn from(err: io::Error) -> Self {
        Self::Backend(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_out_of_memory() {
        let err = HeapError::OutOfMemory {
            requested: 64,
            committed: 1024,
            limit: 1024,
        };
        assert!(err.is_out_of_memory());
        assert_eq!(
            err.to_string(),
            "out of memory: requested 64 bytes with 1024 of 1024 bytes committed"
        );
    }

    #[test]
    fn test_backend_source() {
        use std::error::Error;
        let err = HeapError::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!err.is_out_of_memory());
        assert!(err.source().is_some());
    }
}
