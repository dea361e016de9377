//! Error types for raw memory access and owned allocations.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// An access would read or write past the known end of a region.
    #[error("out of bounds: offset {offset} + {size} bytes exceeds region of {len} bytes")]
    OutOfBounds {
        offset: usize,
        size: usize,
        len: usize,
    },

    /// The backing address of the region is NULL.
    #[error("NULL pointer dereference at offset {offset}")]
    NullDereference { offset: usize },

    /// The allocator could not satisfy the request.
    #[error("failed to allocate {bytes} bytes")]
    AllocationFailed { bytes: usize },

    /// A managed allocation was explicitly freed more than once.
    #[error("memory has already been freed")]
    AlreadyFreed,
}

pub type Result<T> = std::result::Result<T, MemoryError>;
