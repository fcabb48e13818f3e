//! Allocation failures

use thiserror::Error;


/// Reasons why an allocation request could not be satisfied
///
/// None of these conditions is transient, so the allocator never retries
/// internally: a failed request leaves no partially updated state behind.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AllocError {
    /// The operating system refused to map more memory
    #[error("failed to map {size} bytes of memory from the operating system")]
    Map {
        /// Requested mapping size in bytes
        size: usize,

        /// Underlying OS error
        #[source]
        source: region::Error,
    },

    /// A size class reached its arena limit and every arena is full
    #[error("all {arenas} arenas of the {block_size}-byte size class are full")]
    PoolExhausted {
        /// Block size of the saturated pool
        block_size: usize,

        /// Number of arenas owned by that pool
        arenas: usize,
    },

    /// The requested number of bytes cannot be represented
    #[error("allocating {count} elements of {elem_size} bytes overflows usize")]
    CapacityOverflow {
        /// Requested element count
        count: usize,

        /// Size of one element in bytes
        elem_size: usize,
    },

    /// The element type needs more alignment than OS mappings provide
    #[error("alignment of {align} bytes exceeds the {page_size}-byte page alignment")]
    UnsupportedAlignment {
        /// Requested alignment in bytes
        align: usize,

        /// Alignment of OS mappings in bytes
        page_size: usize,
    },
}
