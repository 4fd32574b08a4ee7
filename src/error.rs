use thiserror::Error;

/// Failures reported by the base allocator.
///
/// Every failing operation leaves the allocator exactly as it found it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BaseError {
    /// `alloc(0)` has no meaningful result and is rejected up front.
    #[error("zero-sized base allocation requested")]
    ZeroSize,

    /// The chunk source could not supply a chunk of `requested` bytes.
    #[error("chunk source could not supply {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Rounding `size` up to the cache line or chunk granularity overflows.
    #[error("allocation of {size} bytes overflows the address space")]
    SizeOverflow { size: usize },

    /// The chunk source advertises a granularity the allocator cannot use.
    #[error("chunk granularity {granularity} is not a power of two of at least two cache lines")]
    InvalidGranularity { granularity: usize },
}
