use core::alloc::Layout;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SplitMapError {
    /// The computed table capacity exceeds the collection's maximum
    /// (usually `isize::MAX` bytes).
    #[error("hash table capacity overflow")]
    CapacityOverflow,
    /// The allocator failed to produce bucket storage.
    #[error("bucket allocation of {} bytes failed", layout.size())]
    Alloc {
        /// The layout of the allocation request that failed.
        layout: Layout,
    },
}

pub type Result<T> = std::result::Result<T, SplitMapError>;
