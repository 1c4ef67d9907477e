//! Failure signals shared by the memory and process managers.

use thiserror::Error;

/// Everything a caller can get back instead of the thing it asked for.
///
/// Allocation failures are returned, never panicked on; the caller
/// decides whether running out of memory is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// No free frame, block, or slab object is left to satisfy the request.
    #[error("out of physical memory")]
    OutOfMemory,
    /// Misaligned address, zero-size request, or malformed range.
    #[error("invalid argument")]
    InvalidArgument,
    /// A translation lookup hit an absent entry at either table level.
    #[error("address is not mapped")]
    NotMapped,
    /// The fixed-size process table has no free slot.
    #[error("process table is full")]
    ProcessTableFull,
}
