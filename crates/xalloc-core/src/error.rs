//! Facade errors.

use thiserror::Error;
use xalloc_heap::Address;

/// Failure reported by an [`crate::ExtendedAllocator`] operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("request of {0} bytes overflows the padded block size")]
    SizeOverflow(usize),
    #[error("backend could not supply {size} bytes aligned to {align}")]
    OutOfMemory { size: usize, align: usize },
    #[error("injected failure on call {call}")]
    InjectedFailure { call: u64 },
    #[error("pointer {0:#x} is not a live allocation")]
    UnknownPointer(Address),
    #[error("access of {len} bytes at {ptr:#x} exceeds the {size}-byte block")]
    OutOfBounds { ptr: Address, len: usize, size: usize },
    #[error("corrupt block at {ptr:#x}: {reason}")]
    Corrupted { ptr: Address, reason: &'static str },
    #[error("checkpoint is stale or belongs to another allocator")]
    StaleCheckpoint,
}

impl AllocError {
    /// Exhaustion-class failures: the request was valid but not satisfiable.
    #[must_use]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. } | Self::InjectedFailure { .. })
    }
}
