//! Pool backend errors.

use thiserror::Error;

use crate::backend::Address;

/// Failure reported by a pool operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("granularity {0} must be a power of two of at least 32 bytes")]
    InvalidGranularity(usize),
    #[error("pool of {size} bytes holds no {granularity}-byte blocks")]
    PoolTooSmall { size: usize, granularity: usize },
    #[error("alignment {align} exceeds block granularity {granularity}")]
    AlignmentUnsupported { align: usize, granularity: usize },
    #[error("no free run of {nblocks} blocks")]
    Exhausted { nblocks: usize },
    #[error("request of {0} bytes overflows block accounting")]
    SizeOverflow(usize),
    #[error("address {0:#x} is not an allocated block")]
    InvalidAddress(Address),
    #[error("block cannot be resized in place")]
    NoRoomInPlace,
    #[error("heap corruption at block {index}: {reason}")]
    Corrupted { index: usize, reason: &'static str },
}

impl HeapError {
    /// Returns true for structural damage, as opposed to an unsatisfiable request.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}
