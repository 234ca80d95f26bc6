//! # xalloc-heap
//!
//! Pool-based heap backend for the xalloc extended allocator.
//!
//! A [`MemoryPool`] carves a fixed, contiguous byte region into blocks of a
//! fixed granularity. Free blocks sit on an address-ordered free list and are
//! coalesced eagerly, so no two physically adjacent blocks are ever both free.
//! [`PoolHeap`] pairs a "main" pool with an optional "temp" pool that isolates
//! short-lived allocations, and implements the [`SysHeap`] boundary the
//! façade in `xalloc-core` consumes.
//!
//! The heap is single-threaded by contract: it performs no internal locking.
//! Callers serialize access (the façade holds a lock around every call).
//!
//! No `unsafe` code is permitted in this crate. Block descriptors live in a
//! table indexed by unit offset instead of inside the pool bytes.

#![deny(unsafe_code)]

pub mod area;
pub mod backend;
pub mod config;
pub mod error;
pub mod flags;
pub mod heap;
pub mod pool;

pub use area::{AREA_HEADER_SIZE, AREA_MAGIC, Allocation, AreaInfo};
pub use backend::{Address, SysHeap};
pub use config::{DEFAULT_GRANULARITY, MIN_GRANULARITY, PoolConfig};
pub use error::HeapError;
pub use flags::AllocFlags;
pub use heap::PoolHeap;
pub use pool::{BlockInfo, MemoryPool, PoolStats};

/// Rounds `value` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_already_aligned() {
        assert_eq!(align_up(0x1000, 16), 0x1000);
    }

    #[test]
    fn align_up_rounds() {
        assert_eq!(align_up(0x1001, 16), 0x1010);
        assert_eq!(align_up(17, 64), 64);
    }

    #[test]
    fn align_up_zero() {
        assert_eq!(align_up(0, 64), 0);
    }
}
