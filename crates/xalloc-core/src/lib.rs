//! # xalloc-core
//!
//! Debug-instrumented extended allocator.
//!
//! [`ExtendedAllocator`] adds arbitrary power-of-two alignment, zero-fill,
//! a temp-pool hint and per-allocation source sites on top of any
//! [`SysHeap`] backend. Each block carries an in-band [`BlockHeader`] below
//! the user pointer. With tracking enabled every live block also sits on a
//! [`LiveList`], which backs leak reports, usage maps, checkpoints and
//! paranoid free validation.
//!
//! The test control surface (`test_*` methods) injects deterministic
//! failures, forces allocation results and snapshots the live list.
//!
//! [`global`] holds the process-wide instance used by the C ABI.

#![deny(unsafe_code)]

pub mod allocator;
pub mod config;
pub mod error;
pub mod global;
pub mod header;
pub mod inject;
pub mod live_list;
pub mod map;
pub mod system;
pub mod trace;

pub use allocator::{ExtendedAllocator, FREED_POISON, FRESH_POISON, LiveAllocation};
pub use config::{AllocatorConfig, DEFAULT_ALIGN, DebugLevel};
pub use error::AllocError;
pub use global::{Backend, InitError, TeardownReport};
pub use header::{BlockHeader, HEADER_SIZE};
pub use inject::FailurePlan;
pub use live_list::{Checkpoint, LiveBlock, LiveList};
pub use map::{MapExtent, Site, UsageTag};
pub use system::SystemHeap;
pub use trace::{AllocTraceRecord, TraceLevel};
pub use xalloc_heap::{AllocFlags, Address, PoolConfig, PoolHeap, SysHeap};
