//! Workload harness for xalloc.
//!
//! This crate provides:
//! - A seeded xorshift64* workload that storms a pool-backed allocator with
//!   mixed alloc / free / realloc / strdup traffic and audits the heap and
//!   the allocator's accounting after every step
//! - A serializable [`StormReport`] summarizing a run
//! - Usage-map rendering of the pool a workload leaves behind

#![forbid(unsafe_code)]

pub mod error;
pub mod report;
pub mod workload;

pub use error::HarnessError;
pub use report::{PoolSnapshot, StormReport};
pub use workload::{Workload, WorkloadConfig, XorShift64};
