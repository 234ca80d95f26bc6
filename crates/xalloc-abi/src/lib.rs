// All extern "C" exports accept raw pointers from C callers and validate them
// against the allocator before use.
#![allow(clippy::missing_safety_doc)]
//! # xalloc-abi
//!
//! C-compatible boundary over the process-wide xalloc allocator.
//!
//! ```text
//! C caller -> ABI entry (this crate) -> xalloc_core::global -> ExtendedAllocator -> backend
//! ```
//!
//! Every entry point fails soft: errors become a null pointer, `-1` or `0`
//! and are logged. Sizes are taken as signed integers so negative requests
//! can be rejected here instead of wrapping into huge unsigned ones.

#[macro_use]
mod macros;

pub mod mem_abi;
pub mod test_abi;
mod util;
