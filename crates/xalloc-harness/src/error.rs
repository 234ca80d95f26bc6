//! Harness errors.

use thiserror::Error;
use xalloc_core::AllocError;
use xalloc_heap::HeapError;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("pool setup failed: {0}")]
    Setup(#[from] HeapError),
    #[error("allocator error at step {step}: {source}")]
    Alloc { step: u64, source: AllocError },
    #[error("invariant violated at step {step}: {reason}")]
    Invariant { step: u64, reason: String },
    #[error("report serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
