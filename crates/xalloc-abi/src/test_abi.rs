//! ABI layer for the test control surface (`xalloc_test_*`).
//!
//! Checkpoints are opaque on the Rust side, so C callers get a numeric
//! handle instead; `0` is never a valid handle.

use std::collections::HashMap;
use std::ffi::{c_int, c_void};
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use parking_lot::Mutex;
use xalloc_core::global;
use xalloc_core::{Checkpoint, FailurePlan};

use crate::util::to_address;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);
static CHECKPOINTS: Mutex<Option<HashMap<u64, Checkpoint>>> = parking_lot::const_mutex(None);

abi_fn! {
    /// Fails the `after`-th growing allocation, then every `repeat` calls.
    /// `after == 0` disables injection.
    fn xalloc_test_fail_after(after: u64, repeat: u64, include_shrink: c_int) {
        let Some(allocator) = global::try_global() else {
            return;
        };
        let plan = (after > 0).then(|| {
            let plan = FailurePlan::every(after, repeat);
            if include_shrink != 0 { plan.with_shrink() } else { plan }
        });
        allocator.test_fail_after(plan);
    }
}

abi_fn! {
    /// Makes the next allocation return `ptr` when compatible. Null clears.
    fn xalloc_test_set_next_alloc(ptr: *mut c_void) -> c_int {
        let Some(allocator) = global::try_global() else {
            return -1;
        };
        match allocator.test_set_next_alloc(to_address(ptr)) {
            Ok(()) => 0,
            Err(err) => {
                warn!("xalloc_test_set_next_alloc: {err}");
                -1
            }
        }
    }
}

abi_fn! {
    fn xalloc_test_fail_sys(fail: c_int) {
        if let Some(allocator) = global::try_global() {
            allocator.test_fail_sys(fail != 0);
        }
    }
}

abi_fn! {
    /// Overrides `avail`/`contig`; a negative value restores real reporting.
    fn xalloc_test_set_avail(avail: isize) {
        if let Some(allocator) = global::try_global() {
            allocator.test_set_avail(usize::try_from(avail).ok());
        }
    }
}

abi_fn! {
    /// Hides all live blocks and returns a handle for
    /// [`xalloc_test_restore`], or 0 when uninitialized.
    fn xalloc_test_checkpoint() -> u64 {
        let Some(allocator) = global::try_global() else {
            return 0;
        };
        let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
        CHECKPOINTS
            .lock()
            .get_or_insert_with(HashMap::new)
            .insert(handle, allocator.test_checkpoint());
        handle
    }
}

abi_fn! {
    /// Restores a checkpoint. Returns 0, or -1 for an unknown or stale handle.
    fn xalloc_test_restore(handle: u64) -> c_int {
        let taken = CHECKPOINTS.lock().as_mut().and_then(|map| map.remove(&handle));
        let Some(checkpoint) = taken else {
            return -1;
        };
        let Some(allocator) = global::try_global() else {
            return -1;
        };
        match allocator.test_restore(checkpoint) {
            Ok(()) => 0,
            Err(err) => {
                warn!("xalloc_test_restore: {err}");
                -1
            }
        }
    }
}
