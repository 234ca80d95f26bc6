//! Pass-through backend over the global Rust allocator.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::collections::BTreeMap;

use log::warn;
use xalloc_heap::{AllocFlags, Address, SysHeap};

/// Alignment `std::alloc` is asked to honour directly; larger alignments are
/// padded by the facade.
pub const SYSTEM_MAX_ALIGN: usize = 16;

/// The default backend: every region comes straight from `std::alloc`.
///
/// Regions are recorded with their layouts so frees, reallocations and byte
/// access can be validated. `sys_avail` and `sys_contig` are unknown.
#[derive(Debug, Default)]
pub struct SystemHeap {
    regions: BTreeMap<Address, Layout>,
}

impl SystemHeap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of regions currently held.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn region_for(&self, addr: Address, len: usize) -> Option<()> {
        let (&start, layout) = self.regions.range(..=addr).next_back()?;
        let end = addr.checked_add(len)?;
        (end <= start + layout.size()).then_some(())
    }
}

impl SysHeap for SystemHeap {
    fn sys_alloc(&mut self, size: usize, align: usize, _flags: AllocFlags) -> Option<Address> {
        let layout = Layout::from_size_align(size.max(1), align.max(1)).ok()?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            return None;
        }
        let addr = ptr as Address;
        self.regions.insert(addr, layout);
        Some(addr)
    }

    fn sys_realloc(
        &mut self,
        ptr: Address,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Option<Address> {
        let old = *self.regions.get(&ptr)?;
        if align > old.align() {
            let fresh = self.sys_alloc(size, align, flags)?;
            let keep = old.size().min(size);
            // SAFETY: both regions are live, distinct and at least `keep` bytes long.
            unsafe { std::ptr::copy_nonoverlapping(ptr as *const u8, fresh as *mut u8, keep) };
            self.sys_free(ptr);
            return Some(fresh);
        }
        let layout = Layout::from_size_align(size.max(1), old.align()).ok()?;
        // SAFETY: `ptr` was allocated by `std::alloc` with `old`, and the new
        // size is non-zero and valid for `old.align()`.
        let moved = unsafe { alloc::realloc(ptr as *mut u8, old, layout.size()) };
        if moved.is_null() {
            return None;
        }
        self.regions.remove(&ptr);
        self.regions.insert(moved as Address, layout);
        Some(moved as Address)
    }

    fn sys_free(&mut self, ptr: Address) {
        match self.regions.remove(&ptr) {
            // SAFETY: the region was allocated by `std::alloc` with `layout`
            // and has just been forgotten, so it is freed exactly once.
            Some(layout) => unsafe { alloc::dealloc(ptr as *mut u8, layout) },
            None => warn!("system heap: free of unknown region {ptr:#x}"),
        }
    }

    fn sys_avail(&self, _flags: AllocFlags) -> Option<usize> {
        None
    }

    fn sys_contig(&self, _flags: AllocFlags) -> Option<usize> {
        None
    }

    fn sys_max_align(&self) -> usize {
        SYSTEM_MAX_ALIGN
    }

    fn bytes(&self, addr: Address, len: usize) -> Option<&[u8]> {
        self.region_for(addr, len)?;
        // SAFETY: `[addr, addr + len)` lies inside a live region owned by
        // `self`; the borrow of `self` keeps it from being freed.
        Some(unsafe { std::slice::from_raw_parts(addr as *const u8, len) })
    }

    fn bytes_mut(&mut self, addr: Address, len: usize) -> Option<&mut [u8]> {
        self.region_for(addr, len)?;
        // SAFETY: as in `bytes`, and the exclusive borrow of `self` rules out
        // any other view of the region.
        Some(unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, len) })
    }
}

impl Drop for SystemHeap {
    fn drop(&mut self) {
        for (addr, layout) in std::mem::take(&mut self.regions) {
            // SAFETY: every recorded region is live and owned by this heap.
            unsafe { alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}
