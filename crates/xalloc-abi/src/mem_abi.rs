//! ABI layer for the allocation entry points (`xalloc_mem_*`) and the
//! process-wide lifecycle (`xalloc_init`, `xalloc_teardown`).
//!
//! Pointers returned here are real addresses inside the configured backend,
//! so C callers read and write them directly.

use std::ffi::{c_char, c_int, c_void};

use log::warn;
use xalloc_core::global::{self, Backend};
use xalloc_core::{AllocatorConfig, PoolConfig};

use crate::util::{
    c_bytes, flags_from_c, site_from_c, size_from_c, to_address, to_ptr, to_signed,
};

abi_fn! {
    /// Installs the allocator. `main_bytes == 0` selects the system backend;
    /// otherwise a pool backend with the given main and temp sizes. Debug
    /// switches come from the environment. Returns 0 on success, -1 otherwise.
    fn xalloc_init(main_bytes: usize, temp_bytes: usize) -> c_int {
        let backend = if main_bytes == 0 {
            Backend::System
        } else {
            Backend::Pool(PoolConfig::single(main_bytes).with_temp(temp_bytes))
        };
        match global::init(backend, AllocatorConfig::from_env()) {
            Ok(()) => 0,
            Err(err) => {
                warn!("xalloc_init: {err}");
                -1
            }
        }
    }
}

abi_fn! {
    /// Installs the allocator configured entirely from `XALLOC_*` variables.
    fn xalloc_init_from_env() -> c_int {
        match global::init_from_env() {
            Ok(()) => 0,
            Err(err) => {
                warn!("xalloc_init_from_env: {err}");
                -1
            }
        }
    }
}

abi_fn! {
    /// Tears the allocator down. Returns the number of leaked blocks, or -1
    /// when nothing was installed.
    fn xalloc_teardown() -> isize {
        global::teardown().map_or(-1, |report| to_signed(Some(report.leaked.len())))
    }
}

abi_fn! {
    fn xalloc_mem_alloc(
        size: isize,
        align: usize,
        flags: u32,
        file: *const c_char,
        line: c_int,
        info: c_int,
    ) -> *mut c_void {
        let Some(size) = size_from_c("xalloc_mem_alloc", size) else {
            return std::ptr::null_mut();
        };
        let site = site_from_c(file, line, info);
        to_ptr(global::mem_alloc(size, align, flags_from_c(flags), site))
    }
}

abi_fn! {
    fn xalloc_mem_free(ptr: *mut c_void) {
        global::mem_free(to_address(ptr));
    }
}

abi_fn! {
    /// On failure returns null and leaves `ptr` valid.
    fn xalloc_mem_realloc(
        ptr: *mut c_void,
        size: isize,
        flags: u32,
        file: *const c_char,
        line: c_int,
        info: c_int,
    ) -> *mut c_void {
        let Some(size) = size_from_c("xalloc_mem_realloc", size) else {
            return std::ptr::null_mut();
        };
        let site = site_from_c(file, line, info);
        to_ptr(global::mem_realloc(to_address(ptr), size, flags_from_c(flags), site))
    }
}

abi_fn! {
    fn xalloc_mem_strdup(
        s: *const c_char,
        flags: u32,
        file: *const c_char,
        line: c_int,
        info: c_int,
    ) -> *mut c_char {
        let bytes = c_bytes(s);
        let site = site_from_c(file, line, info);
        to_ptr(global::mem_strdup(bytes, flags_from_c(flags), site)).cast()
    }
}

abi_fn! {
    /// Usable free bytes in the pool `flags` select; -1 when unknown.
    fn xalloc_mem_avail(flags: u32) -> isize {
        to_signed(global::mem_avail(flags_from_c(flags)))
    }
}

abi_fn! {
    /// Largest single request the pool `flags` select can satisfy; -1 when
    /// unknown.
    fn xalloc_mem_contig(flags: u32) -> isize {
        to_signed(global::mem_contig(flags_from_c(flags)))
    }
}

abi_fn! {
    fn xalloc_mem_bytes_allocated() -> usize {
        global::try_global().map_or(0, |a| a.bytes_allocated())
    }
}

abi_fn! {
    /// Logs every live allocation and returns how many there are.
    fn xalloc_mem_report() -> usize {
        global::try_global().map_or(0, |a| a.report_allocs().len())
    }
}

abi_fn! {
    /// Writes the dominant usage-tag code of each of `buckets` slices of
    /// `[base, base + size)` into `out` (`-1` for free). Returns 0, or -1
    /// when uninitialized or `out` is null.
    fn xalloc_mem_get_map(
        base: *const c_void,
        size: usize,
        out: *mut c_int,
        buckets: usize,
    ) -> c_int {
        if out.is_null() && buckets > 0 {
            return -1;
        }
        let Some(allocator) = global::try_global() else {
            return -1;
        };
        let tags = allocator.get_map(base as usize, size, buckets);
        for (i, tag) in tags.iter().enumerate() {
            // SAFETY: caller provides room for `buckets` entries.
            unsafe { *out.add(i) = tag.code() };
        }
        0
    }
}
