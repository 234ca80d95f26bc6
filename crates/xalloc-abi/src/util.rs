//! Shared internal utilities for ABI adapters.

use std::collections::BTreeSet;
use std::ffi::{CStr, c_char, c_int, c_void};

use parking_lot::Mutex;
use xalloc_core::{Address, AllocFlags, Site, UsageTag};

static FILE_NAMES: Mutex<BTreeSet<&'static str>> = parking_lot::const_mutex(BTreeSet::new());

/// Bytes of a NUL-terminated C string, terminator excluded. `None` for null.
///
/// # Safety
///
/// A non-null `ptr` must point to a readable NUL-terminated string that
/// outlives `'a`.
pub(crate) unsafe fn c_bytes<'a>(ptr: *const c_char) -> Option<&'a [u8]> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: caller guarantees a valid NUL-terminated string.
    let len = unsafe { libc::strlen(ptr) };
    // SAFETY: `len` bytes before the terminator are readable.
    Some(unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) })
}

/// Interns a C file name so sites can hold it for the process lifetime.
/// Each distinct name is leaked once.
///
/// # Safety
///
/// As for [`c_bytes`].
unsafe fn intern_file(file: *const c_char) -> &'static str {
    if file.is_null() {
        return Site::UNKNOWN.file;
    }
    // SAFETY: caller guarantees a valid NUL-terminated string.
    let name = unsafe { CStr::from_ptr(file) }.to_string_lossy();
    let mut names = FILE_NAMES.lock();
    if let Some(&known) = names.get(name.as_ref()) {
        return known;
    }
    let leaked: &'static str = Box::leak(name.into_owned().into_boxed_str());
    names.insert(leaked);
    leaked
}

/// Builds a [`Site`] from C call-site arguments.
///
/// # Safety
///
/// As for [`c_bytes`].
pub(crate) unsafe fn site_from_c(file: *const c_char, line: c_int, info: c_int) -> Site {
    // SAFETY: forwarded caller contract.
    let file = unsafe { intern_file(file) };
    Site::new(file, u32::try_from(line).unwrap_or(0), UsageTag::from_raw(info))
}

/// Unknown flag bits are ignored.
pub(crate) fn flags_from_c(flags: u32) -> AllocFlags {
    AllocFlags::from_bits_truncate(flags)
}

pub(crate) fn to_address(ptr: *const c_void) -> Option<Address> {
    (!ptr.is_null()).then_some(ptr as Address)
}

pub(crate) fn to_ptr(addr: Option<Address>) -> *mut c_void {
    addr.map_or(std::ptr::null_mut(), |a| a as *mut c_void)
}

/// Rejects negative sizes, which C callers produce by arithmetic underflow.
pub(crate) fn size_from_c(symbol: &str, size: isize) -> Option<usize> {
    let converted = usize::try_from(size).ok();
    if converted.is_none() {
        log::warn!("{symbol}: negative size {size} rejected");
    }
    converted
}

/// `usize` to a signed sentinel-carrying return value; `-1` for unknown.
pub(crate) fn to_signed(value: Option<usize>) -> isize {
    value.map_or(-1, |v| isize::try_from(v).unwrap_or(isize::MAX))
}
