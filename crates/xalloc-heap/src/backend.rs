//! Boundary contract between the extended allocator and a byte supplier.

use crate::flags::AllocFlags;

/// An address handed out by a backend.
///
/// Backends return real addresses into memory they own; all reads and writes
/// go back through [`SysHeap::bytes`] / [`SysHeap::bytes_mut`], which bounds-check
/// the range against the backend's regions.
pub type Address = usize;

/// A low-level supplier of byte ranges.
///
/// Every method reports failure through a sentinel (`None`) instead of an
/// error; callers decide whether to retry, fall back or give up.
/// Implementations are single-threaded; callers serialize access.
pub trait SysHeap {
    /// Reserve `size` bytes aligned to `align` (a power of two no larger than
    /// [`SysHeap::sys_max_align`]).
    fn sys_alloc(&mut self, size: usize, align: usize, flags: AllocFlags) -> Option<Address>;

    /// Resize the region starting at `ptr`, preserving its contents up to the
    /// smaller of the old and new sizes. On failure the original region is
    /// left untouched.
    fn sys_realloc(
        &mut self,
        ptr: Address,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Option<Address>;

    /// Release a region previously returned by this backend.
    fn sys_free(&mut self, ptr: Address);

    /// Free bytes in the pool selected by `flags`, or `None` if unknown.
    fn sys_avail(&self, flags: AllocFlags) -> Option<usize>;

    /// Largest contiguous free run in the pool selected by `flags`, or `None`
    /// if unknown.
    fn sys_contig(&self, flags: AllocFlags) -> Option<usize>;

    /// Maximum alignment the backend satisfies natively.
    fn sys_max_align(&self) -> usize;

    /// Read access to `len` bytes at `addr`, if the whole range is owned.
    fn bytes(&self, addr: Address, len: usize) -> Option<&[u8]>;

    /// Write access to `len` bytes at `addr`, if the whole range is owned.
    fn bytes_mut(&mut self, addr: Address, len: usize) -> Option<&mut [u8]>;
}

impl<T: SysHeap + ?Sized> SysHeap for Box<T> {
    fn sys_alloc(&mut self, size: usize, align: usize, flags: AllocFlags) -> Option<Address> {
        (**self).sys_alloc(size, align, flags)
    }

    fn sys_realloc(
        &mut self,
        ptr: Address,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Option<Address> {
        (**self).sys_realloc(ptr, size, align, flags)
    }

    fn sys_free(&mut self, ptr: Address) {
        (**self).sys_free(ptr);
    }

    fn sys_avail(&self, flags: AllocFlags) -> Option<usize> {
        (**self).sys_avail(flags)
    }

    fn sys_contig(&self, flags: AllocFlags) -> Option<usize> {
        (**self).sys_contig(flags)
    }

    fn sys_max_align(&self) -> usize {
        (**self).sys_max_align()
    }

    fn bytes(&self, addr: Address, len: usize) -> Option<&[u8]> {
        (**self).bytes(addr, len)
    }

    fn bytes_mut(&mut self, addr: Address, len: usize) -> Option<&mut [u8]> {
        (**self).bytes_mut(addr, len)
    }
}
