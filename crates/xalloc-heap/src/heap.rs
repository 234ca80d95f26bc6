//! Main + temp pool pair behind the [`SysHeap`] boundary.

use log::{debug, error, info, warn};

use crate::backend::{Address, SysHeap};
use crate::config::PoolConfig;
use crate::error::HeapError;
use crate::flags::AllocFlags;
use crate::pool::MemoryPool;

/// The constrained heap backend.
///
/// Requests carrying [`AllocFlags::TEMP`] are served from the temp pool when
/// one is configured, keeping short-lived blocks from fragmenting the main
/// pool. Requests carrying [`AllocFlags::TOP`] are carved from high addresses.
#[derive(Debug)]
pub struct PoolHeap {
    main: MemoryPool,
    temp: Option<MemoryPool>,
    self_check: bool,
}

impl PoolHeap {
    pub fn new(config: &PoolConfig) -> Result<Self, HeapError> {
        config.validate()?;
        let main = MemoryPool::new(config.main_size, config.granularity, false)?;
        let temp = if config.temp_size > 0 {
            Some(MemoryPool::new(config.temp_size, config.granularity, true)?)
        } else {
            None
        };
        info!(
            "pool heap ready: main={}B temp={}B granularity={}",
            main.size(),
            temp.as_ref().map_or(0, MemoryPool::size),
            config.granularity
        );
        Ok(Self {
            main,
            temp,
            self_check: config.self_check,
        })
    }

    #[must_use]
    pub fn main(&self) -> &MemoryPool {
        &self.main
    }

    #[must_use]
    pub fn temp(&self) -> Option<&MemoryPool> {
        self.temp.as_ref()
    }

    #[must_use]
    pub fn granularity(&self) -> usize {
        self.main.granularity()
    }

    /// Pool a request with `flags` is served from.
    #[must_use]
    pub fn pool(&self, flags: AllocFlags) -> &MemoryPool {
        match &self.temp {
            Some(temp) if flags.contains(AllocFlags::TEMP) => temp,
            _ => &self.main,
        }
    }

    fn pool_mut(&mut self, flags: AllocFlags) -> &mut MemoryPool {
        match &mut self.temp {
            Some(temp) if flags.contains(AllocFlags::TEMP) => temp,
            _ => &mut self.main,
        }
    }

    /// Pool whose region contains `addr`.
    #[must_use]
    pub fn owner(&self, addr: Address) -> Option<&MemoryPool> {
        if self.main.contains(addr) {
            return Some(&self.main);
        }
        self.temp.as_ref().filter(|temp| temp.contains(addr))
    }

    fn owner_mut(&mut self, addr: Address) -> Option<&mut MemoryPool> {
        if self.main.contains(addr) {
            return Some(&mut self.main);
        }
        self.temp.as_mut().filter(|temp| temp.contains(addr))
    }

    pub fn alloc(
        &mut self,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Result<Address, HeapError> {
        let ptr = self.pool_mut(flags).alloc(
            size,
            align,
            flags.contains(AllocFlags::TOP),
            flags.contains(AllocFlags::TEMP),
        )?;
        self.audit("alloc");
        Ok(ptr)
    }

    pub fn free(&mut self, ptr: Address) -> Result<(), HeapError> {
        self.owner_mut(ptr)
            .ok_or(HeapError::InvalidAddress(ptr))?
            .free(ptr)?;
        self.audit("free");
        Ok(())
    }

    /// Resizes in place when the block already lives in the pool `flags`
    /// select and its alignment covers `align`; otherwise allocates a new
    /// block, copies the surviving prefix and frees the old one.
    pub fn realloc(
        &mut self,
        ptr: Address,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Result<Address, HeapError> {
        let owner = self.owner(ptr).ok_or(HeapError::InvalidAddress(ptr))?;
        let record = owner.allocation(ptr).ok_or(HeapError::InvalidAddress(ptr))?;
        let same_pool = owner.is_temp() == self.pool(flags).is_temp();

        if same_pool && align <= record.align {
            let pool = self.pool_mut(flags);
            match pool.realloc_in_place(ptr, size) {
                Ok(moved) => {
                    self.audit("realloc");
                    return Ok(moved);
                }
                Err(HeapError::NoRoomInPlace) => {}
                Err(err) => return Err(err),
            }
        }

        let fresh = self.alloc(size, align, flags)?;
        let keep = record.size.min(size);
        let saved = self
            .bytes(ptr, keep)
            .map(<[u8]>::to_vec)
            .ok_or(HeapError::InvalidAddress(ptr))?;
        self.bytes_mut(fresh, keep)
            .ok_or(HeapError::InvalidAddress(fresh))?
            .copy_from_slice(&saved);
        self.free(ptr)?;
        debug!("realloc moved {ptr:#x} -> {fresh:#x} ({keep} bytes kept)");
        Ok(fresh)
    }

    /// Audits both pools.
    pub fn check(&self) -> Result<(), HeapError> {
        self.main.check()?;
        if let Some(temp) = &self.temp {
            temp.check()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn avail(&self, flags: AllocFlags) -> usize {
        self.pool(flags).avail()
    }

    #[must_use]
    pub fn contig(&self, flags: AllocFlags) -> usize {
        self.pool(flags).contig()
    }

    fn audit(&self, op: &str) {
        if !self.self_check {
            return;
        }
        if let Err(err) = self.check() {
            error!("pool self-check failed after {op}: {err}");
            panic!("pool self-check failed after {op}: {err}");
        }
    }
}

fn report(op: &str, err: &HeapError) {
    match err {
        HeapError::Corrupted { .. } => error!("{op}: {err}"),
        HeapError::InvalidAddress(_) => warn!("{op}: {err}"),
        _ => debug!("{op}: {err}"),
    }
}

impl SysHeap for PoolHeap {
    fn sys_alloc(&mut self, size: usize, align: usize, flags: AllocFlags) -> Option<Address> {
        self.alloc(size, align, flags)
            .map_err(|err| report("sys_alloc", &err))
            .ok()
    }

    fn sys_realloc(
        &mut self,
        ptr: Address,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Option<Address> {
        self.realloc(ptr, size, align, flags)
            .map_err(|err| report("sys_realloc", &err))
            .ok()
    }

    fn sys_free(&mut self, ptr: Address) {
        if let Err(err) = self.free(ptr) {
            report("sys_free", &err);
        }
    }

    fn sys_avail(&self, flags: AllocFlags) -> Option<usize> {
        Some(self.avail(flags))
    }

    fn sys_contig(&self, flags: AllocFlags) -> Option<usize> {
        Some(self.contig(flags))
    }

    fn sys_max_align(&self) -> usize {
        self.granularity()
    }

    fn bytes(&self, addr: Address, len: usize) -> Option<&[u8]> {
        self.owner(addr)?.bytes(addr, len)
    }

    fn bytes_mut(&mut self, addr: Address, len: usize) -> Option<&mut [u8]> {
        self.owner_mut(addr)?.bytes_mut(addr, len)
    }
}
