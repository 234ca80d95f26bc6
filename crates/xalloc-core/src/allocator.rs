//! The extended allocator facade.
//!
//! Every request is normalized (alignment, zero size), padded so a
//! [`BlockHeader`] fits below the user pointer, and forwarded to a
//! [`SysHeap`] backend. Debug bookkeeping (live list, failure injection,
//! trace journal) lives in a separate book guarded by its own lock.
//!
//! Lock order is backend, then book. The book lock is never held while the
//! backend lock is acquired.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use xalloc_heap::{AllocFlags, Address, SysHeap};

use crate::config::AllocatorConfig;
use crate::error::AllocError;
use crate::header::{self, BlockHeader, HEADER_SIZE, PTR_SIZE, Padding};
use crate::inject::{FailurePlan, Injector};
use crate::live_list::{Checkpoint, LiveBlock, LiveList};
use crate::map::{self, MapExtent, Site, UsageTag};
use crate::trace::{AllocTraceRecord, TraceJournal, TraceLevel};

/// Fill byte for fresh and grown payload bytes when poisoning.
pub const FRESH_POISON: u8 = 0xCD;
/// Fill byte for released payloads when poisoning.
pub const FREED_POISON: u8 = 0xDD;

/// A live allocation as reported by [`ExtendedAllocator::report_allocs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveAllocation {
    pub ptr: Address,
    pub size: usize,
    pub align: usize,
    pub site: Site,
}

impl From<&LiveBlock> for LiveAllocation {
    fn from(block: &LiveBlock) -> Self {
        Self {
            ptr: block.ptr,
            size: block.size,
            align: block.align,
            site: block.site,
        }
    }
}

struct DebugBook {
    live: LiveList,
    inject: Injector,
    journal: TraceJournal,
}

/// Alignment- and debug-aware allocator over a [`SysHeap`] backend.
pub struct ExtendedAllocator<B: SysHeap> {
    backend: Mutex<B>,
    book: Mutex<DebugBook>,
    config: AllocatorConfig,
}

impl<B: SysHeap> ExtendedAllocator<B> {
    pub fn new(backend: B, config: AllocatorConfig) -> Self {
        let config = config.normalized();
        Self {
            backend: Mutex::new(backend),
            book: Mutex::new(DebugBook {
                live: LiveList::new(),
                inject: Injector::default(),
                journal: TraceJournal::new(config.trace),
            }),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Allocates `size` bytes aligned to `align` (`0` selects the default).
    ///
    /// Returns `Ok(None)` for `size == 0`.
    pub fn alloc(
        &self,
        size: usize,
        align: usize,
        flags: AllocFlags,
        site: Site,
    ) -> Result<Option<Address>, AllocError> {
        let align = self.effective_align(align)?;
        if size == 0 {
            return Ok(None);
        }

        let pending = {
            let mut book = self.book.lock();
            match book.inject.tick(true) {
                Some(call) => Err(call),
                None => Ok(book.inject.take_next_alloc()),
            }
        };
        let pending = match pending {
            Ok(pending) => pending,
            Err(call) => return Err(self.injected("alloc", None, size, call)),
        };
        if let Some(ptr) = pending {
            if let Some(ptr) = self.claim_override(ptr, size, align, flags, site)? {
                return Ok(Some(ptr));
            }
        }

        let anti = self.config.anti_coincidence;
        let mut backend = self.backend.lock();
        let pad = header::padded_request(size, align, backend.sys_max_align(), anti)
            .ok_or(AllocError::SizeOverflow(size))?;
        let base = self.sys_alloc(&mut backend, pad, flags, "alloc")?;
        let ptr = header::user_ptr(base, align, anti);
        let slot = self.track(LiveBlock {
            ptr,
            base,
            size,
            align,
            site,
        });
        let header = BlockHeader {
            base,
            align,
            size,
            ptr,
            slot,
        };
        if let Err(err) = self.install(&mut backend, &header, flags) {
            self.untrack(slot);
            backend.sys_free(base);
            return Err(err);
        }
        drop(backend);

        self.trace(
            TraceLevel::Trace,
            "alloc",
            "granted",
            Some(ptr),
            Some(size),
            "ok",
            format!("align={align} base={base:#x} site={site}"),
        );
        Ok(Some(ptr))
    }

    /// Releases `ptr`. `None` is a no-op.
    pub fn free(&self, ptr: Option<Address>) -> Result<(), AllocError> {
        let Some(ptr) = ptr else {
            return Ok(());
        };
        let mut backend = self.backend.lock();
        let header = self
            .read_header(&backend, ptr)
            .map_err(|err| self.corruption("free", ptr, err))?;
        self.verify_tracked("free", ptr, header.slot)?;
        if let Some(slot) = header.slot {
            self.book.lock().live.remove(slot);
        }

        if self.config.poison {
            self.fill_bytes(&mut backend, ptr, header.size, FREED_POISON)?;
        }
        self.write_header(&mut backend, ptr, &header.tombstone())?;
        backend.sys_free(header.base);
        drop(backend);

        self.trace(
            TraceLevel::Trace,
            "free",
            "released",
            Some(ptr),
            Some(header.size),
            "ok",
            format!("base={:#x}", header.base),
        );
        Ok(())
    }

    /// Resizes `ptr` to `size` bytes, keeping its alignment.
    ///
    /// `None` allocates; `size == 0` frees and returns `Ok(None)`. The live
    /// list keeps the block at its original position.
    pub fn realloc(
        &self,
        ptr: Option<Address>,
        size: usize,
        flags: AllocFlags,
        site: Site,
    ) -> Result<Option<Address>, AllocError> {
        let Some(ptr) = ptr else {
            return self.alloc(size, 0, flags, site);
        };
        if size == 0 {
            self.free(Some(ptr))?;
            return Ok(None);
        }

        let mut backend = self.backend.lock();
        let old = self
            .read_header(&backend, ptr)
            .map_err(|err| self.corruption("realloc", ptr, err))?;
        self.verify_tracked("realloc", ptr, old.slot)?;

        let growing = size > old.size;
        let injected = self.book.lock().inject.tick(growing);
        if let Some(call) = injected {
            drop(backend);
            return Err(self.injected("realloc", Some(ptr), size, call));
        }

        let anti = self.config.anti_coincidence;
        let align = old.align;
        let pad = header::padded_request(size, align, backend.sys_max_align(), anti)
            .ok_or(AllocError::SizeOverflow(size))?;
        let old_offset = ptr - old.base;
        let base = self.sys_realloc(&mut backend, old.base, pad, flags)?;
        let new_ptr = header::user_ptr(base, align, anti);

        let new_offset = new_ptr - base;
        if new_offset != old_offset {
            let keep = old.size.min(size);
            let region = backend.bytes_mut(base, pad.total).ok_or(AllocError::Corrupted {
                ptr: new_ptr,
                reason: "resized region is not addressable",
            })?;
            region.copy_within(old_offset..old_offset + keep, new_offset);
        }

        let header = BlockHeader {
            base,
            align,
            size,
            ptr: new_ptr,
            slot: old.slot,
        };
        self.write_header(&mut backend, new_ptr, &header)?;
        if growing {
            self.init_fill(&mut backend, new_ptr + old.size, size - old.size, flags)?;
        }
        if let Some(slot) = old.slot {
            self.book.lock().live.update(
                slot,
                LiveBlock {
                    ptr: new_ptr,
                    base,
                    size,
                    align,
                    site,
                },
            );
        }
        drop(backend);

        self.trace(
            TraceLevel::Trace,
            "realloc",
            if new_ptr == ptr { "resized" } else { "moved" },
            Some(new_ptr),
            Some(size),
            "ok",
            format!("from={ptr:#x} old_size={}", old.size),
        );
        Ok(Some(new_ptr))
    }

    /// Copies `s` into a fresh NUL-terminated block. `None` yields `None`.
    pub fn strdup(
        &self,
        s: Option<&[u8]>,
        flags: AllocFlags,
        site: Site,
    ) -> Result<Option<Address>, AllocError> {
        let Some(s) = s else {
            return Ok(None);
        };
        let len = s.len() + 1;
        let ptr = self
            .alloc(len, 0, flags, site)?
            .ok_or(AllocError::OutOfMemory { size: len, align: 0 })?;
        let mut backend = self.backend.lock();
        let dst = backend.bytes_mut(ptr, len).ok_or(AllocError::Corrupted {
            ptr,
            reason: "fresh block is not addressable",
        })?;
        dst[..s.len()].copy_from_slice(s);
        dst[s.len()] = 0;
        Ok(Some(ptr))
    }

    /// Usable free bytes in the pool `flags` select, if the backend knows.
    ///
    /// This is the backend figure: each free run already has its area stamp
    /// taken off, but not the 40-byte block header or alignment padding a
    /// request through this allocator adds. Use [`Self::contig`] to size a
    /// single request.
    pub fn avail(&self, flags: AllocFlags) -> Option<usize> {
        let synthetic = self.book.lock().inject.synthetic_avail();
        synthetic.or_else(|| self.backend.lock().sys_avail(flags))
    }

    /// Largest single default-aligned request the pool `flags` select can
    /// currently satisfy, if the backend knows.
    pub fn contig(&self, flags: AllocFlags) -> Option<usize> {
        let synthetic = self.book.lock().inject.synthetic_avail();
        if synthetic.is_some() {
            return synthetic;
        }
        let backend = self.backend.lock();
        let raw = backend.sys_contig(flags)?;
        let overhead = header::padded_request(
            0,
            self.config.default_align,
            backend.sys_max_align(),
            self.config.anti_coincidence,
        )
        .map_or(raw, |pad| pad.total);
        Some(raw.saturating_sub(overhead))
    }

    /// Sum of tracked block sizes, checkpointed blocks included.
    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.book.lock().live.total_bytes()
    }

    /// Number of visible tracked blocks.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.book.lock().live.len()
    }

    /// Lists visible tracked blocks in allocation order and logs them.
    pub fn report_allocs(&self) -> Vec<LiveAllocation> {
        let blocks: Vec<LiveAllocation> = self.book.lock().live.iter().map(Into::into).collect();
        let total: usize = blocks.iter().map(|b| b.size).sum();
        info!("{} live allocations, {total} bytes", blocks.len());
        for block in &blocks {
            info!(
                "  {:#x} {} bytes align {} at {}",
                block.ptr, block.size, block.align, block.site
            );
        }
        blocks
    }

    /// Dominant usage tag per bucket of `[base, base + size)`.
    pub fn get_map(&self, base: Address, size: usize, buckets: usize) -> Vec<UsageTag> {
        let extents: Vec<MapExtent> = {
            let mut book = self.book.lock();
            book.live.sort_by_address();
            book.live
                .iter()
                .map(|block| MapExtent {
                    start: block.base,
                    end: block.ptr + block.size,
                    tag: block.site.tag,
                })
                .collect()
        };
        map::dominant_tags(&extents, base, size, buckets)
    }

    /// Caller-visible size of a live block.
    pub fn usable_size(&self, ptr: Address) -> Result<usize, AllocError> {
        let backend = self.backend.lock();
        Ok(self.read_header(&backend, ptr)?.size)
    }

    /// Copies `len` payload bytes out of a live block.
    pub fn read(&self, ptr: Address, len: usize) -> Result<Vec<u8>, AllocError> {
        let backend = self.backend.lock();
        self.check_span(&backend, ptr, len)?;
        backend
            .bytes(ptr, len)
            .map(<[u8]>::to_vec)
            .ok_or(AllocError::UnknownPointer(ptr))
    }

    /// Copies `data` to the start of a live block.
    pub fn write(&self, ptr: Address, data: &[u8]) -> Result<(), AllocError> {
        let mut backend = self.backend.lock();
        self.check_span(&backend, ptr, data.len())?;
        backend
            .bytes_mut(ptr, data.len())
            .ok_or(AllocError::UnknownPointer(ptr))?
            .copy_from_slice(data);
        Ok(())
    }

    /// Sets the first `len` payload bytes of a live block to `byte`.
    pub fn fill(&self, ptr: Address, len: usize, byte: u8) -> Result<(), AllocError> {
        let mut backend = self.backend.lock();
        self.check_span(&backend, ptr, len)?;
        self.fill_bytes(&mut backend, ptr, len, byte)
    }

    /// Runs `f` with shared access to the backend.
    pub fn with_backend<R>(&self, f: impl FnOnce(&B) -> R) -> R {
        f(&self.backend.lock())
    }

    /// Takes every journal record collected so far.
    pub fn drain_trace(&self) -> Vec<AllocTraceRecord> {
        self.book.lock().journal.drain()
    }

    // -----------------------------------------------------------------------
    // test control surface
    // -----------------------------------------------------------------------

    /// Installs (or clears) a deterministic failure plan and restarts its count.
    pub fn test_fail_after(&self, plan: Option<FailurePlan>) {
        self.book.lock().inject.set_plan(plan);
    }

    /// Makes the next allocation return `ptr` if it is large and aligned
    /// enough; otherwise `ptr` is freed when that allocation happens. A
    /// displaced pending override is freed immediately.
    pub fn test_set_next_alloc(&self, ptr: Option<Address>) -> Result<(), AllocError> {
        let displaced = self.book.lock().inject.replace_next_alloc(ptr);
        match displaced {
            Some(old) if Some(old) != ptr => self.free(Some(old)),
            _ => Ok(()),
        }
    }

    /// Hides every currently visible block until the checkpoint is restored.
    pub fn test_checkpoint(&self) -> Checkpoint {
        self.book.lock().live.checkpoint()
    }

    /// Re-attaches blocks hidden by `checkpoint` ahead of the visible ones.
    pub fn test_restore(&self, checkpoint: Checkpoint) -> Result<(), AllocError> {
        if self.book.lock().live.restore(checkpoint) {
            Ok(())
        } else {
            Err(AllocError::StaleCheckpoint)
        }
    }

    /// Forces every backend allocation to fail while set.
    pub fn test_fail_sys(&self, fail: bool) {
        self.book.lock().inject.set_sys_failure(fail);
    }

    /// Reports `avail` as the given value for `avail` and `contig` while set.
    pub fn test_set_avail(&self, avail: Option<usize>) {
        self.book.lock().inject.set_synthetic_avail(avail);
    }

    // -----------------------------------------------------------------------
    // internals
    // -----------------------------------------------------------------------

    fn effective_align(&self, align: usize) -> Result<usize, AllocError> {
        let align = if align == 0 {
            self.config.default_align
        } else {
            align
        };
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(align));
        }
        Ok(align.max(PTR_SIZE))
    }

    fn track(&self, block: LiveBlock) -> Option<usize> {
        self.config
            .track
            .then(|| self.book.lock().live.push_back(block))
    }

    fn untrack(&self, slot: Option<usize>) {
        if let Some(slot) = slot {
            self.book.lock().live.remove(slot);
        }
    }

    /// Confirms `ptr` is tracked where its header says it is.
    fn verify_tracked(
        &self,
        symbol: &'static str,
        ptr: Address,
        slot: Option<usize>,
    ) -> Result<(), AllocError> {
        if !self.config.track {
            return Ok(());
        }
        let reason = {
            let book = self.book.lock();
            if self.config.paranoid_free && !book.live.contains(ptr) {
                Some("pointer is not on the live list")
            } else if !slot.and_then(|s| book.live.get(s)).is_some_and(|b| b.ptr == ptr) {
                Some("live-list slot does not match pointer")
            } else {
                None
            }
        };
        match reason {
            Some(reason) => {
                let err = AllocError::Corrupted { ptr, reason };
                Err(self.corruption(symbol, ptr, err))
            }
            None => Ok(()),
        }
    }

    fn claim_override(
        &self,
        ptr: Address,
        size: usize,
        align: usize,
        flags: AllocFlags,
        site: Site,
    ) -> Result<Option<Address>, AllocError> {
        let mut backend = self.backend.lock();
        let old = self
            .read_header(&backend, ptr)
            .map_err(|err| self.corruption("alloc", ptr, err))?;
        if old.size < size || ptr % align != 0 {
            drop(backend);
            warn!(
                "next-alloc override {ptr:#x} ({} bytes) cannot hold {size} bytes \
                 at align {align}; freeing it",
                old.size
            );
            self.free(Some(ptr))?;
            return Ok(None);
        }

        let header = BlockHeader {
            size,
            align: old.align.max(align),
            ..old
        };
        self.install(&mut backend, &header, flags)?;
        if let Some(slot) = header.slot {
            self.book.lock().live.update(
                slot,
                LiveBlock {
                    ptr,
                    base: header.base,
                    size,
                    align: header.align,
                    site,
                },
            );
        }
        drop(backend);

        self.trace(
            TraceLevel::Debug,
            "alloc",
            "override_reused",
            Some(ptr),
            Some(size),
            "ok",
            format!("held={}", old.size),
        );
        Ok(Some(ptr))
    }

    fn sys_alloc(
        &self,
        backend: &mut B,
        pad: Padding,
        flags: AllocFlags,
        symbol: &'static str,
    ) -> Result<Address, AllocError> {
        let exhausted = AllocError::OutOfMemory {
            size: pad.total,
            align: pad.sys_align,
        };
        let forced = self.book.lock().inject.sys_failure();
        if forced {
            self.trace(
                TraceLevel::Warn,
                symbol,
                "forced_sys_failure",
                None,
                Some(pad.total),
                "fail",
                "",
            );
            return Err(exhausted);
        }
        if let Some(base) = backend.sys_alloc(pad.total, pad.sys_align, flags) {
            return Ok(base);
        }
        if flags.contains(AllocFlags::TEMP) {
            self.note_temp_fallback(symbol, pad.total);
            if let Some(base) = backend.sys_alloc(pad.total, pad.sys_align, flags.without_temp()) {
                return Ok(base);
            }
        }
        debug!("{symbol}: backend exhausted for {} bytes", pad.total);
        self.trace(TraceLevel::Debug, symbol, "exhausted", None, Some(pad.total), "fail", "");
        Err(exhausted)
    }

    fn sys_realloc(
        &self,
        backend: &mut B,
        base: Address,
        pad: Padding,
        flags: AllocFlags,
    ) -> Result<Address, AllocError> {
        let exhausted = AllocError::OutOfMemory {
            size: pad.total,
            align: pad.sys_align,
        };
        let forced = self.book.lock().inject.sys_failure();
        if forced {
            self.trace(
                TraceLevel::Warn,
                "realloc",
                "forced_sys_failure",
                Some(base),
                Some(pad.total),
                "fail",
                "",
            );
            return Err(exhausted);
        }
        if let Some(moved) = backend.sys_realloc(base, pad.total, pad.sys_align, flags) {
            return Ok(moved);
        }
        if flags.contains(AllocFlags::TEMP) {
            self.note_temp_fallback("realloc", pad.total);
            let main = flags.without_temp();
            if let Some(moved) = backend.sys_realloc(base, pad.total, pad.sys_align, main) {
                return Ok(moved);
            }
        }
        debug!("realloc: backend exhausted for {} bytes", pad.total);
        self.trace(
            TraceLevel::Debug,
            "realloc",
            "exhausted",
            Some(base),
            Some(pad.total),
            "fail",
            "",
        );
        Err(exhausted)
    }

    fn note_temp_fallback(&self, symbol: &'static str, total: usize) {
        debug!("{symbol}: temp pool exhausted for {total} bytes, retrying in main pool");
        self.trace(TraceLevel::Debug, symbol, "temp_fallback", None, Some(total), "retry", "");
    }

    /// Writes the header and initializes the payload of a fresh block.
    fn install(
        &self,
        backend: &mut B,
        header: &BlockHeader,
        flags: AllocFlags,
    ) -> Result<(), AllocError> {
        self.write_header(backend, header.ptr, header)?;
        self.init_fill(backend, header.ptr, header.size, flags)
    }

    fn init_fill(
        &self,
        backend: &mut B,
        addr: Address,
        len: usize,
        flags: AllocFlags,
    ) -> Result<(), AllocError> {
        if flags.contains(AllocFlags::CLEAR) {
            self.fill_bytes(backend, addr, len, 0)
        } else if self.config.poison {
            self.fill_bytes(backend, addr, len, FRESH_POISON)
        } else {
            Ok(())
        }
    }

    fn fill_bytes(
        &self,
        backend: &mut B,
        addr: Address,
        len: usize,
        byte: u8,
    ) -> Result<(), AllocError> {
        backend
            .bytes_mut(addr, len)
            .ok_or(AllocError::Corrupted {
                ptr: addr,
                reason: "payload outside backend region",
            })?
            .fill(byte);
        Ok(())
    }

    fn read_header(&self, backend: &B, ptr: Address) -> Result<BlockHeader, AllocError> {
        let addr = header::header_addr(ptr).ok_or(AllocError::UnknownPointer(ptr))?;
        let raw = backend
            .bytes(addr, HEADER_SIZE)
            .ok_or(AllocError::UnknownPointer(ptr))?;
        let header = BlockHeader::decode(raw).ok_or(AllocError::Corrupted {
            ptr,
            reason: "undecodable block header",
        })?;
        if header.ptr != ptr {
            let reason = if header.ptr == 0 {
                "block header is tombstoned or was never written"
            } else {
                "block header does not point back at pointer"
            };
            return Err(AllocError::Corrupted { ptr, reason });
        }
        if !header.align.is_power_of_two() || header.base > addr {
            return Err(AllocError::Corrupted {
                ptr,
                reason: "implausible block header",
            });
        }
        Ok(header)
    }

    fn write_header(
        &self,
        backend: &mut B,
        ptr: Address,
        header: &BlockHeader,
    ) -> Result<(), AllocError> {
        let addr = header::header_addr(ptr).ok_or(AllocError::UnknownPointer(ptr))?;
        backend
            .bytes_mut(addr, HEADER_SIZE)
            .ok_or(AllocError::Corrupted {
                ptr,
                reason: "header outside backend region",
            })?
            .copy_from_slice(&header.encode());
        Ok(())
    }

    fn check_span(&self, backend: &B, ptr: Address, len: usize) -> Result<(), AllocError> {
        let header = self.read_header(backend, ptr)?;
        if len > header.size {
            return Err(AllocError::OutOfBounds {
                ptr,
                len,
                size: header.size,
            });
        }
        Ok(())
    }

    fn injected(
        &self,
        symbol: &'static str,
        ptr: Option<Address>,
        size: usize,
        call: u64,
    ) -> AllocError {
        debug!("{symbol}: injected failure on call {call}");
        self.trace(
            TraceLevel::Info,
            symbol,
            "injected_failure",
            ptr,
            Some(size),
            "fail",
            format!("call={call}"),
        );
        AllocError::InjectedFailure { call }
    }

    /// Routes detected corruption through the configured policy: logged,
    /// then either a halt or the error handed back.
    fn corruption(&self, symbol: &'static str, ptr: Address, err: AllocError) -> AllocError {
        error!("{symbol}({ptr:#x}): {err}");
        let outcome = if self.config.halt_on_corruption { "halt" } else { "error" };
        self.trace(
            TraceLevel::Error,
            symbol,
            "corruption",
            Some(ptr),
            None,
            outcome,
            err.to_string(),
        );
        if self.config.halt_on_corruption {
            panic!("xalloc: {symbol}({ptr:#x}): {err}");
        }
        err
    }

    #[allow(clippy::too_many_arguments)]
    fn trace(
        &self,
        level: TraceLevel,
        symbol: &'static str,
        event: &'static str,
        ptr: Option<Address>,
        size: Option<usize>,
        outcome: &'static str,
        details: impl Into<String>,
    ) {
        if self.config.trace {
            self.book
                .lock()
                .journal
                .record(level, symbol, event, ptr, size, outcome, details);
        }
    }
}
