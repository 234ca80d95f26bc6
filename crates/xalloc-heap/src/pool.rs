//! A single fixed-size pool.
//!
//! The pool owns one contiguous byte region whose start is aligned to the
//! block granularity. Blocks partition the region exactly; descriptors live
//! in `areas`, indexed by the unit a block starts at, with a zero-size
//! fencepost at index `unit_count()`. Free blocks are threaded onto an
//! intrusive, address-ordered free list through `prev_free`/`next_free`.
//!
//! Allocation is first-fit from either end of the free list. That keeps the
//! search cheap but is a poor fit for workloads made of many tiny blocks.

use std::ops::Range;

use crate::align_up;
use crate::area::{AREA_HEADER_SIZE, AREA_MAGIC, Allocation, AreaInfo};
use crate::backend::Address;
use crate::config::MIN_GRANULARITY;
use crate::error::HeapError;

/// Snapshot of one physical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// First unit of the block.
    pub index: usize,
    /// Address of the block start (its stamp).
    pub addr: Address,
    /// Gross size in bytes, stamp included.
    pub bytes: usize,
    pub free: bool,
    pub temp: bool,
    pub alloc: Option<Allocation>,
}

/// Byte accounting for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub capacity: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// Largest usable run, stamp excluded.
    pub largest_free: usize,
}

/// A contiguous region subdivided into granularity-sized units.
pub struct MemoryPool {
    storage: Box<[u8]>,
    /// Offset of the aligned region inside `storage`.
    start: usize,
    base: Address,
    size: usize,
    granularity: usize,
    temp: bool,
    areas: Vec<Option<AreaInfo>>,
    first_free: Option<usize>,
    last_free: Option<usize>,
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .field("granularity", &self.granularity)
            .field("temp", &self.temp)
            .field("first_free", &self.first_free)
            .field("last_free", &self.last_free)
            .finish()
    }
}

impl MemoryPool {
    /// Creates a pool of `size` bytes (rounded down to whole units) made of
    /// one free block followed by the fencepost.
    pub fn new(size: usize, granularity: usize, temp: bool) -> Result<Self, HeapError> {
        if !granularity.is_power_of_two() || granularity < MIN_GRANULARITY {
            return Err(HeapError::InvalidGranularity(granularity));
        }
        let units = size / granularity;
        if units == 0 {
            return Err(HeapError::PoolTooSmall { size, granularity });
        }
        let size = units * granularity;
        let backing = size
            .checked_add(granularity)
            .ok_or(HeapError::SizeOverflow(size))?;

        let storage = vec![0u8; backing].into_boxed_slice();
        let raw = storage.as_ptr() as usize;
        let start = align_up(raw, granularity) - raw;

        let mut pool = Self {
            storage,
            start,
            base: raw + start,
            size,
            granularity,
            temp,
            areas: vec![None; units + 1],
            first_free: Some(0),
            last_free: Some(0),
        };
        let mut head = AreaInfo::detached(units, None, temp);
        head.free = true;
        pool.areas[0] = Some(head);
        pool.areas[units] = Some(AreaInfo::fencepost(Some(0), temp));
        pool.write_stamp(0)?;
        Ok(pool)
    }

    #[must_use]
    pub fn base(&self) -> Address {
        self.base
    }

    /// Capacity in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    #[must_use]
    pub fn is_temp(&self) -> bool {
        self.temp
    }

    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.areas.len() - 1
    }

    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    /// Padding between the end of a block stamp and a user pointer of `align`.
    #[must_use]
    pub const fn alignofs(align: usize) -> usize {
        align_up(AREA_HEADER_SIZE, align) - AREA_HEADER_SIZE
    }

    /// Units needed for a `size`-byte payload at `align`.
    pub fn blocks_for(&self, size: usize, align: usize) -> Result<usize, HeapError> {
        let total = AREA_HEADER_SIZE
            .checked_add(Self::alignofs(align))
            .and_then(|n| n.checked_add(size))
            .ok_or(HeapError::SizeOverflow(size))?;
        Ok(total.div_ceil(self.granularity))
    }

    /// Allocates `size` bytes at `align`, carving from the low end of the
    /// first fitting free block, or from the high end when `from_top`.
    pub fn alloc(
        &mut self,
        size: usize,
        align: usize,
        from_top: bool,
        temp_request: bool,
    ) -> Result<Address, HeapError> {
        let align = align.max(1);
        if !align.is_power_of_two() || align > self.granularity {
            return Err(HeapError::AlignmentUnsupported {
                align,
                granularity: self.granularity,
            });
        }
        let need = self.blocks_for(size, align)?;
        let Some(found) = self.find_fit(need, from_top)? else {
            return Err(HeapError::Exhausted { nblocks: need });
        };

        let have = self.area(found)?.nblocks;
        let idx = if have == need {
            self.unlink_free(found)?;
            found
        } else if from_top {
            let carved = self.split(found, have - need)?;
            self.write_stamp(found)?;
            carved
        } else {
            let rest = self.split(found, need)?;
            self.replace_free(found, rest)?;
            self.area_mut(rest)?.free = true;
            self.write_stamp(rest)?;
            found
        };

        let alignofs = Self::alignofs(align);
        let base = self.unit_addr(idx) + AREA_HEADER_SIZE + alignofs;
        let area = self.area_mut(idx)?;
        area.free = false;
        area.alloc = Some(Allocation {
            size,
            temp: temp_request,
            top: from_top,
            align,
            alignofs,
            base,
        });
        self.write_stamp(idx)?;
        Ok(base)
    }

    /// Returns the block holding `addr` to the free list, merging it with
    /// free physical neighbours.
    pub fn free(&mut self, addr: Address) -> Result<(), HeapError> {
        let idx = self.locate(addr)?;
        self.release(idx)?;
        Ok(())
    }

    /// Resizes the allocation at `addr` without leaving this pool.
    ///
    /// Shrinks release the excess tail. Growth first absorbs the following
    /// free block; failing that, it merges the preceding free block, this
    /// block and the following free block, keeps the top of the merged run
    /// and moves the payload down. Returns [`HeapError::NoRoomInPlace`] when
    /// none of that fits; the block is then unchanged.
    pub fn realloc_in_place(
        &mut self,
        addr: Address,
        new_size: usize,
    ) -> Result<Address, HeapError> {
        let idx = self.locate(addr)?;
        let (have, alloc) = {
            let area = self.area(idx)?;
            (area.nblocks, area.alloc.ok_or(HeapError::InvalidAddress(addr))?)
        };
        let need = self.blocks_for(new_size, alloc.align)?;

        if need <= have {
            if need < have {
                let tail = self.split(idx, need)?;
                self.release(tail)?;
            }
            self.resize_record(idx, new_size)?;
            return Ok(addr);
        }

        let next = idx + have;
        let next_free = self.free_units(next)?;
        if have + next_free >= need {
            let extra = need - have;
            if next_free > extra {
                let rest = self.split(next, extra)?;
                self.replace_free(next, rest)?;
                self.area_mut(rest)?.free = true;
                self.write_stamp(rest)?;
            } else {
                self.unlink_free(next)?;
            }
            self.area_mut(next)?.free = false;
            self.absorb(idx, next)?;
            self.resize_record(idx, new_size)?;
            return Ok(addr);
        }

        let Some(prev) = self.area(idx)?.prev else {
            return Err(HeapError::NoRoomInPlace);
        };
        let prev_free = self.free_units(prev)?;
        if prev_free == 0 || prev_free + have + next_free < need {
            return Err(HeapError::NoRoomInPlace);
        }

        self.unlink_free(prev)?;
        self.area_mut(prev)?.free = false;
        if next_free > 0 {
            self.unlink_free(next)?;
            self.area_mut(next)?.free = false;
        }
        self.absorb(prev, idx)?;
        if next_free > 0 {
            self.absorb(prev, next)?;
        }

        // The kept top part always covers the whole old block, so the
        // payload only ever moves down and no stamp lands on it before the copy.
        let total = prev_free + have + next_free;
        let new_idx = if total > need {
            self.split(prev, total - need)?
        } else {
            prev
        };
        let new_base = self.unit_addr(new_idx) + AREA_HEADER_SIZE + alloc.alignofs;
        let src = self.range(addr, alloc.size).ok_or(HeapError::InvalidAddress(addr))?;
        let dst = self.start + (new_base - self.base);
        self.storage.copy_within(src, dst);

        let area = self.area_mut(new_idx)?;
        area.free = false;
        area.alloc = Some(Allocation {
            size: new_size,
            base: new_base,
            ..alloc
        });
        self.write_stamp(new_idx)?;
        if new_idx != prev {
            self.release(prev)?;
        }
        Ok(new_base)
    }

    /// Allocation record for a live user pointer.
    #[must_use]
    pub fn allocation(&self, addr: Address) -> Option<Allocation> {
        let idx = self.locate(addr).ok()?;
        self.areas[idx].and_then(|area| area.alloc)
    }

    /// Bytes usable from `addr` to the end of its block.
    pub fn usable_size(&self, addr: Address) -> Result<usize, HeapError> {
        let idx = self.locate(addr)?;
        let end = self.unit_addr(idx) + self.area(idx)?.nblocks * self.granularity;
        Ok(end - addr)
    }

    /// Sum of usable bytes over the free list.
    #[must_use]
    pub fn avail(&self) -> usize {
        self.free_runs().map(|n| self.usable(n)).sum()
    }

    /// Largest usable run on the free list.
    #[must_use]
    pub fn contig(&self) -> usize {
        self.free_runs().map(|n| self.usable(n)).max().unwrap_or(0)
    }

    /// Physical blocks in address order, fencepost excluded.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let mut idx = 0;
        std::iter::from_fn(move || {
            let area = self.areas.get(idx)?.as_ref()?;
            if area.is_fencepost() {
                return None;
            }
            let info = BlockInfo {
                index: idx,
                addr: self.unit_addr(idx),
                bytes: area.nblocks * self.granularity,
                free: area.free,
                temp: area.temp,
                alloc: area.alloc,
            };
            idx += area.nblocks;
            Some(info)
        })
    }

    /// Free-list members from low to high address.
    #[must_use]
    pub fn free_list(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.first_free;
        while let Some(idx) = cur {
            if out.len() > self.unit_count() {
                break;
            }
            out.push(idx);
            cur = self.areas.get(idx).and_then(|a| a.as_ref()).and_then(|a| a.next_free);
        }
        out
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            capacity: self.size,
            ..PoolStats::default()
        };
        for block in self.blocks() {
            if block.free {
                stats.free_bytes += block.bytes;
                stats.free_blocks += 1;
                stats.largest_free = stats
                    .largest_free
                    .max(block.bytes - AREA_HEADER_SIZE);
            } else {
                stats.used_bytes += block.bytes;
                stats.used_blocks += 1;
            }
        }
        stats
    }

    /// Read access to `len` bytes at `addr`.
    #[must_use]
    pub fn bytes(&self, addr: Address, len: usize) -> Option<&[u8]> {
        let range = self.range(addr, len)?;
        self.storage.get(range)
    }

    /// Write access to `len` bytes at `addr`.
    pub fn bytes_mut(&mut self, addr: Address, len: usize) -> Option<&mut [u8]> {
        let range = self.range(addr, len)?;
        self.storage.get_mut(range)
    }

    /// Full structural audit of the block chain and the free list.
    pub fn check(&self) -> Result<(), HeapError> {
        let units = self.unit_count();
        let mut idx = 0;
        let mut prev = None;
        let mut prev_was_free = false;
        let mut free_blocks = Vec::new();

        while idx < units {
            let area = self.area(idx)?;
            let corrupt = |reason| Err(HeapError::Corrupted { index: idx, reason });
            if area.magic != AREA_MAGIC {
                return corrupt("bad magic");
            }
            if area.is_fencepost() {
                return corrupt("fencepost inside pool");
            }
            if area.prev != prev {
                return corrupt("broken physical back-link");
            }
            if area.free && prev_was_free {
                return corrupt("adjacent free blocks");
            }
            if area.free == area.alloc.is_some() {
                return corrupt("free flag disagrees with allocation record");
            }
            if area.temp != self.temp {
                return corrupt("block owned by the wrong pool");
            }
            if !self.stamp_intact(idx) {
                return corrupt("block stamp overwritten");
            }
            if area.free {
                free_blocks.push(idx);
            }
            prev_was_free = area.free;
            prev = Some(idx);
            idx += area.nblocks;
        }
        if idx != units {
            return Err(HeapError::Corrupted {
                index: idx,
                reason: "blocks overrun the pool end",
            });
        }
        let fence = self.area(units)?;
        if !fence.is_fencepost() || fence.prev != prev {
            return Err(HeapError::Corrupted {
                index: units,
                reason: "fencepost missing or unlinked",
            });
        }

        let mut listed: Vec<usize> = Vec::new();
        let mut back = None;
        let mut cur = self.first_free;
        while let Some(i) = cur {
            let area = self.area(i)?;
            let corrupt = |reason| Err(HeapError::Corrupted { index: i, reason });
            if !area.free {
                return corrupt("allocated block on the free list");
            }
            if area.prev_free != back {
                return corrupt("broken free-list back-link");
            }
            if listed.last().is_some_and(|&last| i <= last) {
                return corrupt("free list out of address order");
            }
            if listed.len() >= units {
                return corrupt("free list cycle");
            }
            listed.push(i);
            back = Some(i);
            cur = area.next_free;
        }
        if self.last_free != back {
            return Err(HeapError::Corrupted {
                index: back.unwrap_or(0),
                reason: "free-list tail mismatch",
            });
        }
        if listed != free_blocks {
            return Err(HeapError::Corrupted {
                index: listed.first().copied().unwrap_or(0),
                reason: "free list does not match free blocks",
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // descriptors
    // -----------------------------------------------------------------------

    fn area(&self, idx: usize) -> Result<&AreaInfo, HeapError> {
        self.areas
            .get(idx)
            .and_then(Option::as_ref)
            .ok_or(HeapError::Corrupted {
                index: idx,
                reason: "missing block descriptor",
            })
    }

    fn area_mut(&mut self, idx: usize) -> Result<&mut AreaInfo, HeapError> {
        self.areas
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or(HeapError::Corrupted {
                index: idx,
                reason: "missing block descriptor",
            })
    }

    fn unit_addr(&self, idx: usize) -> Address {
        self.base + idx * self.granularity
    }

    fn usable(&self, nblocks: usize) -> usize {
        nblocks * self.granularity - AREA_HEADER_SIZE
    }

    fn free_units(&self, idx: usize) -> Result<usize, HeapError> {
        let area = self.area(idx)?;
        Ok(if area.free { area.nblocks } else { 0 })
    }

    fn free_runs(&self) -> impl Iterator<Item = usize> + '_ {
        self.free_list()
            .into_iter()
            .filter_map(|idx| self.areas[idx].map(|a| a.nblocks))
    }

    fn range(&self, addr: Address, len: usize) -> Option<Range<usize>> {
        let offset = addr.checked_sub(self.base)?;
        let end = offset.checked_add(len)?;
        if end > self.size {
            return None;
        }
        Some(self.start + offset..self.start + end)
    }

    fn resize_record(&mut self, idx: usize, size: usize) -> Result<(), HeapError> {
        if let Some(alloc) = self.area_mut(idx)?.alloc.as_mut() {
            alloc.size = size;
        }
        self.write_stamp(idx)
    }

    /// Maps a user pointer back to its block and validates it.
    fn locate(&self, addr: Address) -> Result<usize, HeapError> {
        if !self.contains(addr) {
            return Err(HeapError::InvalidAddress(addr));
        }
        let Some(rel) = (addr - self.base).checked_sub(AREA_HEADER_SIZE) else {
            return Err(HeapError::InvalidAddress(addr));
        };
        let idx = rel / self.granularity;
        let area = self
            .areas
            .get(idx)
            .and_then(Option::as_ref)
            .ok_or(HeapError::InvalidAddress(addr))?;
        if area.magic != AREA_MAGIC {
            return Err(HeapError::Corrupted {
                index: idx,
                reason: "bad magic",
            });
        }
        match area.alloc {
            Some(alloc) if !area.free && alloc.base == addr => {}
            _ => return Err(HeapError::InvalidAddress(addr)),
        }
        if !self.stamp_intact(idx) {
            return Err(HeapError::Corrupted {
                index: idx,
                reason: "block stamp overwritten",
            });
        }
        Ok(idx)
    }

    fn stamp_range(&self, idx: usize) -> Range<usize> {
        let at = self.start + idx * self.granularity;
        at..at + AREA_HEADER_SIZE
    }

    fn write_stamp(&mut self, idx: usize) -> Result<(), HeapError> {
        if idx >= self.unit_count() {
            return Ok(());
        }
        let stamp = self.area(idx)?.stamp();
        let range = self.stamp_range(idx);
        self.storage[range].copy_from_slice(&stamp);
        Ok(())
    }

    fn stamp_intact(&self, idx: usize) -> bool {
        let area = self.areas.get(idx).and_then(Option::as_ref);
        match (area, self.storage.get(self.stamp_range(idx))) {
            (Some(area), Some(raw)) => area.matches_stamp(raw),
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // free list
    // -----------------------------------------------------------------------

    fn find_fit(&self, need: usize, from_top: bool) -> Result<Option<usize>, HeapError> {
        let mut cur = if from_top { self.last_free } else { self.first_free };
        while let Some(idx) = cur {
            let area = self.area(idx)?;
            if area.nblocks >= need {
                return Ok(Some(idx));
            }
            cur = if from_top { area.prev_free } else { area.next_free };
        }
        Ok(None)
    }

    fn unlink_free(&mut self, idx: usize) -> Result<(), HeapError> {
        let (prev, next) = {
            let area = self.area(idx)?;
            (area.prev_free, area.next_free)
        };
        match prev {
            Some(p) => self.area_mut(p)?.next_free = next,
            None => self.first_free = next,
        }
        match next {
            Some(n) => self.area_mut(n)?.prev_free = prev,
            None => self.last_free = prev,
        }
        let area = self.area_mut(idx)?;
        area.prev_free = None;
        area.next_free = None;
        Ok(())
    }

    /// Puts `new` at `old`'s free-list position. Only valid when no other
    /// free block lies between the two addresses.
    fn replace_free(&mut self, old: usize, new: usize) -> Result<(), HeapError> {
        let (prev, next) = {
            let area = self.area_mut(old)?;
            let links = (area.prev_free, area.next_free);
            area.prev_free = None;
            area.next_free = None;
            links
        };
        match prev {
            Some(p) => self.area_mut(p)?.next_free = Some(new),
            None => self.first_free = Some(new),
        }
        match next {
            Some(n) => self.area_mut(n)?.prev_free = Some(new),
            None => self.last_free = Some(new),
        }
        let area = self.area_mut(new)?;
        area.prev_free = prev;
        area.next_free = next;
        Ok(())
    }

    fn insert_free(&mut self, idx: usize) -> Result<(), HeapError> {
        let mut before = None;
        let mut cur = self.first_free;
        while let Some(c) = cur {
            if c > idx {
                break;
            }
            before = Some(c);
            cur = self.area(c)?.next_free;
        }
        {
            let area = self.area_mut(idx)?;
            area.prev_free = before;
            area.next_free = cur;
        }
        match before {
            Some(p) => self.area_mut(p)?.next_free = Some(idx),
            None => self.first_free = Some(idx),
        }
        match cur {
            Some(n) => self.area_mut(n)?.prev_free = Some(idx),
            None => self.last_free = Some(idx),
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // physical chain
    // -----------------------------------------------------------------------

    /// Cuts `idx` after `keep` units. The tail is returned detached: not
    /// free, not allocated, not listed.
    fn split(&mut self, idx: usize, keep: usize) -> Result<usize, HeapError> {
        let (total, temp) = {
            let area = self.area(idx)?;
            (area.nblocks, area.temp)
        };
        debug_assert!(keep > 0 && keep < total, "split {keep} of {total}");
        let tail = idx + keep;
        self.area_mut(idx)?.nblocks = keep;
        self.areas[tail] = Some(AreaInfo::detached(total - keep, Some(idx), temp));
        self.area_mut(idx + total)?.prev = Some(tail);
        Ok(tail)
    }

    /// Merges `src` into the physically preceding `dst`.
    fn absorb(&mut self, dst: usize, src: usize) -> Result<(), HeapError> {
        let n = self.area(src)?.nblocks;
        debug_assert_eq!(dst + self.area(dst)?.nblocks, src);
        self.areas[src] = None;
        self.area_mut(dst)?.nblocks += n;
        self.area_mut(src + n)?.prev = Some(dst);
        Ok(())
    }

    /// Marks `idx` free and coalesces it with both neighbours. Returns the
    /// index of the resulting free block.
    fn release(&mut self, idx: usize) -> Result<usize, HeapError> {
        {
            let area = self.area_mut(idx)?;
            area.free = true;
            area.alloc = None;
        }
        let mut idx = idx;
        let mut listed = false;

        if let Some(prev) = self.area(idx)?.prev {
            if self.area(prev)?.free {
                self.absorb(prev, idx)?;
                idx = prev;
                listed = true;
            }
        }

        let next = idx + self.area(idx)?.nblocks;
        if self.area(next)?.free {
            if listed {
                self.unlink_free(next)?;
            } else {
                self.replace_free(next, idx)?;
                listed = true;
            }
            self.absorb(idx, next)?;
        }

        if !listed {
            self.insert_free(idx)?;
        }
        self.write_stamp(idx)?;
        Ok(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAN: usize = 64;

    fn pool(units: usize) -> MemoryPool {
        MemoryPool::new(units * GRAN, GRAN, false).expect("pool")
    }

    fn shape(pool: &MemoryPool) -> Vec<(usize, bool)> {
        pool.blocks()
            .map(|b| (b.bytes / GRAN, b.free))
            .collect()
    }

    #[test]
    fn new_pool_is_one_free_block() {
        let pool = pool(8);
        assert_eq!(shape(&pool), vec![(8, true)]);
        assert_eq!(pool.base() % GRAN, 0);
        assert_eq!(pool.avail(), 8 * GRAN - AREA_HEADER_SIZE);
        pool.check().expect("fresh pool is consistent");
    }

    #[test]
    fn rejects_pool_smaller_than_one_unit() {
        let err = MemoryPool::new(GRAN - 1, GRAN, false).unwrap_err();
        assert_eq!(
            err,
            HeapError::PoolTooSmall {
                size: GRAN - 1,
                granularity: GRAN
            }
        );
    }

    #[test]
    fn exact_fit_consumes_whole_pool() {
        let mut pool = pool(4);
        let ptr = pool.alloc(200, 16, false, false).expect("fits in 4 units");
        assert_eq!(shape(&pool), vec![(4, false)]);
        assert_eq!(pool.avail(), 0);
        assert_eq!(pool.contig(), 0);
        assert!(pool.free_list().is_empty());

        pool.free(ptr).expect("free");
        assert_eq!(shape(&pool), vec![(4, true)]);
        pool.check().expect("consistent");
    }

    #[test]
    fn split_then_free_merges_with_pool_tail() {
        let mut pool = pool(8);
        let a = pool.alloc(40, 8, false, false).unwrap();
        let b = pool.alloc(40, 8, true, false).unwrap();
        assert_eq!(shape(&pool), vec![(1, false), (6, true), (1, false)]);

        pool.free(a).unwrap();
        assert_eq!(shape(&pool), vec![(7, true), (1, false)]);
        pool.check().unwrap();

        pool.free(b).unwrap();
        assert_eq!(shape(&pool), vec![(8, true)]);
    }

    #[test]
    fn freeing_second_of_two_bottom_blocks_rejoins_tail() {
        let mut pool = pool(8);
        let _a = pool.alloc(40, 8, false, false).unwrap();
        let b = pool.alloc(40, 8, false, false).unwrap();
        pool.free(b).unwrap();
        assert_eq!(shape(&pool), vec![(1, false), (7, true)]);
        pool.check().unwrap();
    }

    #[test]
    fn top_allocation_comes_from_high_addresses() {
        let mut pool = pool(8);
        let low = pool.alloc(10, 8, false, false).unwrap();
        let high = pool.alloc(10, 8, true, false).unwrap();
        assert!(high > low);
        assert_eq!(high, pool.base() + 7 * GRAN + AREA_HEADER_SIZE);
        let record = pool.allocation(high).unwrap();
        assert!(record.top);
    }

    #[test]
    fn alignment_is_honoured_up_to_granularity() {
        let mut pool = pool(16);
        for align in [1, 2, 8, 16, 32, 64] {
            let ptr = pool.alloc(24, align, false, false).unwrap();
            assert_eq!(ptr % align, 0, "align {align}");
            let record = pool.allocation(ptr).unwrap();
            assert_eq!(record.alignofs, MemoryPool::alignofs(align));
        }
        pool.check().unwrap();
    }

    #[test]
    fn alignment_beyond_granularity_is_rejected() {
        let mut pool = pool(16);
        let err = pool.alloc(8, 128, false, false).unwrap_err();
        assert_eq!(
            err,
            HeapError::AlignmentUnsupported {
                align: 128,
                granularity: GRAN
            }
        );
    }

    #[test]
    fn exhaustion_reports_needed_blocks() {
        let mut pool = pool(2);
        let err = pool.alloc(500, 8, false, false).unwrap_err();
        assert_eq!(err, HeapError::Exhausted { nblocks: 9 });
    }

    #[test]
    fn first_fit_skips_small_holes() {
        let mut pool = pool(8);
        let a = pool.alloc(10, 8, false, false).unwrap();
        let _b = pool.alloc(10, 8, false, false).unwrap();
        pool.free(a).unwrap();
        // The one-unit hole at the bottom cannot hold two units.
        let c = pool.alloc(100, 8, false, false).unwrap();
        assert_eq!(c, pool.base() + 2 * GRAN + AREA_HEADER_SIZE);
        assert_eq!(pool.free_list(), vec![0, 4]);
    }

    #[test]
    fn free_of_unknown_address_is_rejected() {
        let mut pool = pool(4);
        let ptr = pool.alloc(10, 8, false, false).unwrap();
        assert_eq!(
            pool.free(ptr + 8),
            Err(HeapError::InvalidAddress(ptr + 8))
        );
        pool.free(ptr).unwrap();
        assert_eq!(pool.free(ptr), Err(HeapError::InvalidAddress(ptr)));
    }

    #[test]
    fn shrink_releases_tail_blocks() {
        let mut pool = pool(8);
        let a = pool.alloc(300, 8, false, false).unwrap();
        let _guard = pool.alloc(10, 8, false, false).unwrap();
        assert_eq!(shape(&pool), vec![(5, false), (1, false), (2, true)]);

        let same = pool.realloc_in_place(a, 40).unwrap();
        assert_eq!(same, a);
        assert_eq!(shape(&pool), vec![(1, false), (4, true), (1, false), (2, true)]);
        assert_eq!(pool.allocation(a).unwrap().size, 40);
        pool.check().unwrap();
    }

    #[test]
    fn shrink_tail_coalesces_with_following_free_block() {
        let mut pool = pool(8);
        let a = pool.alloc(300, 8, false, false).unwrap();
        pool.realloc_in_place(a, 10).unwrap();
        assert_eq!(shape(&pool), vec![(1, false), (7, true)]);
        pool.check().unwrap();
    }

    #[test]
    fn grow_absorbs_following_free_block_without_moving() {
        let mut pool = pool(8);
        let a = pool.alloc(40, 8, false, false).unwrap();
        let b = pool.alloc(40, 8, false, false).unwrap();
        let _c = pool.alloc(40, 8, false, false).unwrap();
        pool.bytes_mut(a, 40).unwrap().copy_from_slice(&[0x5A; 40]);
        pool.free(b).unwrap();

        let grown = pool.realloc_in_place(a, 100).unwrap();
        assert_eq!(grown, a);
        assert_eq!(pool.bytes(a, 40).unwrap(), &[0x5A; 40]);
        assert_eq!(shape(&pool), vec![(2, false), (1, false), (5, true)]);
        pool.check().unwrap();
    }

    #[test]
    fn grow_splits_following_free_block_when_larger_than_needed() {
        let mut pool = pool(8);
        let a = pool.alloc(40, 8, false, false).unwrap();
        let grown = pool.realloc_in_place(a, 150).unwrap();
        assert_eq!(grown, a);
        assert_eq!(shape(&pool), vec![(3, false), (5, true)]);
        assert_eq!(pool.free_list(), vec![3]);
        pool.check().unwrap();
    }

    #[test]
    fn grow_merges_preceding_block_and_moves_payload_down() {
        let mut pool = pool(8);
        let a = pool.alloc(100, 8, false, false).unwrap();
        let b = pool.alloc(40, 8, false, false).unwrap();
        let _c = pool.alloc(40, 8, false, false).unwrap();
        let payload: Vec<u8> = (0..40u8).collect();
        pool.bytes_mut(b, 40).unwrap().copy_from_slice(&payload);
        pool.free(a).unwrap();
        assert_eq!(shape(&pool), vec![(2, true), (1, false), (1, false), (4, true)]);

        // b needs three units; only the preceding two-unit run can help.
        let moved = pool.realloc_in_place(b, 150).unwrap();
        assert_eq!(moved, pool.base() + AREA_HEADER_SIZE);
        assert_eq!(pool.bytes(moved, 40).unwrap(), payload.as_slice());
        assert_eq!(shape(&pool), vec![(3, false), (1, false), (4, true)]);
        assert_eq!(pool.allocation(moved).unwrap().size, 150);
        assert!(pool.allocation(b).is_none());
        pool.check().unwrap();
    }

    #[test]
    fn grow_three_way_merge_leaves_free_remainder_below() {
        let mut pool = pool(10);
        let a = pool.alloc(200, 8, false, false).unwrap(); // 4 units
        let b = pool.alloc(40, 8, false, false).unwrap(); // 1 unit
        let c = pool.alloc(40, 8, false, false).unwrap(); // 1 unit
        let _d = pool.alloc(40, 8, false, false).unwrap(); // 1 unit
        pool.bytes_mut(b, 40).unwrap().fill(0x77);
        pool.free(a).unwrap();
        pool.free(c).unwrap();
        assert_eq!(
            shape(&pool),
            vec![(4, true), (1, false), (1, true), (1, false), (3, true)]
        );

        // b grows to 3 units: 4 + 1 + 1 available, top cut keeps units 3..6.
        let moved = pool.realloc_in_place(b, 170).unwrap();
        assert_eq!(moved, pool.base() + 3 * GRAN + AREA_HEADER_SIZE);
        assert_eq!(pool.bytes(moved, 40).unwrap(), &[0x77; 40]);
        assert_eq!(
            shape(&pool),
            vec![(3, true), (3, false), (1, false), (3, true)]
        );
        pool.check().unwrap();
    }

    #[test]
    fn grow_without_room_leaves_block_untouched() {
        let mut pool = pool(4);
        let a = pool.alloc(40, 8, false, false).unwrap();
        let _b = pool.alloc(40, 8, false, false).unwrap();
        assert_eq!(pool.realloc_in_place(a, 400), Err(HeapError::NoRoomInPlace));
        assert_eq!(pool.allocation(a).unwrap().size, 40);
        pool.check().unwrap();
    }

    #[test]
    fn stats_partition_capacity() {
        let mut pool = pool(16);
        let a = pool.alloc(100, 8, false, false).unwrap();
        let _b = pool.alloc(300, 16, true, false).unwrap();
        pool.free(a).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.capacity, 16 * GRAN);
        assert_eq!(stats.used_bytes + stats.free_bytes, stats.capacity);
        assert_eq!(
            pool.avail(),
            stats.free_bytes - stats.free_blocks * AREA_HEADER_SIZE
        );
        assert_eq!(pool.contig(), stats.largest_free);
    }

    #[test]
    fn check_detects_out_of_order_free_list() {
        let mut pool = pool(8);
        let ptrs: Vec<_> = (0..5)
            .map(|_| pool.alloc(10, 8, false, false).unwrap())
            .collect();
        pool.free(ptrs[1]).unwrap();
        pool.free(ptrs[3]).unwrap();
        assert_eq!(pool.free_list(), vec![1, 3, 5]);
        pool.check().unwrap();

        // Swap the first two list entries.
        pool.first_free = Some(3);
        pool.areas[3].as_mut().unwrap().prev_free = None;
        pool.areas[3].as_mut().unwrap().next_free = Some(1);
        pool.areas[1].as_mut().unwrap().prev_free = Some(3);
        pool.areas[1].as_mut().unwrap().next_free = Some(5);
        pool.areas[5].as_mut().unwrap().prev_free = Some(1);

        let err = pool.check().unwrap_err();
        assert_eq!(
            err,
            HeapError::Corrupted {
                index: 1,
                reason: "free list out of address order"
            }
        );
    }

    #[test]
    fn check_detects_adjacent_free_blocks() {
        let mut pool = pool(4);
        let a = pool.alloc(10, 8, false, false).unwrap();
        let _b = pool.alloc(10, 8, false, false).unwrap();
        pool.free(a).unwrap();
        // Pretend block 1 was freed without coalescing.
        let area = pool.areas[1].as_mut().unwrap();
        area.free = true;
        area.alloc = None;
        pool.write_stamp(1).unwrap();
        assert!(pool.check().unwrap_err().is_corruption());
    }

    #[test]
    fn overrun_into_next_stamp_is_caught_on_free() {
        let mut pool = pool(4);
        let a = pool.alloc(40, 8, false, false).unwrap();
        let b = pool.alloc(40, 8, false, false).unwrap();
        // Scribble over b's stamp from a's payload.
        let usable = pool.usable_size(a).unwrap();
        pool.bytes_mut(a, usable + 4).unwrap().fill(0xEE);
        assert_eq!(
            pool.free(b),
            Err(HeapError::Corrupted {
                index: 1,
                reason: "block stamp overwritten"
            })
        );
        assert!(pool.check().is_err());
    }

    #[test]
    fn bytes_are_bounds_checked() {
        let pool = pool(2);
        assert!(pool.bytes(pool.base(), 2 * GRAN).is_some());
        assert!(pool.bytes(pool.base(), 2 * GRAN + 1).is_none());
        assert!(pool.bytes(pool.base() - 1, 1).is_none());
    }
}
