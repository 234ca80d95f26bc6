//! Per-block descriptors.
//!
//! Every physical block inside a pool has an [`AreaInfo`] in the pool's
//! descriptor table, indexed by the block's first unit. The first
//! [`AREA_HEADER_SIZE`] bytes of each block carry a stamp mirroring the
//! descriptor so that overruns from the preceding block are caught.

use crate::backend::Address;

/// Corruption sentinel stored in every descriptor and stamp.
pub const AREA_MAGIC: u32 = 0x4152_4541;

/// Bytes reserved at the start of every block for its stamp.
pub const AREA_HEADER_SIZE: usize = 16;

const STAMP_FREE: u32 = 1 << 0;
const STAMP_TEMP: u32 = 1 << 1;

/// Bookkeeping valid only while a block is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Size the caller asked for.
    pub size: usize,
    /// Whether the request carried the TEMP flag.
    pub temp: bool,
    /// Whether the block was carved from the top of a free run.
    pub top: bool,
    /// Alignment of the user pointer.
    pub align: usize,
    /// Padding between the end of the stamp and the user pointer.
    pub alignofs: usize,
    /// User-visible pointer.
    pub base: Address,
}

/// Descriptor of one physical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaInfo {
    pub magic: u32,
    pub free: bool,
    /// Owned by the temp pool.
    pub temp: bool,
    /// Size in granularity units; `0` marks the fencepost.
    pub nblocks: usize,
    /// Physically preceding block.
    pub prev: Option<usize>,
    /// Free-list links, meaningful only while `free`.
    pub prev_free: Option<usize>,
    pub next_free: Option<usize>,
    pub alloc: Option<Allocation>,
}

impl AreaInfo {
    /// A block that is neither on the free list nor allocated yet.
    pub(crate) const fn detached(nblocks: usize, prev: Option<usize>, temp: bool) -> Self {
        Self {
            magic: AREA_MAGIC,
            free: false,
            temp,
            nblocks,
            prev,
            prev_free: None,
            next_free: None,
            alloc: None,
        }
    }

    pub(crate) const fn fencepost(prev: Option<usize>, temp: bool) -> Self {
        Self::detached(0, prev, temp)
    }

    #[must_use]
    pub const fn is_fencepost(&self) -> bool {
        self.nblocks == 0
    }

    /// Encodes the in-band stamp: magic, state bits, block count.
    pub(crate) fn stamp(&self) -> [u8; AREA_HEADER_SIZE] {
        let mut bits = 0u32;
        if self.free {
            bits |= STAMP_FREE;
        }
        if self.temp {
            bits |= STAMP_TEMP;
        }
        let mut out = [0u8; AREA_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&bits.to_le_bytes());
        out[8..16].copy_from_slice(&(self.nblocks as u64).to_le_bytes());
        out
    }

    /// Whether `raw` is the stamp this descriptor would write.
    pub(crate) fn matches_stamp(&self, raw: &[u8]) -> bool {
        raw.len() >= AREA_HEADER_SIZE && raw[..AREA_HEADER_SIZE] == self.stamp()
    }
}
