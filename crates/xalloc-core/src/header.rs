//! In-band block header and padding arithmetic.
//!
//! Every pointer handed out by the facade is preceded by a [`BlockHeader`]
//! occupying the [`HEADER_SIZE`] bytes directly below it. The header address
//! is always derived from the user pointer by [`header_addr`]; it is never
//! stored anywhere else.
//!
//! ```text
//! base                                ptr
//! |<- padding ->|<---- BlockHeader ---->|<---- payload (size) ---->|
//! ```

use xalloc_heap::{Address, align_up};

pub const PTR_SIZE: usize = std::mem::size_of::<usize>();

/// Encoded header length: five little-endian `u64` fields.
pub const HEADER_SIZE: usize = 40;

const UNTRACKED: u64 = u64::MAX;

/// Metadata stored immediately below every user pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Start of the backend region this block owns.
    pub base: Address,
    /// Caller alignment (power of two).
    pub align: usize,
    /// Caller-visible size.
    pub size: usize,
    /// Copy of the user pointer; `0` once the block has been freed.
    pub ptr: Address,
    /// Live-list slot, when tracked.
    pub slot: Option<usize>,
}

impl BlockHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let slot = self.slot.map_or(UNTRACKED, |s| s as u64);
        let fields = [
            self.base as u64,
            self.align as u64,
            self.size as u64,
            self.ptr as u64,
            slot,
        ];
        let mut out = [0u8; HEADER_SIZE];
        for (chunk, field) in out.chunks_exact_mut(8).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        out
    }

    #[must_use]
    pub fn decode(raw: &[u8]) -> Option<Self> {
        let raw = raw.get(..HEADER_SIZE)?;
        let mut fields = [0u64; 5];
        for (field, chunk) in fields.iter_mut().zip(raw.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *field = u64::from_le_bytes(word);
        }
        let [base, align, size, ptr, slot] = fields;
        Some(Self {
            base: usize::try_from(base).ok()?,
            align: usize::try_from(align).ok()?,
            size: usize::try_from(size).ok()?,
            ptr: usize::try_from(ptr).ok()?,
            slot: (slot != UNTRACKED).then(|| usize::try_from(slot).ok()).flatten(),
        })
    }

    /// Header as written after a free.
    #[must_use]
    pub const fn tombstone(self) -> Self {
        Self { ptr: 0, ..self }
    }
}

/// Address of the header belonging to user pointer `ptr`.
#[inline]
#[must_use]
pub const fn header_addr(ptr: Address) -> Option<Address> {
    (ptr & !(PTR_SIZE - 1)).checked_sub(HEADER_SIZE)
}

/// Backend request derived from a caller request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Padding {
    /// Bytes to ask the backend for.
    pub total: usize,
    /// Alignment to ask the backend for.
    pub sys_align: usize,
}

/// Computes the backend request for `size` bytes at `align`.
///
/// The header is rounded up to `align`. When `align` exceeds what the backend
/// guarantees natively, one extra `align` lets the pointer be rounded up
/// inside the region; anti-coincidence costs one more.
#[must_use]
pub fn padded_request(
    size: usize,
    align: usize,
    max_align: usize,
    anti_coincidence: bool,
) -> Option<Padding> {
    let mut extra = align_up(HEADER_SIZE, align);
    if align > max_align {
        extra = extra.checked_add(align)?;
    }
    if anti_coincidence {
        extra = extra.checked_add(align)?;
    }
    Some(Padding {
        total: size.checked_add(extra)?,
        sys_align: align.min(max_align),
    })
}

/// User pointer for a block whose backend region starts at `base`.
#[must_use]
pub fn user_ptr(base: Address, align: usize, anti_coincidence: bool) -> Address {
    let ptr = align_up(base + HEADER_SIZE, align);
    // Aligned to `align` and bit `align` clear means aligned to 2 * align.
    if anti_coincidence && ptr & align == 0 {
        ptr + align
    } else {
        ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_with_and_without_slot() {
        let tracked = BlockHeader {
            base: 0x1000,
            align: 64,
            size: 123,
            ptr: 0x1040,
            slot: Some(7),
        };
        assert_eq!(BlockHeader::decode(&tracked.encode()), Some(tracked));
        let untracked = BlockHeader { slot: None, ..tracked };
        assert_eq!(BlockHeader::decode(&untracked.encode()), Some(untracked));
    }

    #[test]
    fn decode_rejects_short_input() {
        assert_eq!(BlockHeader::decode(&[0u8; HEADER_SIZE - 1]), None);
    }

    #[test]
    fn header_sits_directly_below_aligned_pointer() {
        assert_eq!(header_addr(0x2000), Some(0x2000 - HEADER_SIZE));
        assert_eq!(header_addr(8), None);
    }

    #[test]
    fn padding_adds_overalignment_and_anti_coincidence() {
        let plain = padded_request(100, 16, 16, false).unwrap();
        assert_eq!(plain, Padding { total: 148, sys_align: 16 });

        let over = padded_request(100, 256, 16, false).unwrap();
        assert_eq!(over, Padding { total: 100 + 256 + 256, sys_align: 16 });

        let anti = padded_request(100, 16, 16, true).unwrap();
        assert_eq!(anti.total, 148 + 16);
    }

    #[test]
    fn padding_overflow_is_reported() {
        assert_eq!(padded_request(usize::MAX - 8, 16, 16, false), None);
    }

    #[test]
    fn anti_coincidence_skips_doubly_aligned_pointers() {
        // base + 40 rounds to 0x1030, which is only 16-aligned.
        assert_eq!(user_ptr(0x1000, 16, true), 0x1030);
        // base + 40 rounds to 0x1080, which is 128-aligned as well.
        assert_eq!(user_ptr(0x1058, 64, false), 0x1080);
        assert_eq!(user_ptr(0x1058, 64, true), 0x10C0);
    }

    #[test]
    fn user_range_stays_inside_padded_region() {
        for base in (0x1000..0x1400).step_by(8) {
            for align in [8usize, 16, 32, 64, 128, 512] {
                for anti in [false, true] {
                    let max_align = 16;
                    if base % align.min(max_align) != 0 {
                        continue;
                    }
                    let pad = padded_request(10, align, max_align, anti).unwrap();
                    let ptr = user_ptr(base, align, anti);
                    assert_eq!(ptr % align, 0);
                    assert!(ptr - HEADER_SIZE >= base);
                    assert!(ptr + 10 <= base + pad.total, "base {base:#x} align {align}");
                }
            }
        }
    }
}
