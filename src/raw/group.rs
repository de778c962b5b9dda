use super::bitmask::BitMask;
use core::{mem, ptr};

use crate::raw::{DELETED, EMPTY};

// Use the native word size as the group size. Using a 64-bit group size
// on a 32-bit architecture will just end up being more expensive
// because shifts and multiplies will need to be emulated.
cfg_if::cfg_if! {
    if #[cfg(any(
        target_pointer_width = "64",
        target_arch = "aarch64",
        target_arch = "x86_64",
    ))] {
        type GroupWord = u64;
    } else {
        type GroupWord = u32;
    }
}

pub(crate) type BitMaskWord = GroupWord;
pub(crate) const BITMASK_STRIDE: usize = 8;
pub(crate) const BITMASK_MASK: BitMaskWord = repeat(0x80);

/// Helper function to replicate a byte across a `GroupWord`.
#[inline]
const fn repeat(byte: u8) -> GroupWord {
    GroupWord::from_ne_bytes([byte; Group::WIDTH])
}

/// Abstraction over a group of control bytes which can be scanned in
/// parallel.
///
/// This implementation uses a word-sized integer and SWAR tricks; all
/// operations happen in the native endianness, converting to
/// little-endian just before a `BitMask` is produced so that lane 0 of
/// the mask is always the group's first byte.
#[derive(Copy, Clone)]
pub(crate) struct Group(GroupWord);

#[allow(clippy::use_self)]
impl Group {
    /// Number of bytes in the group.
    pub(crate) const WIDTH: usize = mem::size_of::<Self>();

    /// Returns a full group of empty control bytes, suitable as the
    /// control array of a bucket with no storage.
    ///
    /// This is guaranteed to be aligned to the group size.
    #[inline]
    pub(crate) const fn static_empty() -> &'static [u8; Group::WIDTH] {
        #[repr(C)]
        struct AlignedBytes {
            _align: [Group; 0],
            bytes: [u8; Group::WIDTH],
        }
        const ALIGNED_BYTES: AlignedBytes = AlignedBytes {
            _align: [],
            bytes: [EMPTY; Group::WIDTH],
        };
        &ALIGNED_BYTES.bytes
    }

    /// Loads a group of control bytes starting at the given address.
    #[inline]
    #[allow(clippy::cast_ptr_alignment)] // unaligned load
    pub(crate) unsafe fn load(ptr: *const u8) -> Self {
        Group(ptr::read_unaligned(ptr.cast()))
    }

    /// Loads a group of control bytes starting at the given address,
    /// which must be aligned to `mem::align_of::<Group>()`.
    #[inline]
    #[allow(clippy::cast_ptr_alignment)]
    pub(crate) unsafe fn load_aligned(ptr: *const u8) -> Self {
        debug_assert_eq!(ptr.align_offset(mem::align_of::<Self>()), 0);
        Group(ptr::read(ptr.cast()))
    }

    /// Stores the group of control bytes to the given address, which
    /// must be aligned to `mem::align_of::<Group>()`.
    #[inline]
    #[allow(clippy::cast_ptr_alignment)]
    pub(crate) unsafe fn store_aligned(self, ptr: *mut u8) {
        debug_assert_eq!(ptr.align_offset(mem::align_of::<Self>()), 0);
        ptr::write(ptr.cast(), self.0);
    }

    /// Returns a `BitMask` indicating all bytes in the group which
    /// *may* have the given value.
    ///
    /// This function may return a false positive in certain cases
    /// where the byte in the group differs from the searched value
    /// only in its lowest bit. This is fine because:
    /// - This never happens for `EMPTY` and `DELETED`, only full bytes.
    /// - The check for key equality will catch these.
    /// - This only happens if there is at least 1 true match.
    /// - The chance of this happening is very low (< 1% chance per byte).
    #[inline]
    pub(crate) fn match_byte(self, byte: u8) -> BitMask {
        // This algorithm is derived from
        // https://graphics.stanford.edu/~seander/bithacks.html##ValueInWord
        let cmp = self.0 ^ repeat(byte);
        BitMask((cmp.wrapping_sub(repeat(0x01)) & !cmp & repeat(0x80)).to_le())
    }

    /// Returns a `BitMask` indicating all bytes in the group which are
    /// `EMPTY`.
    #[inline]
    pub(crate) fn match_empty(self) -> BitMask {
        // The only byte with both bit 7 and bit 6 set is EMPTY
        // (1111_1111): DELETED is 1000_0000 and SENTINEL keeps bit 6
        // clear, while full bytes keep bit 7 clear.
        BitMask((self.0 & (self.0 << 1) & repeat(0x80)).to_le())
    }

    /// Returns a `BitMask` indicating all bytes in the group which are
    /// `EMPTY` or `DELETED`, but never the sentinel.
    #[inline]
    pub(crate) fn match_empty_or_deleted(self) -> BitMask {
        self.match_empty() | self.match_byte(DELETED)
    }

    /// Returns a `BitMask` indicating all bytes in the group which are
    /// full.
    #[inline]
    pub(crate) fn match_full(self) -> BitMask {
        // Full is exactly "top bit clear"; the sentinel and every
        // special byte carry the top bit.
        BitMask((self.0 & repeat(0x80)).to_le()).invert()
    }

    /// Performs the following transformation on all bytes in the group:
    /// - `EMPTY => EMPTY`
    /// - `DELETED => EMPTY`
    /// - `SENTINEL => EMPTY` (the caller restores it)
    /// - `FULL => DELETED`
    #[inline]
    pub(crate) fn convert_special_to_empty_and_full_to_deleted(self) -> Self {
        // Map high_bit = 1 (EMPTY, DELETED, SENTINEL) to 1111_1111
        // and high_bit = 0 (FULL) to 1000_0000
        //
        //   let full = 1000_0000 (true) or 0000_0000 (false)
        //   !1000_0000 + 1 = 0111_1111 + 1 = 1000_0000 (no carry)
        //   !0000_0000 + 0 = 1111_1111 + 0 = 1111_1111 (no carry)
        let full = !self.0 & repeat(0x80);
        Group(!full + (full >> 7))
    }
}
