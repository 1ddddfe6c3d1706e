//! Metadata bytes and group scans.
//!
//! Every group starts with a 16-byte metadata array, one byte per slot. A
//! scan compares all 16 bytes against a target at once and reports the
//! matching slots as a [`BitMask`].

/// Number of slots in a group. Capacity is always a multiple of this.
pub const GROUP_SIZE: usize = 16;

/// Metadata byte of a slot that has never held an entry since the last
/// rehash.
pub const EMPTY: u8 = 0;

/// Metadata byte of a slot whose entry was removed.
pub const TOMBSTONE: u8 = 1;

/// Derives the metadata tag for `hash` from its low byte.
///
/// The two sentinel values are skipped, so the result is always in `2..=255`.
///
/// ```rust
/// use layout_map::group::tag;
///
/// assert_eq!(tag(0x1234), 0x34);
/// assert_eq!(tag(0x100), 2);
/// assert_eq!(tag(0x101), 2);
/// assert_eq!(tag(0xff), 0xff);
/// ```
#[inline(always)]
pub fn tag(hash: u64) -> u8 {
    let mut tag = hash as u8;
    if tag == EMPTY {
        tag += 1;
    }
    if tag == TOMBSTONE {
        tag += 1;
    }
    tag
}

/// A set of slot indices within one group, one bit per slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BitMask(pub u16);

impl BitMask {
    /// Returns `true` if any slot is in the set.
    #[inline(always)]
    pub fn any_bit_set(self) -> bool {
        self.0 != 0
    }

    /// Returns the lowest slot index in the set.
    #[inline(always)]
    pub fn lowest_set_bit(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Number of slots in the set.
    #[inline(always)]
    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Slots not in the set.
    #[inline(always)]
    pub fn invert(self) -> Self {
        BitMask(!self.0)
    }

    /// Slots in both sets.
    #[inline(always)]
    pub fn and(self, other: Self) -> Self {
        BitMask(self.0 & other.0)
    }

    /// Slots in either set.
    #[inline(always)]
    pub fn or(self, other: Self) -> Self {
        BitMask(self.0 | other.0)
    }
}

impl IntoIterator for BitMask {
    type Item = usize;
    type IntoIter = BitMaskIter;

    #[inline(always)]
    fn into_iter(self) -> BitMaskIter {
        BitMaskIter(self)
    }
}

/// Iterator over the slot indices of a [`BitMask`], lowest first.
#[derive(Clone, Debug)]
pub struct BitMaskIter(BitMask);

impl Iterator for BitMaskIter {
    type Item = usize;

    #[inline(always)]
    fn next(&mut self) -> Option<usize> {
        let bit = self.0.lowest_set_bit()?;
        self.0.0 &= self.0.0 - 1;
        Some(bit)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count();
        (n, Some(n))
    }
}

impl ExactSizeIterator for BitMaskIter {}
impl core::iter::FusedIterator for BitMaskIter {}

/// The metadata array at the start of every group.
///
/// Aligned to 16 so the SSE2 scan can use an aligned load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Metadata {
    /// One byte per slot: [`EMPTY`], [`TOMBSTONE`] or a tag.
    pub bytes: [u8; GROUP_SIZE],
}

impl Metadata {
    /// Metadata of a group with every slot empty.
    pub const EMPTY: Metadata = Metadata {
        bytes: [EMPTY; GROUP_SIZE],
    };

    /// Returns the slots whose metadata byte equals `byte`.
    #[inline(always)]
    pub fn match_byte(&self, byte: u8) -> BitMask {
        cfg_if::cfg_if! {
            if #[cfg(all(
                any(target_arch = "x86", target_arch = "x86_64"),
                target_feature = "sse2",
            ))] {
                self.match_byte_sse2(byte)
            } else {
                self.match_byte_generic(byte)
            }
        }
    }

    /// Portable scalar version of [`Metadata::match_byte`].
    #[inline]
    pub fn match_byte_generic(&self, byte: u8) -> BitMask {
        let mut bits: u16 = 0;
        for i in 0..GROUP_SIZE {
            if self.bytes[i] == byte {
                bits |= 1 << i;
            }
        }
        BitMask(bits)
    }

    /// SSE2 version of [`Metadata::match_byte`].
    #[cfg(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "sse2",
    ))]
    #[inline(always)]
    pub fn match_byte_sse2(&self, byte: u8) -> BitMask {
        #[cfg(target_arch = "x86")]
        use core::arch::x86 as arch;
        #[cfg(target_arch = "x86_64")]
        use core::arch::x86_64 as arch;

        // SAFETY: `Metadata` is `#[repr(C, align(16))]` with `bytes` at offset 0
        // and exactly 16 bytes long, which makes the aligned 128-bit load
        // valid. SSE2 availability is guaranteed by the `cfg`.
        unsafe {
            let data = arch::_mm_load_si128(self.bytes.as_ptr() as *const arch::__m128i);
            let cmp = arch::_mm_cmpeq_epi8(data, arch::_mm_set1_epi8(byte as i8));
            BitMask(arch::_mm_movemask_epi8(cmp) as u16)
        }
    }

    /// Slots that have never been used since the last rehash.
    #[inline(always)]
    pub fn match_empty(&self) -> BitMask {
        self.match_byte(EMPTY)
    }

    /// Slots whose entry was removed.
    #[inline(always)]
    pub fn match_tombstone(&self) -> BitMask {
        self.match_byte(TOMBSTONE)
    }

    /// Slots holding a live entry.
    #[inline(always)]
    pub fn match_full(&self) -> BitMask {
        self.match_empty().or(self.match_tombstone()).invert()
    }
}
