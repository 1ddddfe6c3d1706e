//! Runtime bucket layout.
//!
//! Key and value types are only known as a size and an alignment when a
//! table is created, so the position of every key and value inside a group is
//! derived once here and reused by every probe.
//!
//! One group is laid out as:
//!
//! ```text
//! +------------------+---------+----------------+---------+------------------+---------+
//! | metadata [u8;16] | padding | keys [K; 16]   | padding | values [V; 16]   | padding |
//! +------------------+---------+----------------+---------+------------------+---------+
//! ^ 0                          ^ key_offset               ^ value_offset               ^ group_stride
//! ```

use core::alloc::Layout;
use core::mem;

use crate::Error;
use crate::group::GROUP_SIZE;
use crate::group::Metadata;

/// Size and alignment of the key and value types stored in a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MapLayout {
    /// Size of one key in bytes. Must be non-zero.
    pub key_size: usize,
    /// Alignment of one key in bytes.
    pub key_align: usize,
    /// Size of one value in bytes. May be zero.
    pub value_size: usize,
    /// Alignment of one value in bytes.
    pub value_align: usize,
}

impl MapLayout {
    /// Describes keys and values by size only; each alignment defaults to its
    /// size (or 1 for zero-sized values).
    ///
    /// ```rust
    /// use layout_map::layout::MapLayout;
    ///
    /// let layout = MapLayout::new(4, 8);
    /// assert_eq!(layout.key_align, 4);
    /// assert_eq!(layout.value_align, 8);
    /// ```
    pub const fn new(key_size: usize, value_size: usize) -> Self {
        Self {
            key_size,
            key_align: if key_size == 0 { 1 } else { key_size },
            value_size,
            value_align: if value_size == 0 { 1 } else { value_size },
        }
    }

    /// Describes keys and values with explicit alignments.
    pub const fn with_align(
        key_size: usize,
        key_align: usize,
        value_size: usize,
        value_align: usize,
    ) -> Self {
        Self {
            key_size,
            key_align,
            value_size,
            value_align,
        }
    }

    /// Describes the layout of `K` and `V`.
    ///
    /// ```rust
    /// use layout_map::layout::MapLayout;
    ///
    /// let layout = MapLayout::of::<u32, f64>();
    /// assert_eq!(layout, MapLayout::with_align(4, 4, 8, 8));
    /// ```
    pub const fn of<K, V>() -> Self {
        Self {
            key_size: mem::size_of::<K>(),
            key_align: mem::align_of::<K>(),
            value_size: mem::size_of::<V>(),
            value_align: mem::align_of::<V>(),
        }
    }
}

/// Byte offsets and stride of one group, derived from a [`MapLayout`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupLayout {
    key_size: usize,
    value_size: usize,
    key_offset: usize,
    value_offset: usize,
    group_stride: usize,
    group_align: usize,
}

#[inline]
fn pad_to(offset: usize, multiple: usize) -> Option<usize> {
    debug_assert!(multiple > 0);
    offset.checked_next_multiple_of(multiple)
}

/// Largest power of two dividing `pad`.
#[inline]
fn pow2_divisor(pad: usize) -> usize {
    1 << pad.trailing_zeros()
}

impl GroupLayout {
    /// Computes the group layout for `layout`.
    ///
    /// Key and value arrays start at a multiple of `max(align, size)`, which
    /// need not be a power of two. Fails with [`Error::InvalidArgument`] only
    /// if the key is zero-sized or the offsets overflow.
    pub fn new(layout: &MapLayout) -> Result<Self, Error> {
        if layout.key_size == 0 {
            return Err(Error::InvalidArgument);
        }

        let meta_size = mem::size_of::<Metadata>();
        let meta_align = mem::align_of::<Metadata>();

        let key_pad = layout.key_align.max(layout.key_size);
        let value_pad = layout.value_align.max(layout.value_size).max(1);
        let group_align = meta_align
            .max(pow2_divisor(key_pad))
            .max(pow2_divisor(value_pad));

        let overflow = || Error::InvalidArgument;
        let key_offset = pad_to(meta_size, key_pad).ok_or_else(overflow)?;
        let keys_end = layout
            .key_size
            .checked_mul(GROUP_SIZE)
            .and_then(|bytes| bytes.checked_add(key_offset))
            .ok_or_else(overflow)?;
        let value_offset = pad_to(keys_end, value_pad).ok_or_else(overflow)?;
        let values_end = layout
            .value_size
            .checked_mul(GROUP_SIZE)
            .and_then(|bytes| bytes.checked_add(value_offset))
            .ok_or_else(overflow)?;
        let group_stride = pad_to(values_end, group_align).ok_or_else(overflow)?;

        Ok(Self {
            key_size: layout.key_size,
            value_size: layout.value_size,
            key_offset,
            value_offset,
            group_stride,
            group_align,
        })
    }

    /// Size of one key in bytes.
    #[inline(always)]
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// Size of one value in bytes.
    #[inline(always)]
    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// Offset of the key array from the start of a group.
    #[inline(always)]
    pub fn key_offset(&self) -> usize {
        self.key_offset
    }

    /// Offset of the value array from the start of a group.
    #[inline(always)]
    pub fn value_offset(&self) -> usize {
        self.value_offset
    }

    /// Total size of one group, including trailing padding.
    #[inline(always)]
    pub fn group_stride(&self) -> usize {
        self.group_stride
    }

    /// Alignment every group start satisfies.
    #[inline(always)]
    pub fn group_align(&self) -> usize {
        self.group_align
    }

    /// Memory layout of a buffer holding `groups` contiguous groups.
    ///
    /// Fails with [`Error::OutOfMemory`] if the size overflows.
    pub fn buffer_layout(&self, groups: usize) -> Result<Layout, Error> {
        let size = self
            .group_stride
            .checked_mul(groups)
            .ok_or(Error::OutOfMemory)?;
        Layout::from_size_align(size, self.group_align).map_err(|_| Error::OutOfMemory)
    }

    #[inline(always)]
    pub(crate) fn group_start(&self, group: usize) -> usize {
        group * self.group_stride
    }

    #[inline(always)]
    pub(crate) fn key_start(&self, group: usize, slot: usize) -> usize {
        debug_assert!(slot < GROUP_SIZE);
        self.group_start(group) + self.key_offset + slot * self.key_size
    }

    #[inline(always)]
    pub(crate) fn value_start(&self, group: usize, slot: usize) -> usize {
        debug_assert!(slot < GROUP_SIZE);
        self.group_start(group) + self.value_offset + slot * self.value_size
    }
}
