use core::fmt::Debug;
use core::marker::PhantomData;
use core::ops::ControlFlow;
use core::ptr::NonNull;

use allocator_api2::alloc::Allocator;
use allocator_api2::alloc::Global;

use crate::Error;
use crate::group::BitMask;
use crate::group::BitMaskIter;
use crate::group::EMPTY;
use crate::group::GROUP_SIZE;
use crate::group::Metadata;
use crate::group::TOMBSTONE;
use crate::group::tag;
use crate::layout::GroupLayout;
use crate::layout::MapLayout;
use crate::strategy::DefaultStrategy;
use crate::strategy::KeyStrategy;

/// Most slots, live or tombstoned, a table of `capacity` slots holds before it
/// rehashes. The remaining 30% stay empty so every probe terminates.
#[inline(always)]
pub(crate) fn max_load(capacity: usize) -> usize {
    ((capacity as u128 * 7) / 10) as usize
}

/// Smallest capacity, doubling from `current` (or from one group), whose
/// load limit covers `entries`.
#[inline]
fn capacity_for(entries: usize, current: usize) -> Result<usize, Error> {
    let mut capacity = current.checked_mul(2).ok_or(Error::OutOfMemory)?.max(GROUP_SIZE);
    while max_load(capacity) < entries {
        capacity = capacity.checked_mul(2).ok_or(Error::OutOfMemory)?;
    }
    Ok(capacity)
}

/// Where a probe for a key ended.
enum Probe {
    /// The key is stored at `(group, slot)`.
    Occupied(usize, usize),
    /// The key is absent; `(group, slot)` is the empty slot it would take.
    Vacant(usize, usize),
    /// Every group was visited without finding the key or an empty slot.
    Exhausted,
}

/// Debug statistics for hash table analysis.
///
/// Requires the `stats` feature.
#[cfg(any(test, feature = "stats"))]
#[derive(Debug, Clone)]
pub struct DebugStats {
    /// Number of live entries
    pub populated: usize,
    /// Number of tombstoned slots
    pub tombstones: usize,
    /// Total number of slots allocated
    pub capacity: usize,
    /// Number of groups allocated
    pub groups: usize,
    /// Slots that may be used before the next rehash
    pub max_load: usize,
    /// Load factor (populated / capacity)
    pub load_factor: f64,
    /// Slot utilization ((populated + tombstones) / capacity)
    pub slot_utilization: f64,
    /// Bytes of one group, metadata and padding included
    pub group_stride: usize,
    /// Total memory in bytes used by the table
    pub total_bytes: usize,
    /// Bytes not holding a live key or value
    pub wasted_bytes: usize,
}

#[cfg(any(test, feature = "stats"))]
impl DebugStats {
    /// Pretty-print the debug statistics.
    #[cfg(feature = "std")]
    pub fn print(&self) {
        println!("=== Hash Table Debug Statistics ===");
        println!(
            "Population: {}/{} ({:.2}% load factor, limit {})",
            self.populated,
            self.capacity,
            self.load_factor * 100.0,
            self.max_load
        );
        println!(
            "Slot Usage: {} live + {} tombstones ({:.2}% utilization)",
            self.populated,
            self.tombstones,
            self.slot_utilization * 100.0
        );
        println!(
            "Groups: {} x {} bytes = {} bytes",
            self.groups, self.group_stride, self.total_bytes
        );
        println!(
            "Memory: {} bytes wasted ({:.02}%)",
            self.wasted_bytes,
            if self.total_bytes == 0 {
                0.0
            } else {
                (self.wasted_bytes as f64 / self.total_bytes as f64) * 100.0
            }
        );
    }
}

/// A type-erased open-addressing hash table.
///
/// Keys and values are fixed-size byte strings whose size and alignment are
/// given as a [`MapLayout`] when the table is created. Slots are packed into
/// groups of [`GROUP_SIZE`]; each group holds a metadata array followed by its
/// keys and then its values. Collisions move to the next group (bucket-level
/// linear probing) and removals leave tombstones behind until the next
/// rehash.
///
/// Keys are hashed and compared by the [`KeyStrategy`] `S`, and the backing
/// buffer comes from the allocator `A`.
///
/// ## Example
///
/// ```rust
/// use layout_map::HashTable;
/// use layout_map::MapLayout;
///
/// let mut table = HashTable::new(MapLayout::of::<u32, f32>())?;
/// table.insert(&7u32.to_ne_bytes(), &1.5f32.to_ne_bytes())?;
///
/// let value = table.get(&7u32.to_ne_bytes()).unwrap();
/// assert_eq!(f32::from_ne_bytes(value.try_into().unwrap()), 1.5);
/// # Ok::<(), layout_map::Error>(())
/// ```
pub struct HashTable<S = DefaultStrategy, A: Allocator = Global> {
    buffer: Option<NonNull<u8>>,
    capacity_log2: u32,

    count: usize,
    tombstones: usize,

    map_layout: MapLayout,
    layout: GroupLayout,

    strategy: S,
    alloc: A,
}

// SAFETY: The table exclusively owns its buffer, which holds plain bytes.
// Sending it is sound whenever the strategy and allocator may be sent.
unsafe impl<S: Send, A: Allocator + Send> Send for HashTable<S, A> {}

// SAFETY: Shared references only read the buffer.
unsafe impl<S: Sync, A: Allocator + Sync> Sync for HashTable<S, A> {}

impl<S, A: Allocator> Debug for HashTable<S, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use alloc::format;
        use alloc::string::String;
        use alloc::string::ToString;
        use alloc::vec::Vec;

        let mut metadata: Vec<String> = Vec::with_capacity(self.groups());
        for group in 0..self.groups() {
            // SAFETY: `group` is in bounds of the allocated buffer.
            let meta = unsafe { self.metadata(group) };
            let items: Vec<String> = meta
                .bytes
                .iter()
                .map(|&b| match b {
                    EMPTY => "..".to_string(),
                    TOMBSTONE => "xx".to_string(),
                    tag => format!("{tag:02x}"),
                })
                .collect();
            metadata.push(items.join(", "));
        }

        f.debug_struct("HashTable")
            .field("metadata", &metadata)
            .field("count", &self.count)
            .field("tombstones", &self.tombstones)
            .field("capacity", &self.capacity())
            .field("layout", &self.layout)
            .finish()
    }
}

impl<S: Clone, A: Allocator + Clone> Clone for HashTable<S, A> {
    fn clone(&self) -> Self {
        self.try_clone().unwrap_or_else(|_| {
            let layout = self
                .layout
                .buffer_layout(self.groups())
                .unwrap_or(core::alloc::Layout::new::<Metadata>());
            alloc::alloc::handle_alloc_error(layout)
        })
    }
}

impl<S, A: Allocator> Drop for HashTable<S, A> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if let Ok(layout) = self.layout.buffer_layout(self.groups_for(self.capacity_log2)) {
                // SAFETY: `buffer` was returned by `self.alloc` for exactly this
                // layout and is released once, here.
                unsafe { self.alloc.deallocate(buffer, layout) };
            }
        }
    }
}

impl HashTable<DefaultStrategy, Global> {
    /// Creates an empty table for `layout` using the default strategy and the
    /// global allocator. No memory is allocated until the first insertion.
    ///
    /// Fails with [`Error::InvalidArgument`] if the key is zero-sized.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use layout_map::Error;
    /// use layout_map::HashTable;
    /// use layout_map::MapLayout;
    ///
    /// let table = HashTable::new(MapLayout::new(8, 8)).unwrap();
    /// assert_eq!(table.capacity(), 0);
    ///
    /// assert_eq!(HashTable::new(MapLayout::new(0, 8)).unwrap_err(), Error::InvalidArgument);
    /// ```
    pub fn new(layout: MapLayout) -> Result<Self, Error> {
        Self::new_in(layout, DefaultStrategy::default(), Global)
    }

    /// Creates a table for `layout` that holds at least `capacity` entries
    /// without growing.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use layout_map::HashTable;
    /// use layout_map::MapLayout;
    ///
    /// let table = HashTable::with_capacity(MapLayout::new(4, 8), 1000)?;
    /// assert_eq!(table.capacity(), 2048);
    /// # Ok::<(), layout_map::Error>(())
    /// ```
    pub fn with_capacity(layout: MapLayout, capacity: usize) -> Result<Self, Error> {
        Self::with_capacity_in(layout, capacity, DefaultStrategy::default(), Global)
    }
}

impl<S: KeyStrategy> HashTable<S, Global> {
    /// Creates an empty table for `layout` that hashes and compares keys with
    /// `strategy`.
    pub fn with_strategy(layout: MapLayout, strategy: S) -> Result<Self, Error> {
        Self::new_in(layout, strategy, Global)
    }
}

impl<S: KeyStrategy, A: Allocator> HashTable<S, A> {
    /// Creates an empty table for `layout` with an explicit strategy and
    /// allocator.
    pub fn new_in(layout: MapLayout, strategy: S, alloc: A) -> Result<Self, Error> {
        Ok(Self {
            buffer: None,
            capacity_log2: 0,
            count: 0,
            tombstones: 0,
            map_layout: layout,
            layout: GroupLayout::new(&layout)?,
            strategy,
            alloc,
        })
    }

    /// Creates a table for `layout` that holds at least `capacity` entries
    /// without growing, with an explicit strategy and allocator.
    ///
    /// Fails with [`Error::OutOfMemory`] if the allocation fails.
    pub fn with_capacity_in(
        layout: MapLayout,
        capacity: usize,
        strategy: S,
        alloc: A,
    ) -> Result<Self, Error> {
        let mut table = Self::new_in(layout, strategy, alloc)?;
        table.reserve(capacity)?;
        Ok(table)
    }

    /// Replaces the key strategy.
    ///
    /// Only allowed while the table holds no entries, since stored entries were
    /// placed by the old hash. Fails with [`Error::InvalidArgument`] otherwise.
    pub fn use_strategy(&mut self, strategy: S) -> Result<(), Error> {
        if self.count != 0 {
            return Err(Error::InvalidArgument);
        }
        self.strategy = strategy;
        Ok(())
    }

    /// Returns the value stored for `key`, or `None` if the key is absent or
    /// not `key_size` bytes long.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use layout_map::HashTable;
    /// use layout_map::MapLayout;
    ///
    /// let mut table = HashTable::new(MapLayout::new(2, 1))?;
    /// table.set(b"ab", b"x")?;
    /// assert_eq!(table.get(b"ab"), Some(&b"x"[..]));
    /// assert_eq!(table.get(b"zz"), None);
    /// assert_eq!(table.get(b"abc"), None);
    /// # Ok::<(), layout_map::Error>(())
    /// ```
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        if key.len() != self.layout.key_size() {
            return None;
        }

        match self.probe(self.strategy.hash(key), key) {
            // SAFETY: The probe returned an in-bounds occupied slot.
            Probe::Occupied(group, slot) => Some(unsafe { self.value(group, slot) }),
            Probe::Vacant(..) | Probe::Exhausted => None,
        }
    }

    /// Returns a mutable view of the value stored for `key`.
    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut [u8]> {
        if key.len() != self.layout.key_size() {
            return None;
        }

        match self.probe(self.strategy.hash(key), key) {
            // SAFETY: The probe returned an in-bounds occupied slot.
            Probe::Occupied(group, slot) => Some(unsafe { self.value_mut(group, slot) }),
            Probe::Vacant(..) | Probe::Exhausted => None,
        }
    }

    /// Returns `true` if `key` is present.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Stores `value` for `key`, overwriting the value of an existing entry.
    ///
    /// Fails with [`Error::InvalidArgument`] if either slice has the wrong
    /// length, and with [`Error::OutOfMemory`] if the table had to grow and
    /// could not.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.check_entry(key, value)?;
        self.reserve(1)?;

        let hash = self.strategy.hash(key);
        match self.probe(hash, key) {
            Probe::Occupied(group, slot) => {
                // SAFETY: The probe returned an in-bounds occupied slot.
                unsafe { self.value_mut(group, slot) }.copy_from_slice(value);
                Ok(())
            }
            Probe::Vacant(group, slot) => {
                // SAFETY: The probe returned an in-bounds empty slot.
                unsafe { self.write_slot(group, slot, tag(hash), key, value) };
                self.count += 1;
                Ok(())
            }
            Probe::Exhausted => Err(self.exhausted()),
        }
    }

    /// Stores `value` for `key`, which must not be present yet.
    ///
    /// Fails with [`Error::AlreadyExists`] if the key is present, leaving its
    /// value untouched.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use layout_map::Error;
    /// use layout_map::HashTable;
    /// use layout_map::MapLayout;
    ///
    /// let mut table = HashTable::new(MapLayout::new(1, 1))?;
    /// table.insert(b"k", b"1")?;
    /// assert_eq!(table.insert(b"k", b"2"), Err(Error::AlreadyExists));
    /// assert_eq!(table.get(b"k"), Some(&b"1"[..]));
    /// # Ok::<(), Error>(())
    /// ```
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.check_entry(key, value)?;
        self.reserve(1)?;

        let hash = self.strategy.hash(key);
        match self.probe(hash, key) {
            Probe::Occupied(..) => Err(Error::AlreadyExists),
            Probe::Vacant(group, slot) => {
                // SAFETY: The probe returned an in-bounds empty slot.
                unsafe { self.write_slot(group, slot, tag(hash), key, value) };
                self.count += 1;
                Ok(())
            }
            Probe::Exhausted => Err(self.exhausted()),
        }
    }

    /// Removes the entry for `key`, leaving a tombstone in its slot.
    ///
    /// Fails with [`Error::NotFound`] if the key is absent and with
    /// [`Error::InvalidArgument`] if it is not `key_size` bytes long.
    pub fn remove(&mut self, key: &[u8]) -> Result<(), Error> {
        self.remove_with(key, |_| ())
    }

    /// Removes the entry for `key`, handing its value to `read` before the
    /// slot is tombstoned.
    pub(crate) fn remove_with<R>(
        &mut self,
        key: &[u8],
        read: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, Error> {
        if key.len() != self.layout.key_size() {
            return Err(Error::InvalidArgument);
        }

        match self.probe(self.strategy.hash(key), key) {
            Probe::Occupied(group, slot) => {
                // SAFETY: The probe returned an in-bounds occupied slot.
                let removed = read(unsafe { self.value(group, slot) });
                // SAFETY: As above.
                unsafe { self.erase(group, slot) };
                Ok(removed)
            }
            Probe::Vacant(..) | Probe::Exhausted => Err(Error::NotFound),
        }
    }

    /// Calls `visitor` with every entry in slot order. The value may be
    /// modified in place.
    ///
    /// Stops as soon as the visitor returns [`ControlFlow::Break`] and reports
    /// [`Error::Interrupted`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use core::ops::ControlFlow;
    ///
    /// use layout_map::HashTable;
    /// use layout_map::MapLayout;
    ///
    /// let mut table = HashTable::new(MapLayout::new(1, 1))?;
    /// table.set(b"a", &[1])?;
    /// table.set(b"b", &[2])?;
    ///
    /// table.each(|_, value| {
    ///     value[0] *= 10;
    ///     ControlFlow::Continue(())
    /// })?;
    /// assert_eq!(table.get(b"b"), Some(&[20u8][..]));
    /// # Ok::<(), layout_map::Error>(())
    /// ```
    pub fn each(
        &mut self,
        mut visitor: impl FnMut(&[u8], &mut [u8]) -> ControlFlow<()>,
    ) -> Result<(), Error> {
        for group in 0..self.groups() {
            // SAFETY: `group` is in bounds of the allocated buffer.
            let full = unsafe { self.metadata(group) }.match_full();
            for slot in full {
                // SAFETY: `(group, slot)` is occupied and in bounds. The key and
                // value arrays of a group never overlap.
                let (key, value) = unsafe { self.entry_mut(group, slot) };
                if visitor(key, value).is_break() {
                    return Err(Error::Interrupted);
                }
            }
        }
        Ok(())
    }

    /// Removes every entry for which `predicate` returns `false`.
    pub fn filter(&mut self, mut predicate: impl FnMut(&[u8], &[u8]) -> bool) {
        for group in 0..self.groups() {
            // SAFETY: `group` is in bounds of the allocated buffer.
            let full = unsafe { self.metadata(group) }.match_full();
            for slot in full {
                // SAFETY: `(group, slot)` is occupied and in bounds.
                let keep = unsafe { predicate(self.key(group, slot), self.value(group, slot)) };
                if !keep {
                    // SAFETY: As above.
                    unsafe { self.erase(group, slot) };
                }
            }
        }
    }

    /// Reserves room for at least `additional` more entries.
    ///
    /// Growth doubles the capacity as many times as needed in a single
    /// rehash. If only tombstones are in the way and the live entries fit in
    /// half the load limit, the table is rehashed at its current capacity.
    ///
    /// Fails with [`Error::OutOfMemory`], leaving the table unchanged, if the
    /// capacity overflows or the allocator refuses the new buffer.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use layout_map::HashTable;
    /// use layout_map::MapLayout;
    ///
    /// let mut table = HashTable::new(MapLayout::new(8, 8))?;
    /// table.reserve(0)?;
    /// assert_eq!(table.capacity(), 0);
    ///
    /// table.reserve(700)?;
    /// assert_eq!(table.capacity(), 1024);
    /// # Ok::<(), layout_map::Error>(())
    /// ```
    pub fn reserve(&mut self, additional: usize) -> Result<(), Error> {
        let capacity = self.capacity();
        let limit = max_load(capacity);
        let needed = self
            .count
            .checked_add(additional)
            .ok_or(Error::OutOfMemory)?;

        if needed <= limit {
            if needed.saturating_add(self.tombstones) <= limit {
                return Ok(());
            }
            if needed <= limit / 2 {
                return self.resize(capacity);
            }
        }

        self.resize(capacity_for(needed, capacity)?)
    }

    #[cold]
    fn resize(&mut self, capacity: usize) -> Result<(), Error> {
        debug_assert!(capacity.is_power_of_two() && capacity >= GROUP_SIZE);
        debug_assert!(max_load(capacity) >= self.count);

        let groups = capacity / GROUP_SIZE;
        let new_layout = self.layout.buffer_layout(groups).inspect_err(|_| {
            log::debug!("hash table capacity {capacity} overflows the address space");
        })?;
        let new_buffer = match self.alloc.allocate_zeroed(new_layout) {
            Ok(buffer) => buffer.cast::<u8>(),
            Err(_) => {
                log::debug!(
                    "allocator refused {} bytes for {capacity} slots",
                    new_layout.size()
                );
                return Err(Error::OutOfMemory);
            }
        };

        let old_capacity = self.capacity();
        let old_groups = self.groups();
        let old_buffer = self.buffer.replace(new_buffer);
        let discarded = core::mem::take(&mut self.tombstones);
        self.capacity_log2 = capacity.trailing_zeros();

        log::trace!(
            "hash table resized from {old_capacity} to {capacity} slots ({} live, {discarded} tombstones discarded)",
            self.count
        );

        let Some(old_buffer) = old_buffer else {
            return Ok(());
        };

        let layout = self.layout;
        for group in 0..old_groups {
            // SAFETY: `old_buffer` still holds `old_groups` groups of `layout`,
            // and it is disjoint from the new buffer.
            let full = unsafe { metadata_ptr(old_buffer, &layout, group).as_ref() }.match_full();
            for slot in full {
                // SAFETY: As above; `(group, slot)` is occupied.
                let (key, value) = unsafe {
                    (
                        bytes(old_buffer, layout.key_start(group, slot), layout.key_size()),
                        bytes(old_buffer, layout.value_start(group, slot), layout.value_size()),
                    )
                };
                let hash = self.strategy.hash(key);
                self.fast_insert(hash, key, value);
            }
        }

        if let Ok(old_layout) = layout.buffer_layout(old_groups) {
            // SAFETY: `old_buffer` came from `self.alloc` with this layout and
            // nothing refers to it anymore.
            unsafe { self.alloc.deallocate(old_buffer, old_layout) };
        }

        Ok(())
    }

    /// Claims the first empty slot on the probe path of `hash` without
    /// looking for an existing copy of the key. Only used to redistribute
    /// entries that are already unique.
    fn fast_insert(&mut self, hash: u64, key: &[u8], value: &[u8]) {
        let mask = self.bucket_mask();
        let mut group = hash as usize & mask;
        for _ in 0..self.groups() {
            // SAFETY: `group` is masked into bounds of the allocated buffer.
            let empty = unsafe { self.metadata(group) }.match_empty().lowest_set_bit();
            if let Some(slot) = empty {
                // SAFETY: `(group, slot)` is empty and in bounds.
                unsafe { self.write_slot(group, slot, tag(hash), key, value) };
                return;
            }
            group = (group + 1) & mask;
        }
        debug_assert!(false, "rehash found no empty slot");
    }

    #[inline]
    fn probe(&self, hash: u64, key: &[u8]) -> Probe {
        if self.buffer.is_none() {
            return Probe::Exhausted;
        }

        let tag = tag(hash);
        let mask = self.bucket_mask();
        let mut group = hash as usize & mask;
        for _ in 0..self.groups() {
            // SAFETY: `group` is masked into bounds of the allocated buffer.
            let meta = unsafe { self.metadata(group) };
            for slot in meta.match_byte(tag) {
                // SAFETY: A slot carrying a tag is occupied.
                if self.strategy.equal(unsafe { self.key(group, slot) }, key) {
                    return Probe::Occupied(group, slot);
                }
            }
            if let Some(slot) = meta.match_empty().lowest_set_bit() {
                return Probe::Vacant(group, slot);
            }
            group = (group + 1) & mask;
        }

        Probe::Exhausted
    }

    #[cold]
    fn exhausted(&self) -> Error {
        debug_assert!(false, "insertion probe found no empty slot: {self:#?}");
        Error::OutOfMemory
    }
}

impl<S, A: Allocator> HashTable<S, A> {
    /// Removes every entry, keeping the allocated buffer.
    pub fn clear(&mut self) {
        for group in 0..self.groups() {
            // SAFETY: `group` is in bounds of the allocated buffer.
            unsafe { *self.metadata_mut(group) = Metadata::EMPTY };
        }
        self.count = 0;
        self.tombstones = 0;
    }

    /// Like [`Clone::clone`], but reports allocation failure instead of
    /// aborting.
    pub fn try_clone(&self) -> Result<Self, Error>
    where
        S: Clone,
        A: Clone,
    {
        let alloc = self.alloc.clone();
        let buffer = match self.buffer {
            None => None,
            Some(source) => {
                let layout = self.layout.buffer_layout(self.groups())?;
                let buffer = alloc
                    .allocate(layout)
                    .map_err(|_| Error::OutOfMemory)?
                    .cast::<u8>();
                // SAFETY: Both buffers are `layout.size()` bytes long and distinct.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        source.as_ptr(),
                        buffer.as_ptr(),
                        layout.size(),
                    );
                }
                Some(buffer)
            }
        };

        Ok(Self {
            buffer,
            capacity_log2: self.capacity_log2,
            count: self.count,
            tombstones: self.tombstones,
            map_layout: self.map_layout,
            layout: self.layout,
            strategy: self.strategy.clone(),
            alloc,
        })
    }

    /// Returns an iterator over the entries of the table in slot order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use layout_map::HashTable;
    /// use layout_map::MapLayout;
    ///
    /// let mut table = HashTable::new(MapLayout::new(1, 1))?;
    /// for key in 0..10u8 {
    ///     table.insert(&[key], &[key * 2])?;
    /// }
    ///
    /// let mut sum = 0;
    /// for (_, value) in table.iter() {
    ///     sum += value[0] as u32;
    /// }
    /// assert_eq!(sum, 90);
    /// # Ok::<(), layout_map::Error>(())
    /// ```
    pub fn iter(&self) -> RawIter<'_> {
        RawIter {
            buffer: self.buffer,
            layout: self.layout,
            groups: self.groups(),
            next_group: 0,
            group: 0,
            current: BitMask(0).into_iter(),
            remaining: self.count,
            _marker: PhantomData,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Number of live entries. Same as [`HashTable::len`].
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns `true` if the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Total number of slots: zero before the first insertion, otherwise a
    /// power of two and a multiple of [`GROUP_SIZE`].
    pub fn capacity(&self) -> usize {
        match self.buffer {
            Some(_) => 1 << self.capacity_log2,
            None => 0,
        }
    }

    /// The geometry the table was created with.
    pub fn layout(&self) -> &MapLayout {
        &self.map_layout
    }

    /// Offsets of keys and values inside each group.
    pub fn group_layout(&self) -> &GroupLayout {
        &self.layout
    }

    /// The key strategy in use.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// The allocator backing the table.
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    #[inline(always)]
    fn groups(&self) -> usize {
        match self.buffer {
            Some(_) => self.groups_for(self.capacity_log2),
            None => 0,
        }
    }

    #[inline(always)]
    fn groups_for(&self, capacity_log2: u32) -> usize {
        (1usize << capacity_log2) / GROUP_SIZE
    }

    #[inline(always)]
    fn bucket_mask(&self) -> usize {
        self.groups().wrapping_sub(1)
    }

    #[inline(always)]
    fn check_entry(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        if key.len() != self.layout.key_size() || value.len() != self.layout.value_size() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// # Safety
    ///
    /// The buffer must be allocated and `group` less than the group count.
    #[inline(always)]
    unsafe fn buffer_ptr(&self) -> NonNull<u8> {
        debug_assert!(self.buffer.is_some());
        // SAFETY: The caller guarantees the buffer exists.
        unsafe { self.buffer.unwrap_unchecked() }
    }

    /// # Safety
    ///
    /// The buffer must be allocated and `group` less than the group count.
    #[inline(always)]
    unsafe fn metadata(&self, group: usize) -> &Metadata {
        debug_assert!(group < self.groups());
        // SAFETY: The caller guarantees `group` is in bounds.
        unsafe { metadata_ptr(self.buffer_ptr(), &self.layout, group).as_ref() }
    }

    /// # Safety
    ///
    /// The buffer must be allocated and `group` less than the group count.
    #[inline(always)]
    unsafe fn metadata_mut(&mut self, group: usize) -> &mut Metadata {
        debug_assert!(group < self.groups());
        // SAFETY: The caller guarantees `group` is in bounds, and `&mut self`
        // makes the access exclusive.
        unsafe { metadata_ptr(self.buffer_ptr(), &self.layout, group).as_mut() }
    }

    /// # Safety
    ///
    /// `(group, slot)` must be in bounds of the allocated buffer.
    #[inline(always)]
    unsafe fn key(&self, group: usize, slot: usize) -> &[u8] {
        // SAFETY: The caller guarantees the slot is in bounds.
        unsafe {
            bytes(
                self.buffer_ptr(),
                self.layout.key_start(group, slot),
                self.layout.key_size(),
            )
        }
    }

    /// # Safety
    ///
    /// `(group, slot)` must be in bounds of the allocated buffer.
    #[inline(always)]
    unsafe fn value(&self, group: usize, slot: usize) -> &[u8] {
        // SAFETY: The caller guarantees the slot is in bounds.
        unsafe {
            bytes(
                self.buffer_ptr(),
                self.layout.value_start(group, slot),
                self.layout.value_size(),
            )
        }
    }

    /// # Safety
    ///
    /// `(group, slot)` must be in bounds of the allocated buffer.
    #[inline(always)]
    unsafe fn value_mut(&mut self, group: usize, slot: usize) -> &mut [u8] {
        // SAFETY: The caller guarantees the slot is in bounds, and `&mut self`
        // makes the access exclusive.
        unsafe {
            bytes_mut(
                self.buffer_ptr(),
                self.layout.value_start(group, slot),
                self.layout.value_size(),
            )
        }
    }

    /// # Safety
    ///
    /// `(group, slot)` must be in bounds of the allocated buffer.
    #[inline(always)]
    unsafe fn entry_mut(&mut self, group: usize, slot: usize) -> (&[u8], &mut [u8]) {
        // SAFETY: The caller guarantees the slot is in bounds. Keys and values
        // live in disjoint arrays of the group.
        unsafe {
            let buffer = self.buffer_ptr();
            (
                bytes(
                    buffer,
                    self.layout.key_start(group, slot),
                    self.layout.key_size(),
                ),
                bytes_mut(
                    buffer,
                    self.layout.value_start(group, slot),
                    self.layout.value_size(),
                ),
            )
        }
    }

    /// # Safety
    ///
    /// `(group, slot)` must be an empty slot in bounds of the allocated
    /// buffer, and `key`/`value` must match the layout's sizes.
    #[inline(always)]
    unsafe fn write_slot(&mut self, group: usize, slot: usize, tag: u8, key: &[u8], value: &[u8]) {
        debug_assert!(tag != EMPTY && tag != TOMBSTONE);
        // SAFETY: The caller guarantees the slot is in bounds.
        unsafe {
            let buffer = self.buffer_ptr();
            bytes_mut(
                buffer,
                self.layout.key_start(group, slot),
                self.layout.key_size(),
            )
            .copy_from_slice(key);
            bytes_mut(
                buffer,
                self.layout.value_start(group, slot),
                self.layout.value_size(),
            )
            .copy_from_slice(value);
            self.metadata_mut(group).bytes[slot] = tag;
        }
    }

    /// # Safety
    ///
    /// `(group, slot)` must be an occupied slot in bounds of the allocated
    /// buffer.
    #[inline(always)]
    unsafe fn erase(&mut self, group: usize, slot: usize) {
        // SAFETY: The caller guarantees the slot is in bounds.
        unsafe {
            debug_assert!(self.metadata(group).bytes[slot] > TOMBSTONE);
            self.metadata_mut(group).bytes[slot] = TOMBSTONE;
        }
        self.count -= 1;
        self.tombstones += 1;
    }
}

#[cfg(any(test, feature = "stats"))]
impl<S: KeyStrategy, A: Allocator> HashTable<S, A> {
    /// Computes a histogram of probe lengths for the current table state.
    ///
    /// Requires the `stats` feature.
    ///
    /// The probe length of an entry is the number of groups between its home
    /// group and the group holding it, so bin 0 counts entries stored in
    /// their home group. The returned vector is as long as the largest probe
    /// length plus one, and empty for an empty table.
    pub fn probe_histogram(&self) -> alloc::vec::Vec<usize> {
        let mut hist = alloc::vec::Vec::new();
        let mask = self.bucket_mask();

        for group in 0..self.groups() {
            // SAFETY: `group` is in bounds of the allocated buffer.
            let full = unsafe { self.metadata(group) }.match_full();
            for slot in full {
                // SAFETY: `(group, slot)` is occupied and in bounds.
                let hash = self.strategy.hash(unsafe { self.key(group, slot) });
                let distance = group.wrapping_sub(hash as usize) & mask;
                if hist.len() <= distance {
                    hist.resize(distance + 1, 0);
                }
                hist[distance] += 1;
            }
        }

        hist
    }

    /// Returns detailed performance and utilization statistics for debugging.
    ///
    /// Requires the `stats` feature.
    pub fn debug_stats(&self) -> DebugStats {
        let capacity = self.capacity();
        let total_bytes = self
            .layout
            .buffer_layout(self.groups())
            .map_or(0, |layout| layout.size());
        let live_bytes = self.count * (self.layout.key_size() + self.layout.value_size());

        DebugStats {
            populated: self.count,
            tombstones: self.tombstones,
            capacity,
            groups: self.groups(),
            max_load: max_load(capacity),
            load_factor: if capacity == 0 {
                0.0
            } else {
                self.count as f64 / capacity as f64
            },
            slot_utilization: if capacity == 0 {
                0.0
            } else {
                (self.count + self.tombstones) as f64 / capacity as f64
            },
            group_stride: self.layout.group_stride(),
            total_bytes,
            wasted_bytes: total_bytes - live_bytes,
        }
    }

    /// Pretty-prints the probe-length histogram horizontally using stdout.
    ///
    /// Requires the `stats` and `std` features. Each row is one probe length,
    /// measured in groups.
    #[cfg(feature = "std")]
    pub fn print_probe_histogram(&self) {
        let hist = self.probe_histogram();
        let max = *hist.iter().max().unwrap_or(&0);
        if max == 0 {
            println!("probe histogram: empty");
            return;
        }

        let max_bar = 60usize;
        let total_units = max_bar * 8;
        println!("probe histogram ({} entries):", self.count);

        let make_bar = |count: usize| -> alloc::string::String {
            if count == 0 {
                return alloc::string::String::new();
            }
            let units = ((count as u128 * total_units as u128).div_ceil(max as u128)) as usize;
            let full = units / 8;
            let rem = units % 8;
            let mut bar = "█".repeat(full);
            if rem > 0 {
                bar.push(['▏', '▎', '▍', '▌', '▋', '▊', '▉'][rem - 1]);
            }
            bar
        };

        for (distance, &count) in hist.iter().enumerate() {
            println!("{:>3} | {} ({})", distance, make_bar(count), count);
        }
    }
}

/// # Safety
///
/// `buffer` must hold more than `group` groups of `layout`.
#[inline(always)]
unsafe fn metadata_ptr(buffer: NonNull<u8>, layout: &GroupLayout, group: usize) -> NonNull<Metadata> {
    // SAFETY: The caller guarantees the group is in bounds. Group starts are
    // multiples of the group alignment, which is at least that of `Metadata`.
    unsafe { buffer.add(layout.group_start(group)).cast::<Metadata>() }
}

/// # Safety
///
/// `offset..offset + len` must lie inside the allocation behind `buffer`, and
/// no mutable reference to those bytes may be live for `'a`.
#[inline(always)]
unsafe fn bytes<'a>(buffer: NonNull<u8>, offset: usize, len: usize) -> &'a [u8] {
    // SAFETY: The caller guarantees the range is in bounds. The allocation is
    // zeroed when created, so every byte is initialized.
    unsafe { core::slice::from_raw_parts(buffer.add(offset).as_ptr(), len) }
}

/// # Safety
///
/// As for [`bytes`], and no other reference to those bytes may be live for
/// `'a`.
#[inline(always)]
unsafe fn bytes_mut<'a>(buffer: NonNull<u8>, offset: usize, len: usize) -> &'a mut [u8] {
    // SAFETY: As above, with exclusivity guaranteed by the caller.
    unsafe { core::slice::from_raw_parts_mut(buffer.add(offset).as_ptr(), len) }
}

/// An iterator over the entries of a [`HashTable`], as `(key, value)` byte
/// slices in slot order.
///
/// This struct is created by [`HashTable::iter`]. Besides the [`Iterator`]
/// interface it offers [`RawIter::read_next`], which copies values out into a
/// caller buffer.
///
/// # Examples
///
/// ```rust
/// use layout_map::Error;
/// use layout_map::HashTable;
/// use layout_map::MapLayout;
///
/// let mut table = HashTable::new(MapLayout::new(1, 2))?;
/// table.insert(b"a", b"xy")?;
///
/// let mut iter = table.iter();
/// let mut out = [0u8; 2];
/// iter.read_next(&mut out, 0)?;
/// assert_eq!(&out, b"xy");
/// assert_eq!(iter.read_next(&mut out, 0), Err(Error::NoMoreData));
/// # Ok::<(), Error>(())
/// ```
pub struct RawIter<'a> {
    buffer: Option<NonNull<u8>>,
    layout: GroupLayout,
    groups: usize,
    next_group: usize,
    group: usize,
    current: BitMaskIter,
    remaining: usize,
    _marker: PhantomData<&'a [u8]>,
}

// SAFETY: The iterator only reads bytes borrowed from the table for `'a`, like
// a `&'a [u8]`.
unsafe impl Send for RawIter<'_> {}

// SAFETY: As above.
unsafe impl Sync for RawIter<'_> {}

impl Clone for RawIter<'_> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer,
            layout: self.layout,
            groups: self.groups,
            next_group: self.next_group,
            group: self.group,
            current: self.current.clone(),
            remaining: self.remaining,
            _marker: PhantomData,
        }
    }
}

impl Debug for RawIter<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RawIter")
            .field("group", &self.group)
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

impl RawIter<'_> {
    /// Copies the value of the next entry into `out`, after skipping `skip`
    /// entries.
    ///
    /// Fails with [`Error::InvalidArgument`] if `out` is not `value_size`
    /// bytes long, and with [`Error::NoMoreData`] once the table is
    /// exhausted.
    pub fn read_next(&mut self, out: &mut [u8], skip: usize) -> Result<(), Error> {
        if out.len() != self.layout.value_size() {
            return Err(Error::InvalidArgument);
        }
        let (_, value) = self.nth(skip).ok_or(Error::NoMoreData)?;
        out.copy_from_slice(value);
        Ok(())
    }

    /// Moves to the next group with live entries. Returns `false` when there
    /// is none.
    #[inline]
    fn advance_group(&mut self) -> bool {
        let Some(buffer) = self.buffer else {
            return false;
        };
        while self.next_group < self.groups {
            self.group = self.next_group;
            self.next_group += 1;
            // SAFETY: `self.group` is in bounds of the borrowed buffer.
            let full = unsafe { metadata_ptr(buffer, &self.layout, self.group).as_ref() }.match_full();
            if full.any_bit_set() {
                self.current = full.into_iter();
                return true;
            }
        }
        false
    }
}

impl<'a> Iterator for RawIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        loop {
            if let Some(slot) = self.current.next() {
                self.remaining -= 1;
                let buffer = self.buffer?;
                // SAFETY: `(self.group, slot)` is occupied and in bounds, and the
                // table stays borrowed for `'a`.
                return Some(unsafe {
                    (
                        bytes(
                            buffer,
                            self.layout.key_start(self.group, slot),
                            self.layout.key_size(),
                        ),
                        bytes(
                            buffer,
                            self.layout.value_start(self.group, slot),
                            self.layout.value_size(),
                        ),
                    )
                });
            }

            if !self.advance_group() {
                self.remaining = 0;
                return None;
            }
        }
    }

    fn nth(&mut self, mut n: usize) -> Option<Self::Item> {
        if n >= self.remaining {
            self.remaining = 0;
            self.current = BitMask(0).into_iter();
            self.next_group = self.groups;
            return None;
        }

        loop {
            let in_group = self.current.len();
            if n < in_group {
                for _ in 0..n {
                    self.current.next();
                }
                self.remaining -= n;
                return self.next();
            }

            n -= in_group;
            self.remaining -= in_group;
            if !self.advance_group() {
                self.remaining = 0;
                return None;
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for RawIter<'_> {}
impl core::iter::FusedIterator for RawIter<'_> {}

#[cfg(test)]
mod tests {
    use alloc::collections::BTreeMap;
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::alloc::Layout;
    use core::cell::Cell;
    use core::hash::Hasher;

    use allocator_api2::alloc::AllocError;
    use rand::Rng;
    use rand::SeedableRng;
    use rand::TryRngCore;
    use rand::rngs::OsRng;
    use rand::rngs::SmallRng;
    use siphasher::sip::SipHasher;

    use super::*;
    use crate::strategy::FnStrategy;

    #[derive(Clone)]
    struct HashState {
        k0: u64,
        k1: u64,
    }

    impl HashState {
        fn default() -> Self {
            let mut rng = OsRng;
            Self {
                k0: rng.try_next_u64().unwrap(),
                k1: rng.try_next_u64().unwrap(),
            }
        }
    }

    impl KeyStrategy for HashState {
        fn hash(&self, key: &[u8]) -> u64 {
            let mut h = SipHasher::new_with_keys(self.k0, self.k1);
            h.write(key);
            h.finish()
        }
    }

    /// Allows a fixed number of allocations, then refuses every request.
    #[derive(Clone)]
    struct Budget {
        remaining: Rc<Cell<usize>>,
    }

    impl Budget {
        fn new(allocations: usize) -> Self {
            Self {
                remaining: Rc::new(Cell::new(allocations)),
            }
        }
    }

    unsafe impl Allocator for Budget {
        fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
            match self.remaining.get() {
                0 => Err(AllocError),
                n => {
                    self.remaining.set(n - 1);
                    Global.allocate(layout)
                }
            }
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            unsafe { Global.deallocate(ptr, layout) }
        }
    }

    type CollidingStrategy = FnStrategy<fn(&[u8]) -> u64, fn(&[u8], &[u8]) -> bool>;

    fn colliding() -> CollidingStrategy {
        fn zero(_: &[u8]) -> u64 {
            0
        }
        fn bytes_eq(a: &[u8], b: &[u8]) -> bool {
            a == b
        }
        FnStrategy::new(zero as fn(&[u8]) -> u64, bytes_eq as fn(&[u8], &[u8]) -> bool)
    }

    fn u64_table(state: &HashState) -> HashTable<HashState> {
        HashTable::with_strategy(MapLayout::of::<u64, u64>(), state.clone()).unwrap()
    }

    fn read_u64(bytes: &[u8]) -> u64 {
        u64::from_ne_bytes(bytes.try_into().unwrap())
    }

    #[test]
    fn int_to_double_scenario() {
        let mut table = HashTable::new(MapLayout::of::<i32, f64>()).unwrap();
        for (k, v) in [(1i32, 1.1f64), (2, 2.2), (3, 3.3), (4, 4.4), (5, 5.5)] {
            table.insert(&k.to_ne_bytes(), &v.to_ne_bytes()).unwrap();
        }
        assert_eq!(
            table.insert(&1i32.to_ne_bytes(), &0.0f64.to_ne_bytes()),
            Err(Error::AlreadyExists)
        );
        assert_eq!(table.len(), 5);

        let get = |table: &HashTable, k: i32| {
            table
                .get(&k.to_ne_bytes())
                .map(|v| f64::from_ne_bytes(v.try_into().unwrap()))
        };
        assert_eq!(get(&table, 3), Some(3.3));
        assert_eq!(table.remove(&3i32.to_ne_bytes()), Ok(()));
        assert_eq!(get(&table, 3), None, "{:#?}", table);
        assert_eq!(table.insert(&3i32.to_ne_bytes(), &9.9f64.to_ne_bytes()), Ok(()));
        assert_eq!(get(&table, 3), Some(9.9));
        assert_eq!(get(&table, 1), Some(1.1));
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn insert_and_find() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        for k in 0..32u64 {
            table.insert(&k.to_ne_bytes(), &(k * 2).to_ne_bytes()).unwrap();
            assert_eq!(
                table.get(&k.to_ne_bytes()).map(read_u64),
                Some(k * 2),
                "{:#?}",
                table
            );
        }
        assert_eq!(table.len(), 32);
        for k in 0..32u64 {
            assert_eq!(table.get(&k.to_ne_bytes()).map(read_u64), Some(k * 2), "{:#?}", table);
        }

        assert!(table.get(&999u64.to_ne_bytes()).is_none());
        assert!(!table.contains_key(&999u64.to_ne_bytes()));
    }

    #[test]
    fn set_overwrites_in_place() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        table.set(&42u64.to_ne_bytes(), &7u64.to_ne_bytes()).unwrap();
        table.set(&42u64.to_ne_bytes(), &11u64.to_ne_bytes()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&42u64.to_ne_bytes()).map(read_u64), Some(11));
    }

    #[test]
    fn get_mut_and_modify() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        for k in 0..5u64 {
            table.insert(&k.to_ne_bytes(), &1u64.to_ne_bytes()).unwrap();
        }
        for k in 0..5u64 {
            let value = table.get_mut(&k.to_ne_bytes()).unwrap();
            value.copy_from_slice(&(read_u64(value) + 9).to_ne_bytes());
        }
        for k in 0..5u64 {
            assert_eq!(table.get(&k.to_ne_bytes()).map(read_u64), Some(10));
        }
        assert!(table.get_mut(&5u64.to_ne_bytes()).is_none());
    }

    #[test]
    fn remove_items() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        for k in 0..8u64 {
            table.insert(&k.to_ne_bytes(), &k.to_ne_bytes()).unwrap();
        }
        for k in [0u64, 3, 7] {
            assert_eq!(table.remove(&k.to_ne_bytes()), Ok(()));
            assert_eq!(table.remove(&k.to_ne_bytes()), Err(Error::NotFound));
        }
        assert_eq!(table.len(), 5);
        assert_eq!(table.remove(&1000u64.to_ne_bytes()), Err(Error::NotFound));
        for k in [1u64, 2, 4, 5, 6] {
            assert_eq!(table.get(&k.to_ne_bytes()).map(read_u64), Some(k));
        }
    }

    #[test]
    fn tombstone_then_reinsert() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        table.insert(&9u64.to_ne_bytes(), &1u64.to_ne_bytes()).unwrap();
        table.remove(&9u64.to_ne_bytes()).unwrap();
        assert!(table.get(&9u64.to_ne_bytes()).is_none());
        assert_eq!(table.debug_stats().tombstones, 1);

        table.insert(&9u64.to_ne_bytes(), &2u64.to_ne_bytes()).unwrap();
        assert_eq!(table.get(&9u64.to_ne_bytes()).map(read_u64), Some(2));
        assert_eq!(table.len(), 1);
        // the slot was not reused
        assert_eq!(table.debug_stats().tombstones, 1);
    }

    #[test]
    fn empty_table_does_not_allocate() {
        let mut table = HashTable::new(MapLayout::new(4, 4)).unwrap();
        table.reserve(0).unwrap();
        assert_eq!(table.capacity(), 0);
        assert!(table.get(&[0; 4]).is_none());
        assert_eq!(table.remove(&[0; 4]), Err(Error::NotFound));
        assert_eq!(table.iter().count(), 0);
        table.clear();
        table.filter(|_, _| false);
        assert_eq!(table.each(|_, _| ControlFlow::Break(())), Ok(()));
        assert!(!alloc::format!("{table:?}").is_empty());
    }

    #[test]
    fn wrong_sizes_are_rejected() {
        let mut table = HashTable::new(MapLayout::new(4, 2)).unwrap();
        assert_eq!(table.insert(&[0; 3], &[0; 2]), Err(Error::InvalidArgument));
        assert_eq!(table.insert(&[0; 4], &[0; 3]), Err(Error::InvalidArgument));
        assert_eq!(table.set(&[0; 5], &[0; 2]), Err(Error::InvalidArgument));
        assert_eq!(table.remove(&[0; 2]), Err(Error::InvalidArgument));
        assert_eq!(table.capacity(), 0);

        table.insert(&[1; 4], &[2; 2]).unwrap();
        assert!(table.get(&[1; 3]).is_none());
        assert!(table.get_mut(&[1; 5]).is_none());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn load_factor_and_power_of_two_capacity() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        let mut rng = SmallRng::seed_from_u64(7);
        let mut expected = BTreeMap::new();
        for _ in 0..5000 {
            let key: u64 = rng.random_range(0..2000);
            if rng.random_bool(0.3) {
                let removed = table.remove(&key.to_ne_bytes());
                assert_eq!(removed.is_ok(), expected.remove(&key).is_some());
            } else {
                table.set(&key.to_ne_bytes(), &key.wrapping_mul(3).to_ne_bytes()).unwrap();
                expected.insert(key, key.wrapping_mul(3));

                let capacity = table.capacity();
                let stats = table.debug_stats();
                assert!(capacity.is_power_of_two() && capacity % GROUP_SIZE == 0);
                assert!(table.len() <= max_load(capacity), "{:#?}", table);
                assert!(stats.populated + stats.tombstones <= max_load(capacity));
            }
        }

        assert_eq!(table.len(), expected.len());
        for (key, value) in &expected {
            assert_eq!(table.get(&key.to_ne_bytes()).map(read_u64), Some(*value));
        }
    }

    #[test_log::test]
    #[cfg_attr(miri, ignore)]
    fn growth_preserves_entries() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        let mut growths = 0;
        let mut capacity = table.capacity();
        for k in 0..20_000u64 {
            table.insert(&k.to_ne_bytes(), &(!k).to_ne_bytes()).unwrap();
            if table.capacity() != capacity {
                assert_eq!(table.capacity(), (capacity * 2).max(GROUP_SIZE));
                capacity = table.capacity();
                growths += 1;
            }
        }

        assert!(growths >= 2);
        assert_eq!(table.len(), 20_000, "{:#?}", table);
        for k in 0..20_000u64 {
            assert_eq!(table.get(&k.to_ne_bytes()).map(read_u64), Some(!k));
        }
    }

    #[test]
    fn with_capacity_thresholds() {
        let state = HashState::default();
        let mut table = HashTable::with_capacity_in(
            MapLayout::of::<u64, u64>(),
            1000,
            state,
            Global,
        )
        .unwrap();
        assert_eq!(table.capacity(), 2048);
        for k in 0..700u64 {
            table.insert(&k.to_ne_bytes(), &k.to_ne_bytes()).unwrap();
            assert_eq!(table.capacity(), 2048);
        }

        let table = HashTable::with_capacity(MapLayout::of::<u64, u64>(), 700).unwrap();
        assert_eq!(table.capacity(), 1024);
        let table = HashTable::with_capacity(MapLayout::of::<u64, u64>(), 717).unwrap();
        assert_eq!(table.capacity(), 2048);
    }

    #[test]
    fn reserve_coalesces_doublings() {
        let budget = Budget::new(2);
        let mut table =
            HashTable::new_in(MapLayout::new(8, 8), DefaultStrategy::default(), budget.clone())
                .unwrap();
        table.insert(&[1; 8], &[1; 8]).unwrap();
        assert_eq!(table.capacity(), 16);

        table.reserve(10_000).unwrap();
        assert_eq!(table.capacity(), 16384);
        assert_eq!(budget.remaining.get(), 0);
        assert_eq!(table.get(&[1; 8]), Some(&[1u8; 8][..]));
    }

    #[test_log::test]
    fn failed_growth_leaves_table_intact() {
        let budget = Budget::new(1);
        let mut table =
            HashTable::new_in(MapLayout::of::<u32, u32>(), DefaultStrategy::default(), budget.clone())
                .unwrap();

        for k in 0..max_load(16) as u32 {
            table.insert(&k.to_ne_bytes(), &(k + 1).to_ne_bytes()).unwrap();
        }
        assert_eq!(table.capacity(), 16);

        let overflow = 100u32.to_ne_bytes();
        assert_eq!(table.insert(&overflow, &overflow), Err(Error::OutOfMemory));
        assert_eq!(table.set(&overflow, &overflow), Err(Error::OutOfMemory));
        assert_eq!(table.reserve(usize::MAX), Err(Error::OutOfMemory));
        assert_eq!(table.capacity(), 16);
        assert_eq!(table.len(), max_load(16));
        for k in 0..max_load(16) as u32 {
            assert_eq!(table.get(&k.to_ne_bytes()), Some(&(k + 1).to_ne_bytes()[..]));
        }

        budget.remaining.set(1);
        table.insert(&overflow, &overflow).unwrap();
        assert_eq!(table.capacity(), 32);
        assert_eq!(table.len(), max_load(16) + 1);
    }

    #[test]
    fn failed_first_allocation() {
        let mut table =
            HashTable::new_in(MapLayout::new(4, 4), DefaultStrategy::default(), Budget::new(0))
                .unwrap();
        assert_eq!(table.insert(&[0; 4], &[0; 4]), Err(Error::OutOfMemory));
        assert_eq!(table.capacity(), 0);
        assert!(table.is_empty());
        assert_eq!(
            HashTable::with_capacity_in(MapLayout::new(4, 4), 1, DefaultStrategy::default(), Budget::new(0))
                .unwrap_err(),
            Error::OutOfMemory
        );
    }

    #[test_log::test]
    fn tombstone_churn_rehashes_in_place() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        for k in 0..4u64 {
            table.insert(&k.to_ne_bytes(), &k.to_ne_bytes()).unwrap();
        }

        for k in 4..1004u64 {
            table.remove(&(k - 4).to_ne_bytes()).unwrap();
            table.insert(&k.to_ne_bytes(), &k.to_ne_bytes()).unwrap();
            let stats = table.debug_stats();
            assert_eq!(table.capacity(), 16, "{:#?}", table);
            assert!(stats.populated + stats.tombstones <= max_load(16));
        }

        assert_eq!(table.len(), 4);
        for k in 1000..1004u64 {
            assert_eq!(table.get(&k.to_ne_bytes()).map(read_u64), Some(k));
        }
    }

    #[test]
    fn churn_with_many_live_entries_grows() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        for k in 0..10u64 {
            table.insert(&k.to_ne_bytes(), &k.to_ne_bytes()).unwrap();
        }
        for k in 10..20u64 {
            table.remove(&(k - 10).to_ne_bytes()).unwrap();
            table.insert(&k.to_ne_bytes(), &k.to_ne_bytes()).unwrap();
        }
        assert_eq!(table.len(), 10);
        assert_eq!(table.capacity(), 32);
    }

    #[test]
    fn explicit_collision() {
        let mut table = HashTable::with_strategy(MapLayout::of::<u64, u64>(), colliding()).unwrap();
        for k in 0..65u64 {
            table.insert(&k.to_ne_bytes(), &k.to_ne_bytes()).unwrap();
        }

        assert_eq!(table.len(), 65);
        for k in 0..65u64 {
            assert_eq!(table.get(&k.to_ne_bytes()).map(read_u64), Some(k), "{:#?}", table);
        }
        assert!(table.get(&65u64.to_ne_bytes()).is_none());

        let hist = table.probe_histogram();
        assert_eq!(hist[..5], [16, 16, 16, 16, 1]);
    }

    #[test]
    fn lookups_stop_at_first_group_with_an_empty_slot() {
        let mut table = HashTable::with_strategy(MapLayout::of::<u64, u64>(), colliding()).unwrap();
        for k in 0..20u64 {
            table.insert(&k.to_ne_bytes(), &k.to_ne_bytes()).unwrap();
        }
        // group 0 is full, group 1 holds the rest; tombstones in group 0 do not
        // end the walk
        for k in 0..16u64 {
            table.remove(&k.to_ne_bytes()).unwrap();
        }
        for k in 16..20u64 {
            assert_eq!(table.get(&k.to_ne_bytes()).map(read_u64), Some(k), "{:#?}", table);
        }
    }

    #[test]
    fn custom_equality() {
        // keys compare on their first byte only
        let strategy = FnStrategy::new(|key: &[u8]| key[0] as u64, |a: &[u8], b: &[u8]| a[0] == b[0]);
        let mut table = HashTable::with_strategy(MapLayout::new(2, 1), strategy).unwrap();
        table.insert(&[1, 0], &[10]).unwrap();
        assert_eq!(table.insert(&[1, 9], &[11]), Err(Error::AlreadyExists));
        assert_eq!(table.get(&[1, 5]), Some(&[10u8][..]));
        table.remove(&[1, 7]).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn odd_geometry() {
        let state = HashState::default();
        let layout = MapLayout::with_align(3, 1, 5, 1);
        let mut table = HashTable::with_strategy(layout, state).unwrap();
        for k in 0..500u32 {
            let key = &k.to_le_bytes()[..3];
            let value = [k as u8, (k >> 8) as u8, 0xaa, 0xbb, k as u8];
            table.insert(key, &value).unwrap();
        }
        for k in 0..500u32 {
            let key = &k.to_le_bytes()[..3];
            assert_eq!(
                table.get(key),
                Some(&[k as u8, (k >> 8) as u8, 0xaa, 0xbb, k as u8][..])
            );
        }
        assert_eq!(table.layout(), &layout);
    }

    #[test]
    fn default_alignment_with_odd_sizes() {
        let mut table = HashTable::new(MapLayout::new(3, 5)).unwrap();
        table.insert(b"abc", b"hello").unwrap();
        table.insert(b"xyz", b"world").unwrap();
        assert_eq!(table.get(b"abc"), Some(&b"hello"[..]));
        assert_eq!(table.get(b"xyz"), Some(&b"world"[..]));

        let mut table = HashTable::new(MapLayout::new(2, 12)).unwrap();
        for k in 0..200u16 {
            let mut value = [0u8; 12];
            value[..2].copy_from_slice(&k.to_ne_bytes());
            value[10..].copy_from_slice(&k.to_ne_bytes());
            table.insert(&k.to_ne_bytes(), &value).unwrap();
        }
        for k in 0..200u16 {
            let value = table.get(&k.to_ne_bytes()).unwrap();
            assert_eq!(&value[..2], &k.to_ne_bytes());
            assert_eq!(&value[10..], &k.to_ne_bytes());
        }

        let table = HashTable::new(MapLayout::with_align(4, 8, 4, 4));
        assert!(table.is_ok());
    }

    #[test]
    fn zero_sized_values() {
        let mut table = HashTable::new(MapLayout::of::<u16, ()>()).unwrap();
        for k in 0..100u16 {
            table.insert(&k.to_ne_bytes(), &[]).unwrap();
        }
        assert_eq!(table.len(), 100);
        assert_eq!(table.get(&7u16.to_ne_bytes()), Some(&[][..]));
        assert!(table.get(&100u16.to_ne_bytes()).is_none());
        assert_eq!(table.iter().count(), 100);
    }

    #[test]
    fn each_visits_and_mutates() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        for k in 0..50u64 {
            table.insert(&k.to_ne_bytes(), &k.to_ne_bytes()).unwrap();
        }

        let mut seen = 0;
        table
            .each(|key, value| {
                assert_eq!(key, value);
                value.copy_from_slice(&(read_u64(value) + 100).to_ne_bytes());
                seen += 1;
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(seen, 50);
        for k in 0..50u64 {
            assert_eq!(table.get(&k.to_ne_bytes()).map(read_u64), Some(k + 100));
        }

        let mut visited = 0;
        let result = table.each(|_, _| {
            visited += 1;
            if visited == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(result, Err(Error::Interrupted));
        assert_eq!(visited, 3);
    }

    #[test]
    fn filter_removes_rejected_entries() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        for k in 0..100u64 {
            table.insert(&k.to_ne_bytes(), &k.to_ne_bytes()).unwrap();
        }
        table.filter(|key, _| read_u64(key) % 3 == 0);
        assert_eq!(table.len(), 34);
        for k in 0..100u64 {
            assert_eq!(table.contains_key(&k.to_ne_bytes()), k % 3 == 0);
        }
        assert_eq!(table.debug_stats().tombstones, 66);
    }

    #[test]
    fn clear_keeps_capacity() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        for k in 0..100u64 {
            table.insert(&k.to_ne_bytes(), &k.to_ne_bytes()).unwrap();
        }
        table.remove(&0u64.to_ne_bytes()).unwrap();
        let capacity = table.capacity();

        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.capacity(), capacity);
        assert_eq!(table.debug_stats().tombstones, 0);
        assert!(table.get(&5u64.to_ne_bytes()).is_none());
        assert_eq!(table.iter().next(), None);

        table.insert(&5u64.to_ne_bytes(), &6u64.to_ne_bytes()).unwrap();
        assert_eq!(table.get(&5u64.to_ne_bytes()).map(read_u64), Some(6));
    }

    #[test]
    fn iter_yields_every_entry_once() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        for k in 0..300u64 {
            table.insert(&k.to_ne_bytes(), &(k * 7).to_ne_bytes()).unwrap();
        }
        for k in (0..300u64).step_by(2) {
            table.remove(&k.to_ne_bytes()).unwrap();
        }

        let iter = table.iter();
        assert_eq!(iter.len(), 150);
        let mut keys: Vec<u64> = iter
            .map(|(key, value)| {
                assert_eq!(read_u64(value), read_u64(key) * 7);
                read_u64(key)
            })
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, (1..300u64).step_by(2).collect::<Vec<_>>());
    }

    #[test]
    fn nth_matches_repeated_next() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        for k in 0..200u64 {
            table.insert(&k.to_ne_bytes(), &k.to_ne_bytes()).unwrap();
        }
        let all: Vec<_> = table.iter().collect();

        for skip in [0usize, 1, 15, 16, 17, 63, 150, 199] {
            let mut iter = table.iter();
            assert_eq!(iter.nth(skip), Some(all[skip]));
            assert_eq!(iter.len(), 199 - skip);
            assert_eq!(iter.next(), all.get(skip + 1).copied());
        }

        let mut iter = table.iter();
        assert_eq!(iter.nth(200), None);
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn read_next_copies_values() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        for k in 0..10u64 {
            table.insert(&k.to_ne_bytes(), &(k + 1).to_ne_bytes()).unwrap();
        }

        let mut iter = table.iter();
        let mut small = [0u8; 4];
        assert_eq!(iter.read_next(&mut small, 0), Err(Error::InvalidArgument));

        let mut out = [0u8; 8];
        let mut total = 0;
        let mut reads = 0;
        while iter.read_next(&mut out, 1).is_ok() {
            total += u64::from_ne_bytes(out);
            reads += 1;
        }
        assert_eq!(reads, 5);
        assert!(total > 0);
        assert_eq!(iter.read_next(&mut out, 0), Err(Error::NoMoreData));
    }

    #[test]
    fn strategy_swaps_only_while_empty() {
        let mut table = HashTable::with_strategy(MapLayout::new(1, 1), colliding()).unwrap();
        assert_eq!(table.use_strategy(colliding()), Ok(()));
        table.insert(&[1], &[1]).unwrap();
        assert_eq!(table.use_strategy(colliding()), Err(Error::InvalidArgument));
        table.remove(&[1]).unwrap();
        assert_eq!(table.use_strategy(colliding()), Ok(()));
    }

    #[test]
    fn test_clone() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        for k in 0..40u64 {
            table.insert(&k.to_ne_bytes(), &k.to_ne_bytes()).unwrap();
        }
        table.remove(&3u64.to_ne_bytes()).unwrap();

        let mut cloned = table.clone();
        assert_eq!(cloned.len(), table.len());
        assert_eq!(cloned.capacity(), table.capacity());
        cloned.remove(&4u64.to_ne_bytes()).unwrap();
        assert!(table.contains_key(&4u64.to_ne_bytes()));
        for k in 5..40u64 {
            assert_eq!(cloned.get(&k.to_ne_bytes()).map(read_u64), Some(k));
        }

        let empty = HashTable::new(MapLayout::new(2, 2)).unwrap();
        assert_eq!(empty.try_clone().unwrap().capacity(), 0);
    }

    #[test]
    fn debug_stats_account_for_memory() {
        let mut table = HashTable::new(MapLayout::of::<u32, u32>()).unwrap();
        assert_eq!(table.debug_stats().total_bytes, 0);
        for k in 0..10u32 {
            table.insert(&k.to_ne_bytes(), &k.to_ne_bytes()).unwrap();
        }
        let stats = table.debug_stats();
        assert_eq!(stats.capacity, 16);
        assert_eq!(stats.groups, 1);
        assert_eq!(stats.total_bytes, 16 + 4 * 16 + 4 * 16);
        assert_eq!(stats.wasted_bytes, stats.total_bytes - 10 * 8);
        assert_eq!(table.probe_histogram().iter().sum::<usize>(), 10);
    }

    #[test]
    #[cfg(feature = "std")]
    fn histogram_output() {
        let state = HashState::default();
        let mut table = u64_table(&state);
        table.print_probe_histogram();
        for k in 0..1000u64 {
            table.insert(&k.to_ne_bytes(), &k.to_ne_bytes()).unwrap();
        }
        table.print_probe_histogram();
        table.debug_stats().print();
    }
}
