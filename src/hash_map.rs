use core::fmt::Debug;
use core::marker::PhantomData;
use core::ops::ControlFlow;

use allocator_api2::alloc::Allocator;
use allocator_api2::alloc::Global;
use bytemuck::Pod;

use crate::Error;
use crate::hash_table::HashTable;
use crate::hash_table::RawIter;
use crate::layout::MapLayout;
use crate::strategy::DefaultStrategy;
use crate::strategy::KeyStrategy;

/// A typed hash map over the type-erased [`HashTable`].
///
/// `HashMap<K, V, S, A>` stores plain-old-data keys and values. Keys are
/// hashed and compared through their bytes by the [`KeyStrategy`] `S`, so
/// two keys are the same key exactly when the strategy says their bytes are.
/// The table layout is derived from `size_of` and `align_of` of `K` and `V`.
///
/// Every operation that may allocate is fallible and reports
/// [`Error::OutOfMemory`] instead of aborting.
///
/// # Examples
///
/// ```rust
/// use layout_map::Error;
/// use layout_map::HashMap;
///
/// let mut map: HashMap<i32, f64> = HashMap::new()?;
/// map.insert(1, 1.1)?;
/// map.insert(2, 2.2)?;
/// assert_eq!(map.insert(1, 9.9), Err(Error::AlreadyExists));
///
/// assert_eq!(map.get(&2), Some(&2.2));
/// assert_eq!(map.remove(&2), Ok(2.2));
/// assert_eq!(map.get(&2), None);
/// # Ok::<(), Error>(())
/// ```
pub struct HashMap<K, V, S = DefaultStrategy, A: Allocator = Global> {
    table: HashTable<S, A>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, S, A> Debug for HashMap<K, V, S, A>
where
    K: Pod + Debug,
    V: Pod + Debug,
    A: Allocator,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S: Clone, A: Allocator + Clone> Clone for HashMap<K, V, S, A> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K, V, S> HashMap<K, V, S, Global>
where
    K: Pod,
    V: Pod,
    S: KeyStrategy + Default,
{
    /// Creates an empty map. Nothing is allocated until the first insertion.
    ///
    /// Fails with [`Error::InvalidArgument`] if `K` is zero-sized.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use layout_map::Error;
    /// use layout_map::HashMap;
    ///
    /// let map: HashMap<u64, u32> = HashMap::new()?;
    /// assert!(map.is_empty());
    /// assert_eq!(map.capacity(), 0);
    ///
    /// assert_eq!(HashMap::<(), u32>::new().unwrap_err(), Error::InvalidArgument);
    /// # Ok::<(), Error>(())
    /// ```
    pub fn new() -> Result<Self, Error> {
        Self::with_strategy(S::default())
    }

    /// Creates a map that holds at least `capacity` entries without growing.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use layout_map::HashMap;
    ///
    /// let map: HashMap<u32, u32> = HashMap::with_capacity(1000)?;
    /// assert_eq!(map.capacity(), 2048);
    /// # Ok::<(), layout_map::Error>(())
    /// ```
    pub fn with_capacity(capacity: usize) -> Result<Self, Error> {
        Self::with_capacity_and_strategy(capacity, S::default())
    }

    /// Builds a map from parallel slices of keys and values.
    ///
    /// Fails with [`Error::InvalidArgument`] if the slices differ in length.
    /// When a key repeats, the last value wins.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use layout_map::HashMap;
    ///
    /// let map: HashMap<u8, u16> = HashMap::from_arrays(&[1, 2, 1], &[10, 20, 30])?;
    /// assert_eq!(map.len(), 2);
    /// assert_eq!(map.get(&1), Some(&30));
    /// assert!(HashMap::<u8, u16>::from_arrays(&[1], &[]).is_err());
    /// # Ok::<(), layout_map::Error>(())
    /// ```
    pub fn from_arrays(keys: &[K], values: &[V]) -> Result<Self, Error> {
        if keys.len() != values.len() {
            return Err(Error::InvalidArgument);
        }

        let mut map = Self::with_capacity(keys.len())?;
        for (key, value) in keys.iter().zip(values) {
            map.set(*key, *value)?;
        }
        Ok(map)
    }
}

impl<K, V, S> HashMap<K, V, S, Global>
where
    K: Pod,
    V: Pod,
    S: KeyStrategy,
{
    /// Creates an empty map using `strategy` for its keys.
    pub fn with_strategy(strategy: S) -> Result<Self, Error> {
        Self::new_in(strategy, Global)
    }

    /// Creates a map using `strategy` that holds at least `capacity` entries
    /// without growing.
    pub fn with_capacity_and_strategy(capacity: usize, strategy: S) -> Result<Self, Error> {
        Self::with_capacity_in(capacity, strategy, Global)
    }
}

impl<K, V, S, A> HashMap<K, V, S, A>
where
    K: Pod,
    V: Pod,
    S: KeyStrategy,
    A: Allocator,
{
    /// Creates an empty map with an explicit strategy and allocator.
    pub fn new_in(strategy: S, alloc: A) -> Result<Self, Error> {
        Ok(Self {
            table: HashTable::new_in(MapLayout::of::<K, V>(), strategy, alloc)?,
            _marker: PhantomData,
        })
    }

    /// Creates a map with an explicit strategy and allocator that holds at
    /// least `capacity` entries without growing.
    pub fn with_capacity_in(capacity: usize, strategy: S, alloc: A) -> Result<Self, Error> {
        Ok(Self {
            table: HashTable::with_capacity_in(MapLayout::of::<K, V>(), capacity, strategy, alloc)?,
            _marker: PhantomData,
        })
    }

    /// Replaces the key strategy. Fails with [`Error::InvalidArgument`] if the
    /// map holds entries.
    pub fn use_strategy(&mut self, strategy: S) -> Result<(), Error> {
        self.table.use_strategy(strategy)
    }

    /// Returns the value stored for `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.table
            .get(bytemuck::bytes_of(key))
            .map(bytemuck::from_bytes)
    }

    /// Returns a mutable reference to the value stored for `key`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use layout_map::HashMap;
    ///
    /// let mut map: HashMap<u32, u32> = HashMap::new()?;
    /// map.insert(1, 10)?;
    /// if let Some(value) = map.get_mut(&1) {
    ///     *value += 5;
    /// }
    /// assert_eq!(map.get(&1), Some(&15));
    /// # Ok::<(), layout_map::Error>(())
    /// ```
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.table
            .get_mut(bytemuck::bytes_of(key))
            .map(bytemuck::from_bytes_mut)
    }

    /// Returns `true` if the map contains `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.table.contains_key(bytemuck::bytes_of(key))
    }

    /// Stores `value` for `key`, replacing the value of an existing entry.
    pub fn set(&mut self, key: K, value: V) -> Result<(), Error> {
        self.table
            .set(bytemuck::bytes_of(&key), bytemuck::bytes_of(&value))
    }

    /// Stores `value` for `key`, which must not be present yet.
    ///
    /// Fails with [`Error::AlreadyExists`] if it is, leaving the stored value
    /// untouched.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), Error> {
        self.table
            .insert(bytemuck::bytes_of(&key), bytemuck::bytes_of(&value))
    }

    /// Removes `key` and returns its value, or fails with
    /// [`Error::NotFound`].
    pub fn remove(&mut self, key: &K) -> Result<V, Error> {
        self.table
            .remove_with(bytemuck::bytes_of(key), |value| *bytemuck::from_bytes::<V>(value))
    }

    /// Calls `visitor` with every entry. Values may be modified in place.
    ///
    /// Reports [`Error::Interrupted`] if the visitor breaks early.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use core::ops::ControlFlow;
    ///
    /// use layout_map::Error;
    /// use layout_map::HashMap;
    ///
    /// let mut map: HashMap<u32, u32> = HashMap::from_arrays(&[1, 2, 3], &[1, 2, 3])?;
    /// map.each(|_, value| {
    ///     *value *= 2;
    ///     ControlFlow::Continue(())
    /// })?;
    /// assert_eq!(map.values().sum::<u32>(), 12);
    ///
    /// let result = map.each(|key, _| {
    ///     if *key == 2 {
    ///         ControlFlow::Break(())
    ///     } else {
    ///         ControlFlow::Continue(())
    ///     }
    /// });
    /// assert_eq!(result, Err(Error::Interrupted));
    /// # Ok::<(), Error>(())
    /// ```
    pub fn each(
        &mut self,
        mut visitor: impl FnMut(&K, &mut V) -> ControlFlow<()>,
    ) -> Result<(), Error> {
        self.table.each(|key, value| {
            visitor(bytemuck::from_bytes(key), bytemuck::from_bytes_mut(value))
        })
    }

    /// Keeps only the entries for which `predicate` returns `true`.
    pub fn filter(&mut self, mut predicate: impl FnMut(&K, &V) -> bool) {
        self.table
            .filter(|key, value| predicate(bytemuck::from_bytes(key), bytemuck::from_bytes(value)));
    }

    /// Reserves room for at least `additional` more entries.
    pub fn reserve(&mut self, additional: usize) -> Result<(), Error> {
        self.table.reserve(additional)
    }
}

impl<K, V, S, A: Allocator> HashMap<K, V, S, A> {
    /// Number of entries in the map.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Removes every entry, keeping the allocated memory.
    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// The key strategy in use.
    pub fn strategy(&self) -> &S {
        self.table.strategy()
    }

    /// The allocator backing the map.
    pub fn allocator(&self) -> &A {
        self.table.allocator()
    }

    /// The underlying type-erased table.
    pub fn as_raw(&self) -> &HashTable<S, A> {
        &self.table
    }

    /// An iterator over the entries of the map in slot order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            inner: self.table.iter(),
            _marker: PhantomData,
        }
    }

    /// An iterator over the keys of the map.
    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys { inner: self.iter() }
    }

    /// An iterator over the values of the map.
    pub fn values(&self) -> Values<'_, K, V> {
        Values { inner: self.iter() }
    }
}

impl<'a, K: Pod, V: Pod, S, A: Allocator> IntoIterator for &'a HashMap<K, V, S, A> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// An iterator over the key-value pairs of a `HashMap`.
pub struct Iter<'a, K, V> {
    inner: RawIter<'a>,
    _marker: PhantomData<(&'a K, &'a V)>,
}

impl<K, V> Clone for Iter<'_, K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<'a, K: Pod, V: Pod> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(k, v)| (bytemuck::from_bytes(k), bytemuck::from_bytes(v)))
    }

    fn nth(&mut self, n: usize) -> Option<Self::Item> {
        self.inner
            .nth(n)
            .map(|(k, v)| (bytemuck::from_bytes(k), bytemuck::from_bytes(v)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<K: Pod, V: Pod> ExactSizeIterator for Iter<'_, K, V> {}
impl<K: Pod, V: Pod> core::iter::FusedIterator for Iter<'_, K, V> {}

/// An iterator over the keys of a `HashMap`.
pub struct Keys<'a, K, V> {
    inner: Iter<'a, K, V>,
}

impl<'a, K: Pod, V: Pod> Iterator for Keys<'a, K, V> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, _)| k)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<K: Pod, V: Pod> ExactSizeIterator for Keys<'_, K, V> {}

/// An iterator over the values of a `HashMap`.
pub struct Values<'a, K, V> {
    inner: Iter<'a, K, V>,
}

impl<'a, K: Pod, V: Pod> Iterator for Values<'a, K, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, v)| v)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<K: Pod, V: Pod> ExactSizeIterator for Values<'_, K, V> {}
