//! Key hashing and equality strategies.
//!
//! A table never interprets its keys: it hands their raw bytes to a
//! [`KeyStrategy`], which produces the hash that selects the home group and
//! tag, and decides whether two stored keys are equal.

use core::hash::BuildHasher;
use core::hash::Hasher;

/// Hashes and compares keys given as raw bytes.
///
/// Keys that compare equal must hash to the same value.
pub trait KeyStrategy {
    /// Hashes the bytes of one key.
    fn hash(&self, key: &[u8]) -> u64;

    /// Compares two keys of the same length. Defaults to byte equality.
    #[inline]
    fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        a == b
    }
}

impl<S: KeyStrategy + ?Sized> KeyStrategy for &S {
    #[inline]
    fn hash(&self, key: &[u8]) -> u64 {
        (**self).hash(key)
    }

    #[inline]
    fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        (**self).equal(a, b)
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "foldhash")] {
        /// The strategy tables use unless told otherwise: foldhash with a
        /// fixed seed and byte equality.
        pub type DefaultStrategy = Hashed<foldhash::fast::FixedState>;
    } else {
        /// The strategy tables use unless told otherwise: [`Fnv1a`] with
        /// byte equality.
        pub type DefaultStrategy = Fnv1a;
    }
}

/// 64-bit Fowler–Noll–Vo (FNV-1a) hash with byte equality.
///
/// ```rust
/// use layout_map::strategy::Fnv1a;
/// use layout_map::strategy::KeyStrategy;
///
/// assert_eq!(Fnv1a.hash(b""), 0xcbf29ce484222325);
/// assert_eq!(Fnv1a.hash(b"a"), 0xaf63dc4c8601ec8c);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Fnv1a;

impl Fnv1a {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
}

impl KeyStrategy for Fnv1a {
    #[inline]
    fn hash(&self, key: &[u8]) -> u64 {
        key.iter().fold(Self::OFFSET, |hash, &byte| {
            (hash ^ byte as u64).wrapping_mul(Self::PRIME)
        })
    }
}

/// Dan Bernstein's `djb2` string hash (`hash * 33 + byte`), 32 bits wide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Djb2;

impl KeyStrategy for Djb2 {
    #[inline]
    fn hash(&self, key: &[u8]) -> u64 {
        key.iter().fold(5381u32, |hash, &byte| {
            (hash << 5).wrapping_add(hash).wrapping_add(byte as u32)
        }) as u64
    }
}

/// The `sdbm` hash, 32 bits wide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sdbm;

impl KeyStrategy for Sdbm {
    #[inline]
    fn hash(&self, key: &[u8]) -> u64 {
        key.iter().fold(0u32, |hash, &byte| {
            (byte as u32)
                .wrapping_add(hash << 6)
                .wrapping_add(hash << 16)
                .wrapping_sub(hash)
        }) as u64
    }
}

/// The PJW hash used by ELF symbol tables, 28 bits wide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Elf;

impl KeyStrategy for Elf {
    #[inline]
    fn hash(&self, key: &[u8]) -> u64 {
        key.iter().fold(0u32, |hash, &byte| {
            let hash = (hash << 4).wrapping_add(byte as u32);
            let high = hash & 0xf000_0000;
            (hash ^ (high >> 24)) & !high
        }) as u64
    }
}

/// Adapts any [`BuildHasher`] into a strategy with byte equality.
///
/// ```rust
/// use std::collections::hash_map::RandomState;
///
/// use layout_map::strategy::Hashed;
/// use layout_map::strategy::KeyStrategy;
///
/// let strategy = Hashed(RandomState::new());
/// assert_eq!(strategy.hash(b"key"), strategy.hash(b"key"));
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Hashed<B>(pub B);

impl<B: BuildHasher> KeyStrategy for Hashed<B> {
    #[inline]
    fn hash(&self, key: &[u8]) -> u64 {
        let mut hasher = self.0.build_hasher();
        hasher.write(key);
        hasher.finish()
    }
}

/// A strategy assembled from a hash closure and an equality closure.
///
/// Useful when only part of a key's bytes determine its identity.
///
/// ```rust
/// use layout_map::strategy::FnStrategy;
/// use layout_map::strategy::KeyStrategy;
///
/// // Only the first byte of the key counts.
/// let strategy = FnStrategy::new(|key: &[u8]| key[0] as u64, |a: &[u8], b: &[u8]| a[0] == b[0]);
/// assert!(strategy.equal(&[1, 2], &[1, 3]));
/// assert_eq!(strategy.hash(&[7, 0]), 7);
/// ```
#[derive(Clone, Copy)]
pub struct FnStrategy<H, E> {
    hash: H,
    eq: E,
}

impl<H, E> FnStrategy<H, E>
where
    H: Fn(&[u8]) -> u64,
    E: Fn(&[u8], &[u8]) -> bool,
{
    /// Builds a strategy from `hash` and `eq`.
    pub fn new(hash: H, eq: E) -> Self {
        Self { hash, eq }
    }
}

impl<H, E> core::fmt::Debug for FnStrategy<H, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnStrategy").finish_non_exhaustive()
    }
}

impl<H, E> KeyStrategy for FnStrategy<H, E>
where
    H: Fn(&[u8]) -> u64,
    E: Fn(&[u8], &[u8]) -> bool,
{
    #[inline]
    fn hash(&self, key: &[u8]) -> u64 {
        (self.hash)(key)
    }

    #[inline]
    fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        (self.eq)(a, b)
    }
}
