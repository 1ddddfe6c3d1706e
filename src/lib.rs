#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod error;

pub mod group;

/// A typed hash map over plain-old-data keys and values.
///
/// This module provides a `HashMap` that wraps the type-erased `HashTable`,
/// deriving its layout from the key and value types and converting between
/// values and bytes with `bytemuck`.
pub mod hash_map;

/// The type-erased hash table engine.
///
/// This module provides `HashTable`, which stores fixed-size byte keys and
/// values in groups of 16 slots, and `RawIter`, which walks its entries.
pub mod hash_table;

pub mod layout;

pub mod strategy;

pub use allocator_api2;
pub use error::Error;
pub use hash_map::HashMap;
pub use hash_table::HashTable;
pub use layout::MapLayout;
pub use strategy::DefaultStrategy;
pub use strategy::KeyStrategy;
