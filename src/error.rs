//! Error types for the `layout-map` crate

/// Errors reported by hash table and hash map operations.
///
/// Every failure is recoverable: the table is left in its last valid state
/// and nothing is retried internally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A parameter was malformed.
    ///
    /// Raised for zero-sized or misaligned key geometry, for key or value
    /// buffers whose length does not match the table layout, and for
    /// replacing the key strategy of a table that already holds entries.
    #[error("invalid argument")]
    InvalidArgument,

    /// The allocator refused a request, or the requested capacity does not
    /// fit in the address space.
    #[error("out of memory")]
    OutOfMemory,

    /// A distinct insertion found the key already present.
    #[error("key already exists")]
    AlreadyExists,

    /// The key is not present in the table.
    #[error("key not found")]
    NotFound,

    /// A visitor asked for traversal to stop early.
    #[error("traversal interrupted")]
    Interrupted,

    /// An iterator has no more items.
    #[error("no more data")]
    NoMoreData,
}

impl Error {
    /// Returns the negated POSIX error code conventionally associated with
    /// this error kind.
    ///
    /// ```rust
    /// use layout_map::Error;
    ///
    /// assert_eq!(Error::OutOfMemory.code(), -12);
    /// assert_eq!(Error::AlreadyExists.code(), -17);
    /// ```
    pub const fn code(self) -> i32 {
        match self {
            Error::NotFound => -2,
            Error::Interrupted => -4,
            Error::OutOfMemory => -12,
            Error::AlreadyExists => -17,
            Error::InvalidArgument => -22,
            Error::NoMoreData => -61,
        }
    }
}
