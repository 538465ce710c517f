//! The storage-container byte layer for the `seismio` benchmark engine.
//!
//! A store is a keyed byte container that physical benchmark output lives in:
//! a directory tree on a parallel filesystem, or memory for tests. The typed
//! array layer in `seismio` sits on top of these traits, so a run can be
//! retargeted at a different backing medium without touching the I/O driver.
//!
//! This crate includes two store implementations, [`MemoryStore`] and
//! [`FilesystemStore`].

mod store_key;
pub mod store;

use std::sync::Arc;

use thiserror::Error;

pub use store::{FilesystemStore, FilesystemStoreCreateError, MemoryStore};
pub use store_key::{StoreKey, StoreKeyError};

/// The type for bytes used in store get and set methods.
///
/// An alias for [`bytes::Bytes`].
pub type Bytes = bytes::Bytes;

/// An alias for bytes which may or may not be available.
///
/// Reading a key that was never written returns [`None`].
pub type MaybeBytes = Option<Bytes>;

/// A byte offset within a store value.
pub type ByteOffset = u64;

/// A contiguous byte range within a store value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ByteRange {
    /// Offset of the first byte.
    pub offset: ByteOffset,
    /// Number of bytes.
    pub length: u64,
}

impl ByteRange {
    /// Create a new byte range.
    #[must_use]
    pub const fn new(offset: ByteOffset, length: u64) -> Self {
        Self { offset, length }
    }

    /// The exclusive end of the byte range.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Readable store traits.
pub trait ReadableStoreTraits: Send + Sync {
    /// Retrieve the value (bytes) associated with a given [`StoreKey`].
    ///
    /// Returns [`None`] if the key is not found.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if there is an underlying storage error.
    fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError>;

    /// Retrieve partial bytes from a list of byte ranges for a store key.
    ///
    /// Returns [`None`] if the key is not found.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if a byte range is out of bounds or there is
    /// an underlying storage error.
    fn get_partial(
        &self,
        key: &StoreKey,
        byte_ranges: &[ByteRange],
    ) -> Result<Option<Vec<Bytes>>, StorageError>;

    /// Return the size in bytes of the value at `key`, if present.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if there is an underlying storage error.
    fn size_key(&self, key: &StoreKey) -> Result<Option<u64>, StorageError>;
}

/// Writable store traits.
pub trait WritableStoreTraits: Send + Sync {
    /// Store bytes at a [`StoreKey`], replacing any existing value.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on failure to store.
    fn set(&self, key: &StoreKey, value: Bytes) -> Result<(), StorageError>;

    /// Store bytes at the given offsets within the value at a [`StoreKey`].
    ///
    /// The value grows as needed and gaps are zero filled. Existing bytes
    /// outside the written ranges are preserved.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on failure to store.
    fn set_partial(
        &self,
        key: &StoreKey,
        offset_values: &[(ByteOffset, Bytes)],
    ) -> Result<(), StorageError>;

    /// Erase all keys starting with `prefix`.
    ///
    /// Succeeds if no such keys exist.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on failure to erase.
    fn erase_prefix(&self, prefix: &str) -> Result<(), StorageError>;
}

/// Listable store traits.
pub trait ListableStoreTraits: Send + Sync {
    /// List all keys starting with `prefix`, sorted.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if there is an underlying storage error.
    fn list_prefix(&self, prefix: &str) -> Result<Vec<StoreKey>, StorageError>;

    /// Return the total size in bytes of all values with keys starting with
    /// `prefix`.
    ///
    /// This is the storage actually consumed, so it reflects any filters
    /// applied by layers above.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if there is an underlying storage error.
    fn size_prefix(&self, prefix: &str) -> Result<u64, StorageError>;
}

/// A store supporting reads, writes, and listing.
pub trait StoreTraits:
    ReadableStoreTraits + WritableStoreTraits + ListableStoreTraits + core::fmt::Debug
{
}

impl<T: ReadableStoreTraits + WritableStoreTraits + ListableStoreTraits + core::fmt::Debug>
    StoreTraits for T
{
}

/// [`Arc`] wrapped store.
pub type SharedStore = Arc<dyn StoreTraits>;

/// A storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// An invalid store key.
    #[error(transparent)]
    InvalidStoreKey(#[from] StoreKeyError),
    /// A byte range beyond the end of a value.
    #[error("byte range [{}, {}) is out of bounds for value of {size} bytes at {key}", .range.offset, .range.end())]
    InvalidByteRange {
        /// The key of the value.
        key: StoreKey,
        /// The requested range.
        range: ByteRange,
        /// The actual value size.
        size: u64,
    },
    /// Any other error.
    #[error("{_0}")]
    Other(String),
}

impl From<String> for StorageError {
    fn from(err: String) -> Self {
        Self::Other(err)
    }
}

impl From<&str> for StorageError {
    fn from(err: &str) -> Self {
        Self::Other(err.to_string())
    }
}
