//! Generic persistent key-value storage.
//!
//! The GUESS engine keeps its per-host records in an ordered key-value map
//! and treats the backing store as opaque. This module defines that
//! contract and provides two implementations.
//!
//! # Components
//!
//! - [`KvStore`] - The storage contract used by the engine
//! - [`MemoryStore`] - Volatile store, for tests and ephemeral nodes
//! - [`RocksStore`] - RocksDB database on disk
//!
//! # Examples
//!
//! ```no_run
//! use rgnut::storage::{KvStore, RocksStore};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut store = RocksStore::open("guess.db")?;
//!
//! store.put(b"host", b"record")?;
//! assert_eq!(store.get(b"host")?.as_deref(), Some(&b"record"[..]));
//!
//! store.delete(b"host")?;
//! store.compact()?;
//! # Ok(())
//! # }
//! ```

mod error;
mod memory;
mod rocks;

pub use error::StorageError;
pub use memory::MemoryStore;
pub use rocks::RocksStore;

use bytes::Bytes;

/// Ordered key-value map keyed by opaque byte strings.
pub trait KvStore: Send {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError>;

    /// Inserts or replaces the value under `key`.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Removes `key`, returning whether it was present.
    fn delete(&mut self, key: &[u8]) -> Result<bool, StorageError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every entry in key order.
    fn for_each(&self, visit: &mut dyn FnMut(&[u8], &[u8])) -> Result<(), StorageError>;

    /// Keeps only the entries for which `keep` returns true.
    ///
    /// Returns the amount of removed entries.
    fn retain(&mut self, keep: &mut dyn FnMut(&[u8], &[u8]) -> bool)
        -> Result<usize, StorageError>;

    /// Reclaims space used by deleted or replaced entries.
    fn compact(&mut self) -> Result<(), StorageError>;

    /// Flushes pending writes to stable storage.
    fn sync(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}
