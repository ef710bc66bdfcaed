use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::StorageError;
use super::KvStore;

/// Volatile [`KvStore`] backed by a `BTreeMap`.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: BTreeMap<Bytes, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.entries
            .insert(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.entries.remove(key).is_some())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn for_each(&self, visit: &mut dyn FnMut(&[u8], &[u8])) -> Result<(), StorageError> {
        for (k, v) in &self.entries {
            visit(k, v);
        }
        Ok(())
    }

    fn retain(
        &mut self,
        keep: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<usize, StorageError> {
        let before = self.entries.len();
        self.entries.retain(|k, v| keep(k, v));
        Ok(before - self.entries.len())
    }

    fn compact(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}
