use std::path::{Path, PathBuf};

use bytes::Bytes;
use rocksdb::{DBRecoveryMode, IteratorMode, Options, WriteBatch, DB};
use tracing::{debug, warn};

use super::error::StorageError;
use super::KvStore;

/// Persistent [`KvStore`] backed by a RocksDB database.
///
/// The entry count is taken once on open and maintained on every write,
/// since RocksDB only offers an estimate.
pub struct RocksStore {
    db: DB,
    path: PathBuf,
    count: usize,
}

impl RocksStore {
    /// Opens the database directory at `path`, creating it when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_wal_recovery_mode(DBRecoveryMode::TolerateCorruptedTailRecords);
        opts.set_keep_log_file_num(4);

        let db = DB::open(&opts, &path)?;
        let mut count = 0;
        for entry in db.iterator(IteratorMode::Start) {
            entry?;
            count += 1;
        }

        debug!("Opened host store {} with {} entries", path.display(), count);
        Ok(Self { db, path, count })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn contains(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.db.get_pinned(key)?.is_some())
    }
}

impl KvStore for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError> {
        Ok(self.db.get(key)?.map(Bytes::from))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let fresh = !self.contains(key)?;
        self.db.put(key, value)?;
        if fresh {
            self.count += 1;
        }
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool, StorageError> {
        if !self.contains(key)? {
            return Ok(false);
        }
        self.db.delete(key)?;
        self.count -= 1;
        Ok(true)
    }

    fn len(&self) -> usize {
        self.count
    }

    fn for_each(&self, visit: &mut dyn FnMut(&[u8], &[u8])) -> Result<(), StorageError> {
        for entry in self.db.iterator(IteratorMode::Start) {
            let (k, v) = entry?;
            visit(&k, &v);
        }
        Ok(())
    }

    fn retain(
        &mut self,
        keep: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<usize, StorageError> {
        let mut batch = WriteBatch::default();
        let mut removed = 0;
        for entry in self.db.iterator(IteratorMode::Start) {
            let (k, v) = entry?;
            if !keep(&k, &v) {
                batch.delete(&k);
                removed += 1;
            }
        }

        if removed > 0 {
            self.db.write(batch)?;
            self.count -= removed;
        }
        Ok(removed)
    }

    fn compact(&mut self) -> Result<(), StorageError> {
        self.db.compact_range::<&[u8], &[u8]>(None, None);
        debug!(
            "Compacted {} ({} entries)",
            self.path.display(),
            self.count
        );
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.db.flush_wal(true)?;
        Ok(())
    }
}

impl Drop for RocksStore {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            warn!("Failed to flush {} on close: {}", self.path.display(), e);
        }
    }
}
