use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use crate::time::Timestamp;

/// Set whose entries expire a fixed delay after their last insertion.
///
/// Expired entries are dropped lazily on lookup and by [`AgingSet::gc`].
#[derive(Debug, Clone)]
pub struct AgingSet<K> {
    entries: HashMap<K, Timestamp>,
    lifetime: Duration,
}

impl<K: Eq + Hash + Clone> AgingSet<K> {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            lifetime,
        }
    }

    /// Inserts or refreshes `key`.
    pub fn insert(&mut self, key: K, now: Timestamp) {
        self.entries.insert(key, now + self.lifetime);
    }

    pub fn contains(&mut self, key: &K, now: Timestamp) -> bool {
        match self.entries.get(key) {
            Some(expires) if *expires > now => true,
            Some(_) => {
                self.entries.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drops every expired entry.
    pub fn gc(&mut self, now: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expires| *expires > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
