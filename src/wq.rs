//! Wait queue: subscribers sleeping on a key until it is woken up.
//!
//! A subscription is removed when it fires, when it expires or when it is
//! explicitly removed. Wakeups return subscribers in subscription order.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;

use crate::time::Timestamp;

/// Handle to a subscription. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitId(u64);

impl fmt::Display for WaitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wait#{}", self.0)
    }
}

struct Sleeper<K, S> {
    key: K,
    subscriber: S,
    deadline: Option<Timestamp>,
}

pub struct WaitQueue<K, S> {
    sleepers: HashMap<WaitId, Sleeper<K, S>>,
    queues: HashMap<K, VecDeque<WaitId>>,
    next_id: u64,
}

impl<K, S> WaitQueue<K, S>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            sleepers: HashMap::new(),
            queues: HashMap::new(),
            next_id: 0,
        }
    }

    /// Subscribes until `key` is woken up or `deadline` passes.
    pub fn sleep(&mut self, key: K, subscriber: S, deadline: Option<Timestamp>) -> WaitId {
        self.next_id += 1;
        let id = WaitId(self.next_id);
        self.queues.entry(key.clone()).or_default().push_back(id);
        self.sleepers.insert(
            id,
            Sleeper {
                key,
                subscriber,
                deadline,
            },
        );
        id
    }

    pub fn remove(&mut self, id: WaitId) -> Option<S> {
        let sleeper = self.sleepers.remove(&id)?;
        if let Some(queue) = self.queues.get_mut(&sleeper.key) {
            queue.retain(|w| *w != id);
            if queue.is_empty() {
                self.queues.remove(&sleeper.key);
            }
        }
        Some(sleeper.subscriber)
    }

    /// Wakes every subscriber of `key`, in subscription order.
    pub fn wakeup(&mut self, key: &K) -> Vec<(WaitId, S)> {
        let Some(queue) = self.queues.remove(key) else {
            return Vec::new();
        };
        queue
            .into_iter()
            .filter_map(|id| self.sleepers.remove(&id).map(|s| (id, s.subscriber)))
            .collect()
    }

    /// Removes and returns every subscription whose deadline is at or
    /// before `now`, oldest subscription first.
    pub fn expire(&mut self, now: Timestamp) -> Vec<(WaitId, K, S)> {
        let mut expired: Vec<WaitId> = self
            .sleepers
            .iter()
            .filter(|(_, s)| s.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        expired.sort();

        expired
            .into_iter()
            .filter_map(|id| {
                let key = self.sleepers.get(&id)?.key.clone();
                self.remove(id).map(|s| (id, key, s))
            })
            .collect()
    }

    pub fn is_sleeping(&self, id: WaitId) -> bool {
        self.sleepers.contains_key(&id)
    }

    pub fn waiting(&self, key: &K) -> usize {
        self.queues.get(key).map_or(0, VecDeque::len)
    }

    pub fn len(&self) -> usize {
        self.sleepers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sleepers.is_empty()
    }
}

impl<K, S> Default for WaitQueue<K, S>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
