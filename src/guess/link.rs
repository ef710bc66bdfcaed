use std::net::SocketAddr;

use lru::LruCache;
use rand::Rng as _;
use tracing::trace;

/// Bounded set of known-reachable GUESS hosts, most recently active first.
pub struct LinkCache {
    hosts: LruCache<SocketAddr, ()>,
    capacity: usize,
}

impl LinkCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            hosts: LruCache::unbounded(),
            capacity,
        }
    }

    /// Adds `host` with a probability of `percent` out of 100, evicting the
    /// least recently active hosts beyond capacity.
    ///
    /// Returns whether the host was added.
    pub fn try_add(&mut self, host: SocketAddr, percent: u8) -> bool {
        if self.hosts.contains(&host) {
            return false;
        }
        if percent < 100 && rand::rng().random_range(0..100u8) >= percent {
            return false;
        }

        self.hosts.put(host, ());
        trace!("Added {} to link cache ({} hosts)", host, self.hosts.len());
        self.evict();
        self.hosts.contains(&host)
    }

    fn evict(&mut self) {
        while self.hosts.len() > self.capacity {
            if let Some((evicted, _)) = self.hosts.pop_lru() {
                trace!("Evicted {} from link cache", evicted);
            }
        }
    }

    /// Moves `host` to the head if present.
    pub fn touch(&mut self, host: &SocketAddr) -> bool {
        if self.hosts.contains(host) {
            self.hosts.promote(host);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, host: &SocketAddr) -> bool {
        self.hosts.pop(host).is_some()
    }

    pub fn contains(&self, host: &SocketAddr) -> bool {
        self.hosts.contains(host)
    }

    /// Hosts from most to least recently active.
    pub fn hosts(&self) -> Vec<SocketAddr> {
        self.hosts.iter().map(|(h, _)| *h).collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.hosts.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn host(i: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)), 6346)
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let mut cache = LinkCache::new(5);
        for i in 0..20 {
            cache.try_add(host(i), 100);
            assert!(cache.len() <= 5);
        }
        assert!(cache.is_full());
        // Most recent first, oldest evicted.
        assert_eq!(cache.hosts(), (15..20).rev().map(host).collect::<Vec<_>>());
    }

    #[test]
    fn test_duplicate_is_noop() {
        let mut cache = LinkCache::new(5);
        assert!(cache.try_add(host(1), 100));
        assert!(!cache.try_add(host(1), 100));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_probability_gate() {
        let mut cache = LinkCache::new(5);
        assert!(!cache.try_add(host(1), 0));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_touch_moves_to_head() {
        let mut cache = LinkCache::new(3);
        cache.try_add(host(1), 100);
        cache.try_add(host(2), 100);
        cache.try_add(host(3), 100);

        assert!(cache.touch(&host(1)));
        assert!(!cache.touch(&host(9)));
        assert_eq!(cache.hosts()[0], host(1));

        cache.try_add(host(4), 100);
        assert!(!cache.contains(&host(2)));
        assert!(cache.contains(&host(1)));
    }

    #[test]
    fn test_remove_frees_slot() {
        let mut cache = LinkCache::new(4);
        for i in 0..4 {
            cache.try_add(host(i), 100);
        }
        assert!(cache.remove(&host(0)));
        assert!(!cache.remove(&host(0)));
        assert!(!cache.is_full());

        cache.try_add(host(9), 100);
        assert!(cache.is_full());
        assert_eq!(cache.hosts(), vec![host(9), host(3), host(2), host(1)]);
    }
}
