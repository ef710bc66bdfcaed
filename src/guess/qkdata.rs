//! Per-host capability records and their persistent store.
//!
//! Every GUESS host we exchange traffic with gets a [`HostCapabilityRecord`]
//! holding its query key, its liveness timestamps and what it is known to
//! be good at. Records are serialized into the backing [`KvStore`], keyed by
//! the packed host address.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::error::GuessError;
use crate::constants::{
    GUESS_ALIVE_DECIMATION, GUESS_FRESH_PERIOD, GUESS_MAX_TIMEOUTS, GUESS_QK_MAX_LEN,
    GUESS_STABLE_PROBA, GUESS_TIMEOUT_DELAY, GUESS_TIMEOUT_STALENESS,
};
use crate::storage::KvStore;
use crate::time::Timestamp;

/// Serialization version of [`HostCapabilityRecord`].
pub const RECORD_VERSION: u8 = 1;

/// version, first_seen, last_seen, last_update, flags, key length
const RECORD_V0_FIXED_LEN: usize = 1 + 4 * 3 + 4 + 1;
const RECORD_V1_TRAILER_LEN: usize = 4 + 1;

const HOST_KEY_V4: u8 = 4;
const HOST_KEY_V6: u8 = 6;

const FLAG_PINGED: u32 = 1 << 0;
const FLAG_PONGS_FOR_OTHERS: u32 = 1 << 1;
const FLAG_PACKED_HOSTS: u32 = 1 << 2;

/// What we learned about a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HostFlags {
    /// We introduced ourselves to this host.
    pub pinged: bool,
    /// The host returns pongs advertising other hosts.
    pub pongs_for_others: bool,
    /// The host returns packed host lists.
    pub packed_hosts: bool,
}

impl HostFlags {
    pub fn from_bits(bits: u32) -> Self {
        Self {
            pinged: (bits & FLAG_PINGED) != 0,
            pongs_for_others: (bits & FLAG_PONGS_FOR_OTHERS) != 0,
            packed_hosts: (bits & FLAG_PACKED_HOSTS) != 0,
        }
    }

    pub fn to_bits(self) -> u32 {
        let mut bits = 0u32;
        if self.pinged {
            bits |= FLAG_PINGED;
        }
        if self.pongs_for_others {
            bits |= FLAG_PONGS_FOR_OTHERS;
        }
        if self.packed_hosts {
            bits |= FLAG_PACKED_HOSTS;
        }
        bits
    }

    /// Whether the host is a good source of other hosts.
    pub fn is_productive(self) -> bool {
        self.pongs_for_others || self.packed_hosts
    }
}

/// Cached capability and reputation of a GUESS host.
///
/// Timestamps are in seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostCapabilityRecord {
    pub first_seen: u32,
    pub last_seen: u32,
    /// When the query key was last updated.
    pub last_update: u32,
    pub last_timeout: u32,
    pub flags: HostFlags,
    /// Consecutive RPC timeouts.
    pub timeouts: u8,
    /// Query key, empty when none is known.
    pub query_key: Bytes,
}

impl HostCapabilityRecord {
    pub fn new(now: Timestamp) -> Self {
        let now = now.as_secs_u32();
        Self {
            first_seen: now,
            last_seen: now,
            ..Default::default()
        }
    }

    /// Returns the query key if one is cached and still fresh.
    pub fn valid_query_key(&self, now: Timestamp, lifetime: Duration) -> Option<&Bytes> {
        if self.query_key.is_empty() {
            return None;
        }
        let age = now.as_secs_u32().saturating_sub(self.last_update);
        (u64::from(age) < lifetime.as_secs()).then_some(&self.query_key)
    }

    /// Delay after the last timeout before the host may be contacted again.
    pub fn recontact_delay(&self) -> Duration {
        let shift = u32::from(self.timeouts.min(GUESS_MAX_TIMEOUTS));
        GUESS_TIMEOUT_DELAY * (1u32 << shift)
    }

    /// Whether enough time elapsed since the last timeout to contact the host.
    pub fn can_recontact(&self, now: Timestamp) -> bool {
        if self.timeouts == 0 {
            return true;
        }
        let elapsed = now.as_secs_u32().saturating_sub(self.last_timeout);
        u64::from(elapsed) >= self.recontact_delay().as_secs()
    }

    pub fn encode(&self) -> Bytes {
        let key = &self.query_key[..self.query_key.len().min(GUESS_QK_MAX_LEN)];

        let mut buf =
            BytesMut::with_capacity(RECORD_V0_FIXED_LEN + key.len() + RECORD_V1_TRAILER_LEN);
        buf.put_u8(RECORD_VERSION);
        buf.put_u32(self.first_seen);
        buf.put_u32(self.last_seen);
        buf.put_u32(self.last_update);
        buf.put_u32(self.flags.to_bits());
        buf.put_u8(key.len() as u8);
        buf.put_slice(key);
        buf.put_u32(self.last_timeout);
        buf.put_u8(self.timeouts);
        buf.freeze()
    }

    /// Decodes a record, accepting version 0 records which lack the timeout
    /// trailer.
    pub fn decode(data: &[u8]) -> Result<Self, GuessError> {
        if data.len() < RECORD_V0_FIXED_LEN {
            return Err(GuessError::InvalidRecord(format!(
                "record too short: {} bytes",
                data.len()
            )));
        }

        let mut buf = data;
        let version = buf.get_u8();
        let first_seen = buf.get_u32();
        let last_seen = buf.get_u32();
        let last_update = buf.get_u32();
        let flags = HostFlags::from_bits(buf.get_u32());
        let key_len = buf.get_u8() as usize;

        if buf.remaining() < key_len {
            return Err(GuessError::InvalidRecord(format!(
                "query key truncated: {} of {} bytes",
                buf.remaining(),
                key_len
            )));
        }
        let query_key = Bytes::copy_from_slice(&buf[..key_len]);
        buf.advance(key_len);

        let (last_timeout, timeouts) = if version >= 1 {
            if buf.remaining() < RECORD_V1_TRAILER_LEN {
                return Err(GuessError::InvalidRecord("timeout trailer truncated".into()));
            }
            (buf.get_u32(), buf.get_u8())
        } else {
            (0, 0)
        };

        Ok(Self {
            first_seen,
            last_seen,
            last_update,
            last_timeout,
            flags,
            timeouts,
            query_key,
        })
    }
}

/// Serializes a host address into a store key.
pub fn encode_host(host: &SocketAddr) -> BytesMut {
    let mut key = BytesMut::with_capacity(19);
    match host.ip() {
        IpAddr::V4(ip) => {
            key.put_u8(HOST_KEY_V4);
            key.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            key.put_u8(HOST_KEY_V6);
            key.put_slice(&ip.octets());
        }
    }
    key.put_u16(host.port());
    key
}

pub fn decode_host(mut key: &[u8]) -> Option<SocketAddr> {
    if key.is_empty() {
        return None;
    }
    let ip = match key.get_u8() {
        HOST_KEY_V4 if key.len() == 6 => IpAddr::V4(Ipv4Addr::from(key.get_u32())),
        HOST_KEY_V6 if key.len() == 18 => IpAddr::V6(Ipv6Addr::from(key.get_u128())),
        _ => return None,
    };
    Some(SocketAddr::new(ip, key.get_u16()))
}

/// Statistical model estimating whether a host is still alive.
pub trait LivenessModel: Send {
    /// Probability in `[0, 1]` that a host first seen at `first_seen` and last
    /// seen at `last_seen` is still alive at `now` (all in seconds).
    fn still_alive(&self, first_seen: u32, last_seen: u32, now: u32) -> f64;
}

/// Default model: the longer a host has been up, the longer it is expected
/// to stay up, so its survival odds are its observed uptime against the time
/// elapsed since we last heard from it.
#[derive(Debug, Default, Clone, Copy)]
pub struct UptimeModel;

impl LivenessModel for UptimeModel {
    fn still_alive(&self, first_seen: u32, last_seen: u32, now: u32) -> f64 {
        let uptime = f64::from(last_seen.saturating_sub(first_seen)) + 1.0;
        let silence = f64::from(now.saturating_sub(last_seen));
        uptime / (uptime + silence)
    }
}

/// Counters maintained by the store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QkStats {
    /// Hosts with a cached record.
    pub cached: usize,
    pub pruned: u64,
    pub io_errors: u64,
}

/// Persistent mapping from host to [`HostCapabilityRecord`].
///
/// Storage failures never propagate: they are logged, reads degrade to "no
/// record" and writes are dropped.
pub struct QueryKeyStore {
    store: Box<dyn KvStore>,
    model: Box<dyn LivenessModel>,
    stats: QkStats,
}

impl QueryKeyStore {
    pub fn new(store: Box<dyn KvStore>, model: Box<dyn LivenessModel>) -> Self {
        let cached = store.len();
        Self {
            store,
            model,
            stats: QkStats {
                cached,
                ..Default::default()
            },
        }
    }

    pub fn get(&mut self, host: &SocketAddr) -> Option<HostCapabilityRecord> {
        let key = encode_host(host);
        let data = match self.store.get(&key) {
            Ok(data) => data?,
            Err(e) => {
                warn!("Cannot read GUESS record for {}: {}", host, e);
                self.stats.io_errors += 1;
                return None;
            }
        };

        match HostCapabilityRecord::decode(&data) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Dropping corrupted GUESS record for {}: {}", host, e);
                self.delete(host);
                None
            }
        }
    }

    /// Inserts or replaces the record of `host`.
    pub fn put(&mut self, host: &SocketAddr, record: &HostCapabilityRecord) {
        if let Err(e) = self.store.put(&encode_host(host), &record.encode()) {
            warn!("Cannot write GUESS record for {}: {}", host, e);
            self.stats.io_errors += 1;
        }
        self.stats.cached = self.store.len();
    }

    pub fn delete(&mut self, host: &SocketAddr) -> bool {
        let removed = match self.store.delete(&encode_host(host)) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Cannot delete GUESS record for {}: {}", host, e);
                self.stats.io_errors += 1;
                false
            }
        };
        self.stats.cached = self.store.len();
        removed
    }

    pub fn count(&self) -> usize {
        self.store.len()
    }

    pub fn stats(&self) -> QkStats {
        self.stats
    }

    /// Visits every decodable record.
    pub fn for_each(&self, mut visit: impl FnMut(SocketAddr, &HostCapabilityRecord)) {
        let result = self.store.for_each(&mut |k, v| {
            if let (Some(host), Ok(record)) = (decode_host(k), HostCapabilityRecord::decode(v)) {
                visit(host, &record);
            }
        });
        if let Err(e) = result {
            warn!("Cannot iterate GUESS records: {}", e);
        }
    }

    /// Removes every record for which `remove` returns true. Undecodable
    /// entries are removed as well.
    pub fn for_each_mutating_remove(
        &mut self,
        mut remove: impl FnMut(SocketAddr, &HostCapabilityRecord) -> bool,
    ) -> usize {
        let result = self.store.retain(&mut |k, v| {
            match (decode_host(k), HostCapabilityRecord::decode(v)) {
                (Some(host), Ok(record)) => !remove(host, &record),
                _ => false,
            }
        });
        self.stats.cached = self.store.len();
        match result {
            Ok(n) => n,
            Err(e) => {
                warn!("Cannot sweep GUESS records: {}", e);
                self.stats.io_errors += 1;
                0
            }
        }
    }

    /// Records traffic from `host`, creating its record if needed.
    ///
    /// Any traffic clears the consecutive timeout count.
    pub fn traffic(&mut self, host: &SocketAddr, now: Timestamp) -> HostCapabilityRecord {
        let mut record = self
            .get(host)
            .unwrap_or_else(|| HostCapabilityRecord::new(now));
        record.last_seen = now.as_secs_u32();
        record.timeouts = 0;
        self.put(host, &record);
        record
    }

    /// Records an RPC timeout for a known host.
    pub fn timeout(&mut self, host: &SocketAddr, now: Timestamp) -> Option<HostCapabilityRecord> {
        let mut record = self.get(host)?;
        record.timeouts = record.timeouts.saturating_add(1);
        record.last_timeout = now.as_secs_u32();
        self.put(host, &record);
        Some(record)
    }

    /// Caches a new query key for `host`.
    ///
    /// Returns whether the key differs from the one previously cached.
    pub fn set_query_key(&mut self, host: &SocketAddr, key: &Bytes, now: Timestamp) -> bool {
        let mut record = self
            .get(host)
            .unwrap_or_else(|| HostCapabilityRecord::new(now));
        let key = key.slice(..key.len().min(GUESS_QK_MAX_LEN));
        let changed = record.query_key != key;
        record.query_key = key;
        record.last_update = now.as_secs_u32();
        self.put(host, &record);
        changed
    }

    /// Updates the flags of a known host.
    pub fn update_flags(&mut self, host: &SocketAddr, update: impl FnOnce(&mut HostFlags)) {
        if let Some(mut record) = self.get(host) {
            let before = record.flags;
            update(&mut record.flags);
            if record.flags != before {
                self.put(host, &record);
            }
        }
    }

    /// Probability that the host of `record` is still alive.
    ///
    /// Recent timeouts decay the model's estimate by
    /// [`GUESS_ALIVE_DECIMATION`] each.
    pub fn alive_probability(&self, record: &HostCapabilityRecord, now: Timestamp) -> f64 {
        let now = now.as_secs_u32();
        let p = self
            .model
            .still_alive(record.first_seen, record.last_seen, now)
            .clamp(0.0, 1.0);

        let since_timeout = u64::from(now.saturating_sub(record.last_timeout));
        if record.timeouts > 0 && since_timeout < GUESS_TIMEOUT_STALENESS.as_secs() {
            let n = record.timeouts.min(GUESS_MAX_TIMEOUTS);
            p * GUESS_ALIVE_DECIMATION.powi(i32::from(n))
        } else {
            p
        }
    }

    pub fn is_probably_dead(&self, record: &HostCapabilityRecord, now: Timestamp) -> bool {
        self.alive_probability(record, now) < GUESS_STABLE_PROBA
    }

    /// Prunes hosts that are hostile or probably dead, then compacts the
    /// store. Hosts seen recently are always kept.
    pub fn prune(&mut self, now: Timestamp, is_hostile: impl Fn(&SocketAddr) -> bool) -> usize {
        let fresh = GUESS_FRESH_PERIOD.as_secs();
        let now_secs = now.as_secs_u32();

        let mut doomed = HashSet::new();
        self.for_each(|host, record| {
            let remove = if is_hostile(&host) {
                true
            } else if u64::from(now_secs.saturating_sub(record.last_seen)) < fresh {
                false
            } else {
                self.is_probably_dead(record, now)
            };
            if remove {
                doomed.insert(host);
            }
        });

        let removed = self.for_each_mutating_remove(|host, _| doomed.contains(&host));
        self.stats.pruned += removed as u64;

        if let Err(e) = self.store.compact() {
            warn!("Cannot compact GUESS records: {}", e);
            self.stats.io_errors += 1;
        }

        if removed > 0 {
            info!("Pruned {} GUESS hosts, {} remaining", removed, self.count());
        } else {
            debug!("No GUESS hosts pruned, {} cached", self.count());
        }
        removed
    }

    /// Hosts seen within the fresh period, most recently seen first.
    pub fn recent_hosts(&self, now: Timestamp, limit: usize) -> Vec<SocketAddr> {
        let now = now.as_secs_u32();
        let mut hosts = Vec::new();
        self.for_each(|host, record| {
            if u64::from(now.saturating_sub(record.last_seen)) < GUESS_FRESH_PERIOD.as_secs() {
                hosts.push((record.last_seen, host));
            }
        });
        hosts.sort_by(|a, b| b.0.cmp(&a.0));
        hosts.truncate(limit);
        hosts.into_iter().map(|(_, h)| h).collect()
    }

    pub fn sync(&mut self) {
        if let Err(e) = self.store.sync() {
            warn!("Cannot sync GUESS records: {}", e);
            self.stats.io_errors += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    const NOW: u32 = 1_700_000_000;
    const HOUR: u32 = 3600;

    fn host() -> SocketAddr {
        "203.0.113.5:6346".parse().unwrap()
    }

    fn store() -> QueryKeyStore {
        QueryKeyStore::new(Box::new(MemoryStore::new()), Box::new(UptimeModel))
    }

    fn now() -> Timestamp {
        Timestamp::from_secs(u64::from(NOW))
    }

    #[test]
    fn test_record_roundtrip() {
        let record = HostCapabilityRecord {
            first_seen: NOW - 10 * HOUR,
            last_seen: NOW - 5,
            last_update: NOW - 60,
            last_timeout: NOW - 600,
            flags: HostFlags {
                pinged: true,
                pongs_for_others: false,
                packed_hosts: true,
            },
            timeouts: 3,
            query_key: Bytes::from_static(b"\x01\x02\x03\x04"),
        };

        let encoded = record.encode();
        assert_eq!(encoded[0], RECORD_VERSION);
        assert_eq!(encoded.len(), RECORD_V0_FIXED_LEN + 4 + RECORD_V1_TRAILER_LEN);
        assert_eq!(HostCapabilityRecord::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn test_record_empty_key_roundtrip() {
        let record = HostCapabilityRecord {
            timeouts: 255,
            ..HostCapabilityRecord::new(now())
        };
        let decoded = HostCapabilityRecord::decode(&record.encode()).unwrap();
        assert!(decoded.query_key.is_empty());
        assert_eq!(decoded, record);
        assert!(decoded.valid_query_key(now(), GUESS_FRESH_PERIOD).is_none());
    }

    #[test]
    fn test_record_version_0() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u32(100);
        buf.put_u32(200);
        buf.put_u32(150);
        buf.put_u32(FLAG_PONGS_FOR_OTHERS);
        buf.put_u8(2);
        buf.put_slice(b"qk");

        let record = HostCapabilityRecord::decode(&buf).unwrap();
        assert_eq!(record.first_seen, 100);
        assert_eq!(record.last_seen, 200);
        assert_eq!(record.last_update, 150);
        assert!(record.flags.pongs_for_others);
        assert_eq!(&record.query_key[..], b"qk");
        assert_eq!(record.last_timeout, 0);
        assert_eq!(record.timeouts, 0);
    }

    #[test]
    fn test_record_truncated() {
        assert!(HostCapabilityRecord::decode(&[1, 2, 3]).is_err());

        let mut encoded = HostCapabilityRecord::new(now()).encode().to_vec();
        encoded.truncate(encoded.len() - 2);
        assert!(HostCapabilityRecord::decode(&encoded).is_err());
    }

    #[test]
    fn test_host_key_roundtrip() {
        for addr in ["192.0.2.1:6346", "[2001:db8::7]:9000"] {
            let addr: SocketAddr = addr.parse().unwrap();
            assert_eq!(decode_host(&encode_host(&addr)), Some(addr));
        }
        assert_eq!(decode_host(&[4, 1, 2]), None);
    }

    #[test]
    fn test_recontact_backoff() {
        let mut record = HostCapabilityRecord::new(now());
        assert!(record.can_recontact(now()));

        record.timeouts = 2;
        record.last_timeout = NOW;
        assert_eq!(record.recontact_delay(), Duration::from_secs(20));
        assert!(!record.can_recontact(now() + Duration::from_secs(19)));
        assert!(record.can_recontact(now() + Duration::from_secs(20)));
    }

    #[test]
    fn test_liveness_decreases_with_timeouts() {
        let qk = store();
        let mut record = HostCapabilityRecord {
            first_seen: NOW - 5 * HOUR,
            last_seen: NOW - 2 * HOUR,
            last_timeout: NOW - 60,
            ..Default::default()
        };

        let mut previous = qk.alive_probability(&record, now());
        for timeouts in 1..=10 {
            record.timeouts = timeouts;
            let p = qk.alive_probability(&record, now());
            assert!(p <= previous, "{} timeouts: {} > {}", timeouts, p, previous);
            previous = p;
        }
    }

    #[test]
    fn test_liveness_resets_after_staleness() {
        let qk = store();
        let clean = HostCapabilityRecord {
            first_seen: NOW - 5 * HOUR,
            last_seen: NOW - 2 * HOUR,
            ..Default::default()
        };
        let timed_out = HostCapabilityRecord {
            timeouts: 4,
            last_timeout: NOW - HOUR,
            ..clean.clone()
        };
        let recent = HostCapabilityRecord {
            last_timeout: NOW - HOUR + 1,
            ..timed_out.clone()
        };

        let undecayed = qk.alive_probability(&clean, now());
        assert_eq!(qk.alive_probability(&timed_out, now()), undecayed);
        assert!(qk.alive_probability(&recent, now()) < undecayed);
    }

    #[test]
    fn test_traffic_and_timeouts() {
        let mut qk = store();
        assert!(qk.timeout(&host(), now()).is_none());

        qk.traffic(&host(), now());
        assert_eq!(qk.count(), 1);
        assert_eq!(qk.stats().cached, 1);

        qk.timeout(&host(), now());
        let record = qk.timeout(&host(), now()).unwrap();
        assert_eq!(record.timeouts, 2);
        assert_eq!(record.last_timeout, NOW);

        let record = qk.traffic(&host(), now() + Duration::from_secs(30));
        assert_eq!(record.timeouts, 0);
        assert_eq!(record.last_seen, NOW + 30);
        assert_eq!(record.first_seen, NOW);
    }

    #[test]
    fn test_set_query_key() {
        let mut qk = store();
        let key = Bytes::from_static(b"key-1");

        assert!(qk.set_query_key(&host(), &key, now()));
        assert!(!qk.set_query_key(&host(), &key, now()));
        assert!(qk.set_query_key(&host(), &Bytes::from_static(b"key-2"), now()));

        let record = qk.get(&host()).unwrap();
        assert_eq!(&record.query_key[..], b"key-2");
        assert!(record.valid_query_key(now(), GUESS_FRESH_PERIOD).is_some());
        assert!(record
            .valid_query_key(now() + GUESS_FRESH_PERIOD, GUESS_FRESH_PERIOD)
            .is_none());
    }

    #[test]
    fn test_prune() {
        let mut qk = store();
        let fresh: SocketAddr = "192.0.2.1:6346".parse().unwrap();
        let dying: SocketAddr = "192.0.2.2:6346".parse().unwrap();
        let stale_timeouts: SocketAddr = "192.0.2.3:6346".parse().unwrap();
        let hostile: SocketAddr = "192.0.2.4:6346".parse().unwrap();

        let old = HostCapabilityRecord {
            first_seen: NOW - 5 * HOUR,
            last_seen: NOW - 2 * HOUR,
            ..Default::default()
        };
        qk.put(
            &fresh,
            &HostCapabilityRecord {
                timeouts: 5,
                last_timeout: NOW,
                ..HostCapabilityRecord::new(now())
            },
        );
        qk.put(
            &dying,
            &HostCapabilityRecord {
                timeouts: 5,
                last_timeout: NOW - 600,
                ..old.clone()
            },
        );
        qk.put(
            &stale_timeouts,
            &HostCapabilityRecord {
                timeouts: 5,
                last_timeout: NOW - 2 * HOUR,
                ..old.clone()
            },
        );
        qk.put(&hostile, &HostCapabilityRecord::new(now()));

        let removed = qk.prune(now(), |h| *h == hostile);
        assert_eq!(removed, 2);
        assert!(qk.get(&fresh).is_some());
        assert!(qk.get(&dying).is_none());
        assert!(qk.get(&stale_timeouts).is_some());
        assert!(qk.get(&hostile).is_none());
        assert_eq!(qk.stats().pruned, 2);
        assert_eq!(qk.stats().cached, 2);
    }

    #[test]
    fn test_corrupt_record_dropped() {
        let mut backing = MemoryStore::new();
        backing.put(&encode_host(&host()), b"junk").unwrap();
        let mut qk = QueryKeyStore::new(Box::new(backing), Box::new(UptimeModel));

        assert!(qk.get(&host()).is_none());
        assert_eq!(qk.count(), 0);
    }

    #[test]
    fn test_recent_hosts() {
        let mut qk = store();
        for i in 1..=3u8 {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, i)), 6346);
            let mut record = HostCapabilityRecord::new(now());
            record.last_seen = NOW - u32::from(i) * 1000;
            qk.put(&addr, &record);
        }
        let mut old = HostCapabilityRecord::new(now());
        old.last_seen = NOW - 2 * HOUR;
        qk.put(&host(), &old);

        let hosts = qk.recent_hosts(now(), 10);
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[0], "192.0.2.1:6346".parse().unwrap());
        assert_eq!(qk.recent_hosts(now(), 1).len(), 1);
    }
}
