use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tracing::trace;

use super::env::SendTag;
use super::error::GuessError;
use super::message::Muid;
use super::query::QueryHandle;
use crate::callout::{Callout, TimerId};
use crate::time::Timestamp;

/// Handle to a pending RPC. Never reused, so a stale handle simply no longer
/// resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RpcId(u64);

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcKind {
    /// Query key request (ping).
    QueryKey,
    /// Query, acknowledged by a pong.
    Query,
    /// Request for more GUESS hosts (ping).
    MoreHosts,
}

/// A pending request expecting a reply from `host`.
#[derive(Debug, Clone)]
pub struct RpcRecord {
    pub id: RpcId,
    pub muid: Muid,
    pub host: SocketAddr,
    pub kind: RpcKind,
    /// Query on whose behalf the RPC was issued.
    pub owner: Option<QueryHandle>,
    /// Query hop counter when the RPC was issued.
    pub hops: u32,
    /// In-flight send buffer, until the transport reports its fate.
    pub send: Option<SendTag>,
    pub issued: Timestamp,
    timer: TimerId,
}

/// Correlates outgoing UDP requests with their replies.
///
/// Records are keyed by MUID and host address only: replies may come back
/// from another port than the one we sent to.
pub struct RpcRegistry {
    records: HashMap<RpcId, RpcRecord>,
    by_key: HashMap<(Muid, IpAddr), RpcId>,
    timers: Callout<RpcId>,
    lifetime: Duration,
    next_id: u64,
}

impl RpcRegistry {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            records: HashMap::new(),
            by_key: HashMap::new(),
            timers: Callout::new(),
            lifetime,
            next_id: 0,
        }
    }

    /// Registers a new RPC, failing if one is already pending for the same
    /// MUID and address.
    pub fn register(
        &mut self,
        host: SocketAddr,
        muid: Muid,
        kind: RpcKind,
        owner: Option<QueryHandle>,
        hops: u32,
        now: Timestamp,
    ) -> Result<RpcId, GuessError> {
        let key = (muid, host.ip());
        if self.by_key.contains_key(&key) {
            return Err(GuessError::RpcAlreadyPending {
                muid,
                addr: host.ip(),
            });
        }

        self.next_id += 1;
        let id = RpcId(self.next_id);
        let timer = self.timers.schedule(now + self.lifetime, id);

        self.by_key.insert(key, id);
        self.records.insert(
            id,
            RpcRecord {
                id,
                muid,
                host,
                kind,
                owner,
                hops,
                send: None,
                issued: now,
                timer,
            },
        );

        trace!("Registered {} {:?} to {} for {}", id, kind, host, muid);
        Ok(id)
    }

    fn unlink(&mut self, id: RpcId) -> Option<RpcRecord> {
        let record = self.records.remove(&id)?;
        self.by_key.remove(&(record.muid, record.host.ip()));
        self.timers.cancel(record.timer);
        Some(record)
    }

    /// Removes and returns the RPC a reply from `from` with `muid` answers.
    pub fn take_reply(&mut self, muid: &Muid, from: IpAddr) -> Option<RpcRecord> {
        let id = *self.by_key.get(&(*muid, from))?;
        self.unlink(id)
    }

    /// Drops a pending RPC without completing it.
    pub fn cancel(&mut self, id: RpcId) -> Option<RpcRecord> {
        self.unlink(id)
    }

    /// Removes and returns the next RPC whose lifetime expired by `now`.
    pub fn pop_expired(&mut self, now: Timestamp) -> Option<RpcRecord> {
        let (_, id) = self.timers.pop_expired(now)?;
        let record = self.records.remove(&id)?;
        self.by_key.remove(&(record.muid, record.host.ip()));
        Some(record)
    }

    pub fn attach_send(&mut self, id: RpcId, tag: SendTag) {
        if let Some(record) = self.records.get_mut(&id) {
            record.send = Some(tag);
        }
    }

    pub fn detach_send(&mut self, id: RpcId) {
        if let Some(record) = self.records.get_mut(&id) {
            record.send = None;
        }
    }

    /// Whether any RPC is pending with the address of `host`.
    pub fn has_pending_with(&self, host: &SocketAddr) -> bool {
        self.records.values().any(|r| r.host.ip() == host.ip())
    }

    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(port: u16) -> SocketAddr {
        SocketAddr::new("192.0.2.7".parse().unwrap(), port)
    }

    #[test]
    fn test_register_is_unique_per_address() {
        let mut rpcs = RpcRegistry::new(Duration::from_secs(15));
        let muid = Muid([1; 16]);
        let now = Timestamp::from_secs(100);

        rpcs.register(host(6346), muid, RpcKind::Query, None, 1, now)
            .unwrap();
        // Another port on the same address is the same key.
        assert!(matches!(
            rpcs.register(host(7000), muid, RpcKind::Query, None, 1, now),
            Err(GuessError::RpcAlreadyPending { .. })
        ));
        // Another MUID is fine.
        rpcs.register(host(6346), Muid([2; 16]), RpcKind::QueryKey, None, 1, now)
            .unwrap();
        assert_eq!(rpcs.len(), 2);
    }

    #[test]
    fn test_reply_from_other_port_matches() {
        let mut rpcs = RpcRegistry::new(Duration::from_secs(15));
        let muid = Muid([3; 16]);
        let now = Timestamp::from_secs(100);
        let id = rpcs
            .register(host(6346), muid, RpcKind::Query, None, 4, now)
            .unwrap();

        let record = rpcs.take_reply(&muid, host(9999).ip()).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.hops, 4);
        assert!(rpcs.is_empty());

        // The reply consumed the record: no timeout may follow.
        assert!(rpcs.pop_expired(now + Duration::from_secs(60)).is_none());
        assert!(rpcs.take_reply(&muid, host(6346).ip()).is_none());
    }

    #[test]
    fn test_timeout() {
        let mut rpcs = RpcRegistry::new(Duration::from_secs(15));
        let muid = Muid([4; 16]);
        let now = Timestamp::from_secs(100);
        rpcs.register(host(6346), muid, RpcKind::QueryKey, None, 0, now)
            .unwrap();

        assert!(rpcs.pop_expired(now + Duration::from_secs(14)).is_none());
        let record = rpcs.pop_expired(now + Duration::from_secs(15)).unwrap();
        assert_eq!(record.kind, RpcKind::QueryKey);
        assert!(rpcs.is_empty());
        assert!(rpcs.take_reply(&muid, host(6346).ip()).is_none());

        // Address is free again.
        rpcs.register(host(6346), muid, RpcKind::QueryKey, None, 0, now)
            .unwrap();
    }

    #[test]
    fn test_cancel() {
        let mut rpcs = RpcRegistry::new(Duration::from_secs(15));
        let muid = Muid([5; 16]);
        let now = Timestamp::from_secs(0);
        let id = rpcs
            .register(host(1), muid, RpcKind::Query, None, 0, now)
            .unwrap();

        assert!(rpcs.has_pending_with(&host(2)));
        assert_eq!(rpcs.cancel(id).map(|r| r.host), Some(host(1)));
        assert!(rpcs.cancel(id).is_none());
        assert!(!rpcs.has_pending_with(&host(2)));
        assert!(rpcs.pop_expired(now + Duration::from_secs(60)).is_none());
    }
}
