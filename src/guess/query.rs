use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::message::Muid;
use crate::callout::TimerId;
use crate::time::Timestamp;
use crate::wq::WaitId;

/// Handle to a running query. Never reused: once the query ended, the
/// handle no longer resolves to anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryHandle(pub(crate) u64);

impl fmt::Display for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query#{}", self.0)
    }
}

/// How many RPCs a query may keep in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// At most alpha pending RPCs.
    Bounded,
    /// Alpha new hosts per round, whatever is pending.
    Loose,
}

/// Why a query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Cancelled,
    Disabled,
    /// Enough hosts acknowledged the query.
    HostBudget,
    /// Enough results were kept.
    EnoughResults,
    /// No hosts left and termination on starvation was requested.
    Starving,
    Shutdown,
}

/// Counters of a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Hosts to which the query was actually sent.
    pub queried: u32,
    pub acks: u32,
    pub kept: u32,
    pub received: u32,
    /// Bytes sent requesting query keys.
    pub qk_bytes: u64,
    /// Bytes sent querying.
    pub query_bytes: u64,
}

/// Handed to the completion callback when a query ends.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub handle: QueryHandle,
    pub muid: Muid,
    pub reason: EndReason,
    pub stats: QueryStats,
    pub hops: u32,
    pub elapsed: Duration,
}

pub type QueryCallback = Box<dyn FnOnce(QueryOutcome) + Send>;

/// Snapshot of a running query.
#[derive(Debug, Clone)]
pub struct QueryStatus {
    pub muid: Muid,
    pub mode: Concurrency,
    pub stats: QueryStats,
    pub hops: u32,
    pub pending: usize,
    pub pool: usize,
    pub contacted: usize,
    pub waiting_hosts: bool,
    pub waiting_bandwidth: bool,
    pub delayed: bool,
}

/// Fate of a host during selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Take,
    /// Not eligible yet, keep it.
    Skip,
    /// Never eligible for this query.
    Drop,
}

/// Candidate hosts, in order, without duplicates.
#[derive(Debug, Default)]
pub(crate) struct HostPool {
    order: VecDeque<SocketAddr>,
    members: HashSet<SocketAddr>,
}

impl HostPool {
    pub fn push_back(&mut self, host: SocketAddr) -> bool {
        if !self.members.insert(host) {
            return false;
        }
        self.order.push_back(host);
        true
    }

    pub fn push_front(&mut self, host: SocketAddr) -> bool {
        if !self.members.insert(host) {
            return false;
        }
        self.order.push_front(host);
        true
    }

    pub fn remove(&mut self, host: &SocketAddr) -> bool {
        if !self.members.remove(host) {
            return false;
        }
        if let Some(pos) = self.order.iter().position(|h| h == host) {
            self.order.remove(pos);
        }
        true
    }

    pub fn contains(&self, host: &SocketAddr) -> bool {
        self.members.contains(host)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Removes and returns the first host `judge` takes, also removing the
    /// hosts it drops along the way. Dropped hosts are appended to `dropped`.
    pub fn select(
        &mut self,
        mut judge: impl FnMut(&SocketAddr) -> Verdict,
        dropped: &mut Vec<SocketAddr>,
    ) -> Option<SocketAddr> {
        let mut taken = None;
        let first_drop = dropped.len();
        for host in &self.order {
            match judge(host) {
                Verdict::Take => {
                    taken = Some(*host);
                    break;
                }
                Verdict::Skip => {}
                Verdict::Drop => dropped.push(*host),
            }
        }

        if dropped.len() > first_drop {
            let doomed: HashSet<_> = dropped[first_drop..].iter().copied().collect();
            self.order.retain(|h| !doomed.contains(h));
            for host in &doomed {
                self.members.remove(host);
            }
        }
        if let Some(host) = taken {
            self.remove(&host);
        }
        taken
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct QueryFlags {
    /// Inside the sending loop of a round.
    pub sending: bool,
    /// The transport dropped a message synchronously during the round.
    pub udp_drop: bool,
    pub end_starving: bool,
    /// The pool must be reloaded from the caches.
    pub pool_load: bool,
}

/// State of a GUESS query, owned by the engine.
pub(crate) struct RunningQuery {
    pub handle: QueryHandle,
    pub muid: Muid,
    pub text: Arc<str>,
    pub media_type: u32,
    /// Hosts already contacted, never in `pool` at the same time.
    pub queried: HashSet<SocketAddr>,
    pub pool: HostPool,
    pub pending: usize,
    pub mode: Concurrency,
    pub stats: QueryStats,
    pub hops: u32,
    pub flags: QueryFlags,
    pub bw_wait: Option<WaitId>,
    pub host_wait: Option<WaitId>,
    pub delay: Option<TimerId>,
    pub last_load: Option<Timestamp>,
    pub started: Timestamp,
    pub callback: Option<QueryCallback>,
}

impl RunningQuery {
    pub fn new(
        handle: QueryHandle,
        muid: Muid,
        text: Arc<str>,
        media_type: u32,
        started: Timestamp,
        callback: Option<QueryCallback>,
    ) -> Self {
        Self {
            handle,
            muid,
            text,
            media_type,
            queried: HashSet::new(),
            pool: HostPool::default(),
            pending: 0,
            mode: Concurrency::Bounded,
            stats: QueryStats::default(),
            hops: 0,
            flags: QueryFlags::default(),
            bw_wait: None,
            host_wait: None,
            delay: None,
            last_load: None,
            started,
            callback,
        }
    }

    /// Adds a candidate host unless it was already contacted or pooled.
    pub fn add_host(&mut self, host: SocketAddr) -> bool {
        if self.queried.contains(&host) {
            return false;
        }
        self.pool.push_back(host)
    }

    /// Records `host` as contacted.
    pub fn mark_queried(&mut self, host: SocketAddr) -> bool {
        self.pool.remove(&host);
        self.queried.insert(host)
    }

    /// Puts a contacted host back at the head of the pool.
    pub fn requeue(&mut self, host: SocketAddr) {
        self.queried.remove(&host);
        self.pool.remove(&host);
        self.pool.push_front(host);
    }

    /// Counts an acknowledgment. Returns true when it moves the query to
    /// loose concurrency.
    pub fn record_ack(&mut self, warming_count: u32) -> bool {
        self.stats.acks += 1;
        if self.mode == Concurrency::Bounded && self.stats.acks >= warming_count {
            self.mode = Concurrency::Loose;
            self.flags.pool_load = true;
            return true;
        }
        false
    }

    /// RPCs that may be started this round.
    pub fn allowance(&self, alpha: usize) -> usize {
        match self.mode {
            Concurrency::Bounded => alpha.saturating_sub(self.pending),
            Concurrency::Loose => alpha,
        }
    }

    pub fn release_rpc(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }

    pub fn in_pool(&self, host: &SocketAddr) -> bool {
        self.pool.contains(host)
    }

    pub fn was_queried(&self, host: &SocketAddr) -> bool {
        self.queried.contains(host)
    }

    pub fn status(&self) -> QueryStatus {
        QueryStatus {
            muid: self.muid,
            mode: self.mode,
            stats: self.stats,
            hops: self.hops,
            pending: self.pending,
            pool: self.pool.len(),
            contacted: self.queried.len(),
            waiting_hosts: self.host_wait.is_some(),
            waiting_bandwidth: self.bw_wait.is_some(),
            delayed: self.delay.is_some(),
        }
    }
}
