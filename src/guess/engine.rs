use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng as _;
use tracing::{debug, info, trace, warn};

use super::aging::AgingSet;
use super::config::GuessConfig;
use super::env::{is_routable, HostCatalog, SendOutcome, SendStatus, SendTag, Transport};
use super::error::GuessError;
use super::link::LinkCache;
use super::message::{
    decode_packed_hosts, decode_packed_hosts6, GuessPing, GuessQuery, Muid, Outbound, Pong,
};
use super::qkdata::{HostCapabilityRecord, LivenessModel, QkStats, QueryKeyStore};
use super::query::{
    EndReason, QueryCallback, QueryHandle, QueryOutcome, QueryStatus, RunningQuery, Verdict,
};
use super::rpc::{RpcId, RpcKind, RpcRecord, RpcRegistry};
use crate::bandwidth::UdpBandwidth;
use crate::callout::{Callout, TimerId};
use crate::constants::{
    GUESS_ALIEN_FREQ, GUESS_ALIVE_PERIOD, GUESS_BW_PERIOD, GUESS_CHECK_PERIOD,
    GUESS_DBLOAD_DELAY, GUESS_FIND_DELAY, GUESS_INTRO_PROBA, GUESS_LINK_ACK_PROBA,
    GUESS_MAX_TIMEOUTS, GUESS_PRUNE_PERIOD, GUESS_QK_FREQ, GUESS_QK_LIFE, GUESS_RPC_LIFETIME,
    GUESS_ULTRAPEER_RATIO, GUESS_WAIT_DELAY,
};
use crate::storage::KvStore;
use crate::time::{Clock, Timestamp};
use crate::wq::{WaitId, WaitQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerEvent {
    QueryDelay(QueryHandle),
    BandwidthTick,
    LinkCheck,
    Prune,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WaitKey {
    /// A new GUESS host was discovered.
    HostAdded,
    /// Bandwidth became available.
    Bandwidth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Waiter {
    Query(QueryHandle),
    LinkDiscovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Traffic {
    QueryKey,
    Query,
    MoreHosts,
}

/// A message handed to the transport whose fate is not known yet.
#[derive(Debug)]
struct PendingSend {
    owner: Option<QueryHandle>,
    host: SocketAddr,
    rpc: Option<RpcId>,
    /// The RPC already completed, by reply or timeout.
    rpc_resolved: bool,
    traffic: Traffic,
    bytes: usize,
}

/// Result of trying to contact a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Contact {
    Sent,
    /// Could not be attempted now, host returned to the pool.
    Deferred,
    Dropped,
}

/// Engine-wide counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub queries_started: u64,
    pub queries_ended: u64,
    pub qk_requests: u64,
    pub queries_sent: u64,
    pub link_pings: u64,
    pub acks: u64,
    pub timeouts: u64,
    pub aliens: u64,
    pub dropped_sends: u64,
    pub bytes_sent: u64,
    pub introductions: u64,
}

/// The GUESS query engine.
///
/// A single-threaded state machine: callers feed it inbound pongs, send
/// outcomes and host discoveries, and call [`Engine::run_timers`] regularly.
/// Every callback the engine schedules for itself refers to queries by
/// [`QueryHandle`] and re-checks that the query still exists before acting.
///
/// # Examples
///
/// ```
/// use std::net::SocketAddr;
/// use std::sync::Arc;
/// use rgnut::guess::{Engine, GuessConfig, HostCatalog, Outbound, SendStatus, SendTag, Transport};
/// use rgnut::guess::{Muid, UptimeModel};
/// use rgnut::storage::MemoryStore;
/// use rgnut::time::{ManualClock, Timestamp};
///
/// struct Silent;
/// impl Transport for Silent {
///     fn send(&mut self, _: SocketAddr, _: &Outbound, _: SendTag) -> SendStatus {
///         SendStatus::Sent
///     }
///     fn local_addr(&self) -> Option<SocketAddr> {
///         None
///     }
/// }
///
/// struct NoHosts;
/// impl HostCatalog for NoHosts {
///     fn add_discovered(&mut self, _: SocketAddr) {}
///     fn add_validated(&mut self, _: SocketAddr) {}
///     fn purge(&mut self, _: &SocketAddr) {}
///     fn is_hostile(&self, _: &std::net::IpAddr) -> bool {
///         false
///     }
/// }
///
/// let clock = Arc::new(ManualClock::new(Timestamp::from_secs(1_700_000_000)));
/// let mut engine = Engine::new(
///     GuessConfig::default(),
///     clock,
///     Box::new(Silent),
///     Box::new(NoHosts),
///     Box::new(MemoryStore::new()),
///     Box::new(UptimeModel),
/// );
///
/// let muid = Muid::generate();
/// let handle = engine.create_query("free music", muid, 0, None).unwrap();
/// assert!(engine.is_running_muid(&muid));
///
/// // Nobody to ask yet: the query waits for hosts.
/// assert!(engine.query_status(handle).unwrap().waiting_hosts);
/// ```
pub struct Engine {
    config: GuessConfig,
    clock: Arc<dyn Clock>,
    transport: Box<dyn Transport>,
    catalog: Box<dyn HostCatalog>,
    qk: QueryKeyStore,
    rpcs: RpcRegistry,
    links: LinkCache,
    /// Hosts with a query key request in flight.
    qk_requests: AgingSet<SocketAddr>,
    /// Hosts known not to be GUESS servents.
    aliens: AgingSet<SocketAddr>,
    bandwidth: UdpBandwidth,
    callout: Callout<TimerEvent>,
    waits: WaitQueue<WaitKey, Waiter>,
    queries: HashMap<QueryHandle, RunningQuery>,
    by_muid: HashMap<Muid, QueryHandle>,
    sends: HashMap<SendTag, PendingSend>,
    discovery_wait: Option<WaitId>,
    periodic: Vec<TimerId>,
    next_query: u64,
    next_send: u64,
    stats: EngineStats,
}

impl Engine {
    pub fn new(
        config: GuessConfig,
        clock: Arc<dyn Clock>,
        transport: Box<dyn Transport>,
        catalog: Box<dyn HostCatalog>,
        store: Box<dyn KvStore>,
        model: Box<dyn LivenessModel>,
    ) -> Self {
        let now = clock.now();
        let mut callout = Callout::new();
        let periodic = [
            (GUESS_BW_PERIOD, TimerEvent::BandwidthTick),
            (GUESS_CHECK_PERIOD, TimerEvent::LinkCheck),
            (GUESS_PRUNE_PERIOD, TimerEvent::Prune),
        ]
        .into_iter()
        .map(|(period, event)| callout.schedule_periodic(now + period, period, event))
        .collect();

        let mut engine = Self {
            bandwidth: UdpBandwidth::new(config.bandwidth_per_period),
            links: LinkCache::new(config.link_cache_size),
            config,
            clock,
            transport,
            catalog,
            qk: QueryKeyStore::new(store, model),
            rpcs: RpcRegistry::new(GUESS_RPC_LIFETIME),
            qk_requests: AgingSet::new(GUESS_QK_FREQ),
            aliens: AgingSet::new(GUESS_ALIEN_FREQ),
            callout,
            waits: WaitQueue::new(),
            queries: HashMap::new(),
            by_muid: HashMap::new(),
            sends: HashMap::new(),
            discovery_wait: None,
            periodic,
            next_query: 0,
            next_send: 0,
            stats: EngineStats::default(),
        };

        engine.load_link_cache();
        info!(
            "GUESS engine started: {} cached hosts, {} in link cache",
            engine.qk.count(),
            engine.links.len()
        );
        engine
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Seeds the link cache with the hosts most recently seen.
    fn load_link_cache(&mut self) {
        let now = self.now();
        for host in self.qk.recent_hosts(now, self.links.capacity()) {
            self.link_add(host, 100);
        }
        if !self.links.is_full() {
            self.arm_discovery();
        }
    }

    // ========================================================================
    // Public API
    // ========================================================================

    /// Starts a GUESS query for `text`.
    ///
    /// `callback` is invoked exactly once when the query ends, unless it is
    /// cancelled without callback.
    pub fn create_query(
        &mut self,
        text: &str,
        muid: Muid,
        media_type: u32,
        callback: Option<QueryCallback>,
    ) -> Result<QueryHandle, GuessError> {
        if !self.config.enabled {
            return Err(GuessError::Disabled);
        }
        if self.by_muid.contains_key(&muid) {
            return Err(GuessError::DuplicateMuid(muid));
        }

        self.next_query += 1;
        let handle = QueryHandle(self.next_query);
        let mut query = RunningQuery::new(
            handle,
            muid,
            Arc::from(text),
            media_type,
            self.now(),
            callback,
        );
        for host in self.links.hosts() {
            query.add_host(host);
        }
        query.flags.pool_load = true;

        info!(
            "Starting GUESS {} \"{}\" ({}) with {} hosts",
            handle,
            text,
            muid,
            query.pool.len()
        );

        self.queries.insert(handle, query);
        self.by_muid.insert(muid, handle);
        self.stats.queries_started += 1;

        self.iterate(handle);
        Ok(handle)
    }

    /// Ends a query, invoking its callback if `notify` is set.
    pub fn cancel_query(&mut self, handle: QueryHandle, notify: bool) -> bool {
        if !notify {
            if let Some(query) = self.queries.get_mut(&handle) {
                query.callback = None;
            }
        }
        self.terminate(handle, EndReason::Cancelled)
    }

    /// Requests the query to end once it runs out of hosts.
    pub fn end_on_starvation(&mut self, handle: QueryHandle) -> Result<(), GuessError> {
        let query = self
            .queries
            .get_mut(&handle)
            .ok_or(GuessError::UnknownQuery)?;
        query.flags.end_starving = true;
        debug!("GUESS {} will end when starving", handle);
        Ok(())
    }

    pub fn is_running_muid(&self, muid: &Muid) -> bool {
        self.by_muid.contains_key(muid)
    }

    /// Adds `count` results received for the query of `muid`.
    pub fn report_received_results(&mut self, muid: &Muid, count: u32) -> bool {
        match self.query_by_muid(muid) {
            Some(query) => {
                query.stats.received = query.stats.received.saturating_add(count);
                true
            }
            None => false,
        }
    }

    /// Sets the amount of results kept so far for the query of `muid`.
    pub fn report_kept_results(&mut self, muid: &Muid, count: u32) -> bool {
        match self.query_by_muid(muid) {
            Some(query) => {
                query.stats.kept = count;
                true
            }
            None => false,
        }
    }

    fn query_by_muid(&mut self, muid: &Muid) -> Option<&mut RunningQuery> {
        let handle = self.by_muid.get(muid)?;
        self.queries.get_mut(handle)
    }

    /// Handles a pong that may answer one of our RPCs.
    ///
    /// Returns false when no RPC matched, letting the caller route the
    /// message elsewhere.
    pub fn handle_rpc_reply(&mut self, pong: &Pong) -> bool {
        let Some(rpc) = self.rpcs.take_reply(&pong.muid, pong.from.ip()) else {
            return false;
        };
        if let Some(send) = self.pending_send(rpc.send) {
            send.rpc_resolved = true;
        }

        let now = self.now();
        let host = rpc.host;
        trace!(
            "{:?} reply from {} for {} after {:?}",
            rpc.kind,
            pong.from,
            rpc.muid,
            now.since(rpc.issued)
        );

        self.qk.traffic(&host, now);
        self.links.touch(&host);

        let owner = self.live_owner(&rpc);
        if let Some(query) = self.query_mut(owner) {
            query.release_rpc();
        }

        match rpc.kind {
            RpcKind::QueryKey => self.on_query_key_reply(&rpc, pong, owner),
            RpcKind::Query => self.on_query_ack(&rpc, pong, owner),
            RpcKind::MoreHosts => self.on_more_hosts_reply(&rpc, pong),
        }
        true
    }

    /// Handles a ping by which `from` introduces itself as a GUESS host
    /// listening on the port carried in `payload`.
    pub fn handle_introduction_ping(
        &mut self,
        from: SocketAddr,
        payload: &[u8],
    ) -> Result<(), GuessError> {
        let port = match payload {
            [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
            _ => {
                return Err(GuessError::MalformedExtension {
                    extension: "GUE",
                    reason: format!("introduction payload of {} bytes", payload.len()),
                })
            }
        };

        let host = SocketAddr::new(from.ip(), port);
        if !self.is_contactable(&host) {
            debug!("Ignoring GUESS introduction from {}", host);
            return Ok(());
        }

        let now = self.now();
        self.stats.introductions += 1;
        self.qk.traffic(&host, now);
        self.catalog.add_validated(host);
        self.link_add(host, 100);
        self.announce_hosts(&[host]);
        debug!("{} introduced itself as a GUESS host", host);
        Ok(())
    }

    /// Notifies the engine of a GUESS host learned by the host cache.
    pub fn host_discovered(&mut self, host: SocketAddr) {
        self.announce_hosts(&[host]);
    }

    /// Reports the fate of a message the transport had queued.
    pub fn send_outcome(&mut self, tag: SendTag, outcome: SendOutcome) {
        let Some(send) = self.sends.remove(&tag) else {
            return;
        };
        if let (Some(rpc), false) = (send.rpc, send.rpc_resolved) {
            self.rpcs.detach_send(rpc);
        }

        let owner = send.owner.filter(|h| self.queries.contains_key(h));
        match outcome {
            SendOutcome::Sent => {
                self.bandwidth.charge(send.bytes as u64);
                self.stats.bytes_sent += send.bytes as u64;
                let Some(query) = self.query_mut(owner) else {
                    return;
                };
                match send.traffic {
                    Traffic::Query => {
                        query.stats.queried += 1;
                        query.stats.query_bytes += send.bytes as u64;
                    }
                    Traffic::QueryKey | Traffic::MoreHosts => {
                        query.stats.qk_bytes += send.bytes as u64;
                    }
                }
            }
            SendOutcome::Dropped => {
                self.stats.dropped_sends += 1;
                debug!("{:?} to {} dropped by the UDP queue", send.traffic, send.host);
                if send.rpc_resolved {
                    return;
                }
                if let Some(rpc) = send.rpc {
                    self.rpcs.cancel(rpc);
                }
                if send.traffic == Traffic::QueryKey {
                    self.qk_requests.remove(&send.host);
                }

                let Some(handle) = owner else {
                    return;
                };
                if let Some(query) = self.queries.get_mut(&handle) {
                    if send.rpc.is_some() {
                        query.release_rpc();
                    }
                    query.requeue(send.host);
                    if query.flags.sending {
                        query.flags.udp_drop = true;
                        return;
                    }
                }
                self.delay(handle, GUESS_FIND_DELAY);
            }
        }
    }

    /// Returns up to `capacity` GUESS hosts worth advertising to others,
    /// link cache members first.
    pub fn fill_caught_hosts(&mut self, capacity: usize) -> Vec<SocketAddr> {
        let mut hosts = self.links.hosts();
        hosts.truncate(capacity);
        if hosts.len() < capacity {
            let now = self.now();
            for host in self.qk.recent_hosts(now, capacity) {
                if hosts.len() >= capacity {
                    break;
                }
                if !hosts.contains(&host) {
                    hosts.push(host);
                }
            }
        }
        hosts
    }

    /// Runs every expired timer, RPC timeout and wait expiry.
    pub fn run_timers(&mut self) {
        let now = self.now();
        while let Some((_, event)) = self.callout.pop_expired(now) {
            self.on_timer(event);
        }
        while let Some(rpc) = self.rpcs.pop_expired(now) {
            self.on_rpc_timeout(rpc);
        }
        for (_, key, waiter) in self.waits.expire(now) {
            self.on_wait_expired(key, waiter);
        }
    }

    /// Earliest pending timer or RPC deadline.
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        match (self.callout.next_deadline(), self.rpcs.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Enables or disables GUESS querying. Disabling ends every running
    /// query.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.config.enabled == enabled {
            return;
        }
        self.config.enabled = enabled;
        info!("GUESS querying {}", if enabled { "enabled" } else { "disabled" });
        if !enabled {
            for handle in self.query_handles() {
                self.iterate(handle);
            }
        }
    }

    pub fn set_bandwidth(&mut self, bytes_per_period: u64) {
        self.config.bandwidth_per_period = bytes_per_period;
        self.bandwidth.set_budget(bytes_per_period);
    }

    /// Ends every query, stops the periodic work and flushes the store.
    pub fn shutdown(&mut self) {
        self.config.enabled = false;
        for handle in self.query_handles() {
            self.terminate(handle, EndReason::Shutdown);
        }
        for id in self.periodic.drain(..) {
            self.callout.cancel(id);
        }
        if let Some(id) = self.discovery_wait.take() {
            self.waits.remove(id);
        }
        self.qk.sync();
        info!(
            "GUESS engine shut down: {} queries run, {} hosts cached",
            self.stats.queries_started,
            self.qk.count()
        );
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &GuessConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn qk_stats(&self) -> QkStats {
        self.qk.stats()
    }

    pub fn query_status(&self, handle: QueryHandle) -> Option<QueryStatus> {
        self.queries.get(&handle).map(RunningQuery::status)
    }

    pub fn query_handle(&self, muid: &Muid) -> Option<QueryHandle> {
        self.by_muid.get(muid).copied()
    }

    pub fn running_queries(&self) -> usize {
        self.queries.len()
    }

    pub fn link_hosts(&self) -> Vec<SocketAddr> {
        self.links.hosts()
    }

    pub fn pending_rpcs(&self) -> usize {
        self.rpcs.len()
    }

    pub fn cached_hosts(&self) -> usize {
        self.qk.count()
    }

    pub fn host_record(&mut self, host: &SocketAddr) -> Option<HostCapabilityRecord> {
        self.qk.get(host)
    }

    pub fn bandwidth(&self) -> &UdpBandwidth {
        &self.bandwidth
    }

    #[cfg(test)]
    pub(crate) fn query(&self, handle: QueryHandle) -> Option<&RunningQuery> {
        self.queries.get(&handle)
    }

    fn query_handles(&self) -> Vec<QueryHandle> {
        let mut handles: Vec<_> = self.queries.keys().copied().collect();
        handles.sort();
        handles
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// Acknowledgments after which a query has reached enough hosts.
    fn host_budget(&self) -> u32 {
        let scaled = (self.qk.count() as f64 * GUESS_ULTRAPEER_RATIO) as u32;
        scaled.max(self.config.max_ultrapeers_floor)
    }

    fn end_reason(&self, query: &RunningQuery) -> Option<EndReason> {
        if !self.config.enabled {
            Some(EndReason::Disabled)
        } else if query.stats.acks >= self.host_budget() {
            Some(EndReason::HostBudget)
        } else if query.stats.kept >= self.config.max_kept_results {
            Some(EndReason::EnoughResults)
        } else {
            None
        }
    }

    /// Runs one round of the query.
    fn iterate(&mut self, handle: QueryHandle) {
        let Some(query) = self.queries.get(&handle) else {
            return;
        };
        if let Some(reason) = self.end_reason(query) {
            self.terminate(handle, reason);
            return;
        }
        if query.flags.pool_load {
            self.load_pool(handle);
        }

        let Some(query) = self.queries.get_mut(&handle) else {
            return;
        };
        if query.delay.is_some() || query.bw_wait.is_some() {
            trace!("GUESS {} round deferred", handle);
            return;
        }
        let allowed = query.allowance(self.config.alpha);
        if allowed == 0 {
            trace!("GUESS {} has {} RPCs pending", handle, query.pending);
            return;
        }

        query.hops += 1;
        query.flags.sending = true;
        query.flags.udp_drop = false;
        let attempts = query.pool.len();
        let hops = query.hops;

        let mut sent = 0;
        let mut deferred = 0;
        let mut awaiting = 0;
        let mut backing_off = 0;
        for _ in 0..attempts {
            if sent >= allowed || self.bandwidth.exhausted() {
                break;
            }
            let Some(host) = self.next_host(handle, &mut awaiting, &mut backing_off) else {
                break;
            };
            match self.contact(handle, host) {
                Contact::Sent => sent += 1,
                Contact::Deferred => deferred += 1,
                Contact::Dropped => {}
            }
            match self.queries.get(&handle) {
                Some(query) if query.flags.udp_drop => break,
                Some(_) => {}
                None => return,
            }
        }

        let Some(query) = self.queries.get_mut(&handle) else {
            return;
        };
        query.flags.sending = false;
        trace!(
            "GUESS {} round {}: {} contacted, {} deferred, {} awaiting keys, {} backing off, {} pooled",
            handle,
            hops,
            sent,
            deferred,
            awaiting,
            backing_off,
            query.pool.len()
        );

        if query.flags.udp_drop {
            query.flags.udp_drop = false;
            self.delay(handle, GUESS_FIND_DELAY);
        } else if sent == 0 && self.bandwidth.exhausted() {
            if query.bw_wait.is_none() {
                debug!("GUESS {} waiting for bandwidth", handle);
                let waiter = Waiter::Query(handle);
                query.bw_wait = Some(self.waits.sleep(WaitKey::Bandwidth, waiter, None));
            }
        } else if sent == 0 && deferred + awaiting + backing_off > 0 {
            self.delay(handle, GUESS_FIND_DELAY);
        } else if query.pool.is_empty() {
            if query.flags.end_starving && query.pending == 0 {
                self.terminate(handle, EndReason::Starving);
            } else if query.host_wait.is_none() && !query.flags.end_starving {
                debug!("GUESS {} starving, waiting for hosts", handle);
                let deadline = self.clock.now() + GUESS_WAIT_DELAY;
                let waiter = Waiter::Query(handle);
                query.host_wait = Some(self.waits.sleep(WaitKey::HostAdded, waiter, Some(deadline)));
            }
        } else if let Some(id) = query.host_wait.take() {
            self.waits.remove(id);
        }
    }

    /// Picks the next eligible host of the query pool, dropping the hosts
    /// that will never be. Skipped hosts are counted in `awaiting` (token
    /// requested) or `backing_off` (timeout backoff not elapsed).
    fn next_host(
        &mut self,
        handle: QueryHandle,
        awaiting: &mut usize,
        backing_off: &mut usize,
    ) -> Option<SocketAddr> {
        let now = self.clock.now();
        let Self {
            queries,
            qk,
            qk_requests,
            aliens,
            catalog,
            ..
        } = self;
        let query = queries.get_mut(&handle)?;

        let mut dropped = Vec::new();
        let host = query.pool.select(
            |host| {
                if aliens.contains(host, now) || catalog.is_hostile(&host.ip()) {
                    return Verdict::Drop;
                }
                if let Some(record) = qk.get(host) {
                    if record.timeouts >= GUESS_MAX_TIMEOUTS {
                        return Verdict::Drop;
                    }
                    if !record.can_recontact(now) {
                        *backing_off += 1;
                        return Verdict::Skip;
                    }
                }
                if qk_requests.contains(host, now) {
                    *awaiting += 1;
                    return Verdict::Skip;
                }
                Verdict::Take
            },
            &mut dropped,
        );

        // Dropped hosts must not come back through discovery.
        for host in dropped {
            trace!("GUESS {} drops {}", handle, host);
            query.queried.insert(host);
        }
        host
    }

    /// Contacts `host` for the query, requesting its query key first when
    /// none is cached.
    fn contact(&mut self, handle: QueryHandle, host: SocketAddr) -> Contact {
        let now = self.now();
        if let Some(query) = self.queries.get_mut(&handle) {
            query.mark_queried(host);
        }
        let key = self
            .qk
            .get(&host)
            .and_then(|r| r.valid_query_key(now, GUESS_QK_LIFE).cloned());
        match key {
            Some(key) => self.send_query(handle, host, key),
            None => self.request_query_key(Some(handle), host),
        }
    }

    fn send_query(&mut self, handle: QueryHandle, host: SocketAddr, key: Bytes) -> Contact {
        let now = self.now();
        let Some(query) = self.queries.get_mut(&handle) else {
            return Contact::Deferred;
        };

        let rpc = match self
            .rpcs
            .register(host, query.muid, RpcKind::Query, Some(handle), query.hops, now)
        {
            Ok(rpc) => rpc,
            Err(e) => {
                debug!("GUESS {} cannot query {}: {}", handle, host, e);
                query.requeue(host);
                return Contact::Deferred;
            }
        };

        let oob = self.transport.oob_capable();
        let message = Outbound::Query(GuessQuery {
            muid: query.muid,
            text: Arc::clone(&query.text),
            media_type: query.media_type,
            query_key: key,
            reply_to: if oob { self.transport.local_addr() } else { None },
            oob,
        });
        query.pending += 1;
        self.stats.queries_sent += 1;

        trace!("GUESS {} querying {}", handle, host);
        self.dispatch(host, message, Some(handle), Some(rpc), Traffic::Query)
    }

    /// Asks `host` for a query key, on behalf of a query or for link cache
    /// maintenance.
    fn request_query_key(&mut self, owner: Option<QueryHandle>, host: SocketAddr) -> Contact {
        let now = self.now();
        let (muid, hops) = match owner.and_then(|h| self.queries.get(&h)) {
            Some(query) => (query.muid, query.hops),
            None => (Muid::generate(), 0),
        };

        let rpc = match self
            .rpcs
            .register(host, muid, RpcKind::QueryKey, owner, hops, now)
        {
            Ok(rpc) => rpc,
            Err(e) => {
                debug!("Cannot request query key from {}: {}", host, e);
                if let Some(query) = self.query_mut(owner) {
                    query.requeue(host);
                }
                return Contact::Deferred;
            }
        };

        let pinged = self.qk.get(&host).is_some_and(|r| r.flags.pinged);
        let introduce = !pinged
            || (owner.is_none() && rand::rng().random_range(0..100u8) < GUESS_INTRO_PROBA);
        let introduction = match self.transport.local_addr() {
            Some(addr) if introduce => Some(addr.port()),
            _ => None,
        };
        if introduction.is_some() && !pinged {
            self.qk.update_flags(&host, |f| f.pinged = true);
        }

        self.qk_requests.insert(host, now);
        if let Some(query) = self.query_mut(owner) {
            query.pending += 1;
        }
        self.stats.qk_requests += 1;

        trace!("Requesting query key from {}", host);
        let message = Outbound::Ping(GuessPing::query_key_request(muid, introduction));
        self.dispatch(host, message, owner, Some(rpc), Traffic::QueryKey)
    }

    /// Asks a productive link host for more GUESS hosts.
    fn request_more_hosts(&mut self, host: SocketAddr) {
        let now = self.now();
        let muid = Muid::generate();
        match self.rpcs.register(host, muid, RpcKind::MoreHosts, None, 0, now) {
            Ok(rpc) => {
                debug!("Asking {} for more GUESS hosts", host);
                self.stats.link_pings += 1;
                let message = Outbound::Ping(GuessPing::more_hosts(muid));
                self.dispatch(host, message, None, Some(rpc), Traffic::MoreHosts);
            }
            Err(e) => debug!("Cannot ask {} for hosts: {}", host, e),
        }
    }

    /// Hands a message to the transport.
    fn dispatch(
        &mut self,
        to: SocketAddr,
        message: Outbound,
        owner: Option<QueryHandle>,
        rpc: Option<RpcId>,
        traffic: Traffic,
    ) -> Contact {
        self.next_send += 1;
        let tag = SendTag(self.next_send);
        self.sends.insert(
            tag,
            PendingSend {
                owner,
                host: to,
                rpc,
                rpc_resolved: false,
                traffic,
                bytes: message.encoded_len(),
            },
        );
        if let Some(rpc) = rpc {
            self.rpcs.attach_send(rpc, tag);
        }

        match self.transport.send(to, &message, tag) {
            SendStatus::Sent => {
                self.send_outcome(tag, SendOutcome::Sent);
                Contact::Sent
            }
            SendStatus::Queued => Contact::Sent,
            SendStatus::Dropped => {
                self.send_outcome(tag, SendOutcome::Dropped);
                Contact::Dropped
            }
        }
    }

    /// Refills the pool from the link cache and the persistent store, at
    /// most once per reload period.
    fn load_pool(&mut self, handle: QueryHandle) {
        let now = self.now();
        let Some(query) = self.queries.get(&handle) else {
            return;
        };
        if let Some(last) = query.last_load {
            if now.since(last) < GUESS_DBLOAD_DELAY {
                return;
            }
        }

        let mut candidates = Vec::new();
        let (qk, catalog) = (&self.qk, &self.catalog);
        qk.for_each(|host, record| {
            if record.timeouts < GUESS_MAX_TIMEOUTS
                && !qk.is_probably_dead(record, now)
                && !catalog.is_hostile(&host.ip())
            {
                candidates.push((record.last_seen, host));
            }
        });
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let links = self.links.hosts();
        let Some(query) = self.queries.get_mut(&handle) else {
            return;
        };
        query.flags.pool_load = false;
        query.last_load = Some(now);

        let mut added = 0;
        for host in links.into_iter().chain(candidates.into_iter().map(|(_, h)| h)) {
            if query.add_host(host) {
                added += 1;
            }
        }
        debug!("GUESS {} loaded {} hosts, {} pooled", handle, added, query.pool.len());
    }

    fn delay(&mut self, handle: QueryHandle, delay: std::time::Duration) {
        let due = self.now() + delay;
        if let Some(query) = self.queries.get_mut(&handle) {
            if query.delay.is_none() {
                trace!("GUESS {} delayed for {:?}", handle, delay);
                query.delay = Some(self.callout.schedule(due, TimerEvent::QueryDelay(handle)));
            }
        }
    }

    /// Ends a query, releasing everything it holds and invoking its callback.
    fn terminate(&mut self, handle: QueryHandle, reason: EndReason) -> bool {
        let Some(mut query) = self.queries.remove(&handle) else {
            return false;
        };
        self.by_muid.remove(&query.muid);
        for id in [query.bw_wait.take(), query.host_wait.take()].into_iter().flatten() {
            self.waits.remove(id);
        }
        if let Some(timer) = query.delay.take() {
            self.callout.cancel(timer);
        }

        let elapsed = self.now().since(query.started);
        info!(
            "GUESS {} \"{}\" ended ({:?}) after {:?}: {} hosts queried, {} acks, {} kept",
            handle,
            query.text,
            reason,
            elapsed,
            query.stats.queried,
            query.stats.acks,
            query.stats.kept
        );
        self.stats.queries_ended += 1;

        if let Some(callback) = query.callback.take() {
            callback(QueryOutcome {
                handle,
                muid: query.muid,
                reason,
                stats: query.stats,
                hops: query.hops,
                elapsed,
            });
        }
        true
    }

    // ========================================================================
    // RPC completion
    // ========================================================================

    fn live_owner(&self, rpc: &RpcRecord) -> Option<QueryHandle> {
        rpc.owner.filter(|h| self.queries.contains_key(h))
    }

    fn query_mut(&mut self, handle: Option<QueryHandle>) -> Option<&mut RunningQuery> {
        self.queries.get_mut(&handle?)
    }

    fn pending_send(&mut self, tag: Option<SendTag>) -> Option<&mut PendingSend> {
        self.sends.get_mut(&tag?)
    }

    fn on_query_key_reply(&mut self, rpc: &RpcRecord, pong: &Pong, owner: Option<QueryHandle>) {
        let now = self.now();
        let host = rpc.host;
        self.qk_requests.remove(&host);

        let key = match &pong.query_key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => {
                self.mark_alien(host);
                if let Some(handle) = owner {
                    self.iterate(handle);
                }
                return;
            }
        };

        self.qk.set_query_key(&host, &key, now);
        self.catalog.add_validated(host);
        self.link_add(host, 100);
        self.harvest(host, pong, owner);

        if let Some(handle) = owner {
            if self.queries.contains_key(&handle) {
                self.send_query(handle, host, key);
            }
        }
    }

    fn on_query_ack(&mut self, rpc: &RpcRecord, pong: &Pong, owner: Option<QueryHandle>) {
        let now = self.now();
        let host = rpc.host;
        self.stats.acks += 1;

        let new_key = match &pong.query_key {
            Some(key) if !key.is_empty() => self.qk.set_query_key(&host, key, now),
            _ => false,
        };
        self.link_add(host, GUESS_LINK_ACK_PROBA);
        self.harvest(host, pong, owner);

        let Some(handle) = owner else {
            return;
        };
        let warming_count = self.config.warming_count;
        let Some(query) = self.queries.get_mut(&handle) else {
            return;
        };
        if query.record_ack(warming_count) {
            info!(
                "GUESS {} switching to loose concurrency after {} acks",
                handle, query.stats.acks
            );
        }

        if new_key {
            debug!("GUESS {}: {} sent a new query key, requeuing", handle, host);
            query.requeue(host);
            return;
        }
        if rpc.hops >= query.hops {
            self.iterate(handle);
        }
    }

    fn on_more_hosts_reply(&mut self, rpc: &RpcRecord, pong: &Pong) {
        if let Some(key) = pong.query_key.as_ref().filter(|k| !k.is_empty()) {
            let now = self.now();
            self.qk.set_query_key(&rpc.host, key, now);
        }
        let found = self.harvest(rpc.host, pong, None);
        debug!("{} returned {} GUESS hosts", rpc.host, found.len());

        let room = self.links.capacity().saturating_sub(self.links.len());
        let candidates: Vec<_> = found
            .into_iter()
            .filter(|h| !self.links.contains(h))
            .take(room)
            .collect();
        let now = self.now();
        for host in candidates {
            if !self.qk_requests.contains(&host, now) {
                self.request_query_key(None, host);
            }
        }
    }

    /// Collects the hosts a pong advertises, feeding them to discovery and
    /// to the owning query.
    fn harvest(
        &mut self,
        host: SocketAddr,
        pong: &Pong,
        owner: Option<QueryHandle>,
    ) -> Vec<SocketAddr> {
        let mut found = Vec::new();

        if let Some(advertised) = pong.advertised() {
            if advertised != host {
                self.qk.update_flags(&host, |f| f.pongs_for_others = true);
                found.push(advertised);
            }
        }

        let lists = [
            pong.packed_hosts.as_ref().map(|d| decode_packed_hosts(d)),
            pong.packed_hosts6.as_ref().map(|d| decode_packed_hosts6(d)),
        ];
        for list in lists.into_iter().flatten() {
            match list {
                Ok(hosts) if !hosts.is_empty() => {
                    self.qk.update_flags(&host, |f| f.packed_hosts = true);
                    found.extend(hosts);
                }
                Ok(_) => {}
                Err(e) => debug!("Ignoring pong extension from {}: {}", host, e),
            }
        }

        let mut seen = HashSet::new();
        found.retain(|h| *h != host && seen.insert(*h));
        let found: Vec<_> = found
            .into_iter()
            .filter(|h| self.is_contactable(h))
            .collect();
        if found.is_empty() {
            return found;
        }

        for &addr in &found {
            self.catalog.add_discovered(addr);
        }
        if let Some(query) = self.query_mut(owner) {
            for &addr in &found {
                query.add_host(addr);
            }
        }
        self.announce_hosts(&found);
        found
    }

    fn on_rpc_timeout(&mut self, rpc: RpcRecord) {
        if let Some(send) = self.pending_send(rpc.send) {
            send.rpc_resolved = true;
        }
        let owner = self.live_owner(&rpc);
        if rpc.owner.is_some() && owner.is_none() {
            trace!("{} timed out for a finished query", rpc.id);
            return;
        }

        let now = self.now();
        if rpc.kind == RpcKind::QueryKey {
            self.qk_requests.remove(&rpc.host);
        }
        self.stats.timeouts += 1;
        if let Some(record) = self.qk.timeout(&rpc.host, now) {
            debug!(
                "{:?} to {} timed out ({} in a row)",
                rpc.kind, rpc.host, record.timeouts
            );
        }
        self.remove_if_dead(rpc.host);

        if let Some(handle) = owner {
            if let Some(query) = self.queries.get_mut(&handle) {
                query.release_rpc();
            }
            self.iterate(handle);
        }
    }

    // ========================================================================
    // Hosts and link cache
    // ========================================================================

    fn is_contactable(&mut self, host: &SocketAddr) -> bool {
        let now = self.now();
        is_routable(host)
            && self.transport.local_addr() != Some(*host)
            && !self.catalog.is_hostile(&host.ip())
            && !self.aliens.contains(host, now)
    }

    fn link_add(&mut self, host: SocketAddr, percent: u8) {
        if !self.is_contactable(&host) {
            return;
        }
        if self.links.try_add(host, percent) {
            debug!("{} joins the GUESS link cache ({} hosts)", host, self.links.len());
        }
    }

    /// Forgets `host` if the liveness model says it is probably dead.
    fn remove_if_dead(&mut self, host: SocketAddr) {
        let now = self.now();
        let Some(record) = self.qk.get(&host) else {
            return;
        };
        if !self.qk.is_probably_dead(&record, now) {
            return;
        }
        debug!("GUESS host {} is probably dead", host);
        self.qk.delete(&host);
        if self.links.remove(&host) {
            self.arm_discovery();
        }
    }

    /// Purges a host which does not speak GUESS.
    fn mark_alien(&mut self, host: SocketAddr) {
        let now = self.now();
        debug!("{} is not a GUESS host", host);
        self.stats.aliens += 1;
        self.aliens.insert(host, now);
        self.qk.delete(&host);
        self.catalog.purge(&host);
        for query in self.queries.values_mut() {
            query.pool.remove(&host);
        }
        if self.links.remove(&host) {
            self.arm_discovery();
        }
    }

    fn arm_discovery(&mut self) {
        if self.discovery_wait.is_none() && !self.links.is_full() && !self.periodic.is_empty() {
            trace!("Waiting for new GUESS hosts to fill the link cache");
            let id = self.waits.sleep(WaitKey::HostAdded, Waiter::LinkDiscovery, None);
            self.discovery_wait = Some(id);
        }
    }

    /// Wakes everyone waiting for new hosts.
    fn announce_hosts(&mut self, hosts: &[SocketAddr]) {
        let hosts: Vec<_> = hosts
            .iter()
            .copied()
            .filter(|h| self.is_contactable(h))
            .collect();
        if hosts.is_empty() {
            return;
        }

        for (_, waiter) in self.waits.wakeup(&WaitKey::HostAdded) {
            match waiter {
                Waiter::Query(handle) => {
                    let Some(query) = self.queries.get_mut(&handle) else {
                        continue;
                    };
                    query.host_wait = None;
                    for &host in &hosts {
                        query.add_host(host);
                    }
                    debug!("GUESS {} woken up by {} new hosts", handle, hosts.len());
                    self.iterate(handle);
                }
                Waiter::LinkDiscovery => {
                    self.discovery_wait = None;
                    let now = self.now();
                    for &host in &hosts {
                        if self.links.is_full() {
                            break;
                        }
                        if !self.links.contains(&host) && !self.qk_requests.contains(&host, now) {
                            self.request_query_key(None, host);
                        }
                    }
                }
            }
        }
    }

    /// Pings quiet or stale link hosts, and looks for more hosts when the
    /// cache is not full.
    fn check_links(&mut self) {
        if !self.config.enabled {
            return;
        }
        let now = self.now();
        let now_secs = now.as_secs_u32();

        for host in self.links.hosts() {
            let stale = match self.qk.get(&host) {
                Some(record) => {
                    let quiet = u64::from(now_secs.saturating_sub(record.last_seen))
                        >= GUESS_ALIVE_PERIOD.as_secs();
                    quiet || record.valid_query_key(now, GUESS_QK_LIFE).is_none()
                }
                None => true,
            };
            if stale && !self.qk_requests.contains(&host, now) {
                self.stats.link_pings += 1;
                self.request_query_key(None, host);
            }
        }

        if self.links.is_full() {
            return;
        }
        let hosts = self.links.hosts();
        if hosts.is_empty() {
            self.arm_discovery();
            return;
        }
        let productive = hosts
            .iter()
            .copied()
            .find(|h| self.qk.get(h).is_some_and(|r| r.flags.is_productive()));
        let target = productive.unwrap_or(hosts[0]);
        if !self.rpcs.has_pending_with(&target) {
            self.request_more_hosts(target);
        }
    }

    fn prune(&mut self) {
        let now = self.now();
        let catalog = &self.catalog;
        self.qk.prune(now, |host| catalog.is_hostile(&host.ip()));
        self.qk_requests.gc(now);
        self.aliens.gc(now);

        let stale: Vec<_> = self
            .links
            .hosts()
            .into_iter()
            .filter(|h| self.qk.get(h).is_none())
            .collect();
        for host in stale {
            self.links.remove(&host);
        }
        if !self.links.is_full() {
            self.arm_discovery();
        }
    }

    // ========================================================================
    // Timers and waits
    // ========================================================================

    fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::QueryDelay(handle) => {
                if let Some(query) = self.queries.get_mut(&handle) {
                    query.delay = None;
                    self.iterate(handle);
                }
            }
            TimerEvent::BandwidthTick => {
                if self.bandwidth.tick() {
                    for (_, waiter) in self.waits.wakeup(&WaitKey::Bandwidth) {
                        if let Waiter::Query(handle) = waiter {
                            if let Some(query) = self.queries.get_mut(&handle) {
                                query.bw_wait = None;
                                self.iterate(handle);
                            }
                        }
                    }
                }
            }
            TimerEvent::LinkCheck => self.check_links(),
            TimerEvent::Prune => self.prune(),
        }
    }

    fn on_wait_expired(&mut self, key: WaitKey, waiter: Waiter) {
        match waiter {
            Waiter::Query(handle) => {
                let Some(query) = self.queries.get_mut(&handle) else {
                    return;
                };
                match key {
                    WaitKey::HostAdded => query.host_wait = None,
                    WaitKey::Bandwidth => query.bw_wait = None,
                }
                query.flags.pool_load = true;
                trace!("GUESS {} wait expired", handle);
                self.iterate(handle);
            }
            Waiter::LinkDiscovery => {
                self.discovery_wait = None;
                self.arm_discovery();
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.qk.sync();
        if !self.queries.is_empty() {
            warn!("GUESS engine dropped with {} running queries", self.queries.len());
        }
    }
}
