//! Collaborators the engine relies on but does not implement.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use super::message::Outbound;

/// Identifies a message handed to the [`Transport`] until its fate is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SendTag(pub(crate) u64);

impl fmt::Display for SendTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send#{}", self.0)
    }
}

/// Immediate result of [`Transport::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The datagram left right away.
    Sent,
    /// The datagram was enqueued. Its fate must be reported later through
    /// [`Engine::send_outcome`](super::Engine::send_outcome).
    Queued,
    /// The datagram was dropped by the local queue.
    Dropped,
}

/// Final fate of a queued datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Dropped,
}

/// UDP layer used to reach GUESS hosts.
pub trait Transport: Send {
    /// Serializes and sends `message` to `to`.
    fn send(&mut self, to: SocketAddr, message: &Outbound, tag: SendTag) -> SendStatus;

    /// Address we are listening on, if reachable from outside.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Whether we can receive out-of-band query hits.
    fn oob_capable(&self) -> bool {
        false
    }
}

/// The servent's host cache.
pub trait HostCatalog: Send {
    /// Records a GUESS host learned from a third party.
    fn add_discovered(&mut self, host: SocketAddr);

    /// Records a GUESS host we exchanged traffic with.
    fn add_validated(&mut self, host: SocketAddr);

    /// Forgets a host entirely.
    fn purge(&mut self, host: &SocketAddr);

    fn is_hostile(&self, addr: &IpAddr) -> bool;
}

/// Whether `host` is a plausible unicast endpoint.
pub fn is_routable(host: &SocketAddr) -> bool {
    if host.port() == 0 {
        return false;
    }
    match host.ip() {
        IpAddr::V4(ip) => !(ip.is_unspecified() || ip.is_multicast() || ip.is_broadcast()),
        IpAddr::V6(ip) => !(ip.is_unspecified() || ip.is_multicast()),
    }
}
