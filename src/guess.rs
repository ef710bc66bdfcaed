//! GUESS: Gnutella UDP Extension for Scalable Searches
//!
//! This module implements the client side of GUESS: queries crawl the
//! ultrapeers one UDP datagram at a time, asking each host for a query key
//! before sending it the query itself. The engine keeps a persistent cache
//! of per-host query keys and liveness data, a small link cache of
//! responsive hosts, and adapts each query's concurrency to the replies it
//! gets.

mod aging;
mod config;
mod engine;
mod env;
mod error;
mod link;
mod message;
mod qkdata;
mod query;
mod rpc;

pub use aging::AgingSet;
pub use config::GuessConfig;
pub use engine::{Engine, EngineStats};
pub use env::{is_routable, HostCatalog, SendOutcome, SendStatus, SendTag, Transport};
pub use error::GuessError;
pub use link::LinkCache;
pub use message::{
    decode_packed_hosts, decode_packed_hosts6, encode_packed_hosts, GuessPing, GuessQuery, Muid,
    Outbound, Pong,
};
pub use qkdata::{
    decode_host, encode_host, HostCapabilityRecord, HostFlags, LivenessModel, QkStats,
    QueryKeyStore, UptimeModel, RECORD_VERSION,
};
pub use query::{
    Concurrency, EndReason, QueryCallback, QueryHandle, QueryOutcome, QueryStats, QueryStatus,
};
pub use rpc::{RpcId, RpcKind, RpcRecord, RpcRegistry};
