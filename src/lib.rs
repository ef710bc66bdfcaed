//! rgnut - GUESS querying for Gnutella
//!
//! This library implements the client side of GUESS (Gnutella UDP Extension
//! for Scalable Searches): iterative UDP queries across ultrapeers, gated by
//! per-host query keys, with a persistent host cache and adaptive
//! concurrency.
//!
//! # Modules
//!
//! - [`guess`] - Query engine, host records, RPCs, link cache
//! - [`service`] - Tokio driver around the engine
//! - [`storage`] - Persistent key-value store for host records
//! - [`callout`] - Timer queue
//! - [`wq`] - Keyed wait queues with optional deadlines
//! - [`bandwidth`] - Per-period outgoing UDP budget
//! - [`time`] - Timestamps and clocks
//! - [`constants`] - Protocol constants and tuning parameters

pub mod bandwidth;
pub mod callout;
pub mod constants;
pub mod guess;
pub mod service;
pub mod storage;
pub mod time;
pub mod wq;

pub use bandwidth::UdpBandwidth;
pub use guess::{
    Engine, EngineStats, EndReason, GuessConfig, GuessError, HostCatalog, Muid, Pong,
    QueryHandle, QueryOutcome, Transport,
};
pub use service::{GuessService, QueryTicket, TokioClock};
pub use storage::{KvStore, MemoryStore, RocksStore, StorageError};
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
