//! Protocol constants and tuning parameters.
//!
//! This module contains the constants used throughout the GUESS engine,
//! including timeouts, cache sizes, liveness thresholds and concurrency
//! parameters.
//!
//! These values follow the defaults of established Gnutella servents.

use std::time::Duration;

// ============================================================================
// Concurrency
// ============================================================================

/// Level of query concurrency while warming up (bounded mode)
pub const GUESS_ALPHA: usize = 5;

/// Acknowledgments after which a query switches to loose concurrency
pub const GUESS_WARMING_COUNT: u32 = 100;

/// Minimum amount of acknowledgments before a query stops on its own
pub const GUESS_MAX_ULTRAPEERS: u32 = 50_000;

/// Fraction of the cached hosts a query is allowed to reach
pub const GUESS_ULTRAPEER_RATIO: f64 = 0.85;

/// Default amount of kept results after which a query ends
pub const GUESS_MAX_KEPT_RESULTS: u32 = 1000;

// ============================================================================
// Timeouts - RPC and scheduling
// ============================================================================

/// Lifetime of a pending RPC before it times out
pub const GUESS_RPC_LIFETIME: Duration = Duration::from_secs(15);

/// Delay before iterating again after a send queue drop or token backlog
pub const GUESS_FIND_DELAY: Duration = Duration::from_secs(5);

/// How long a starving query waits for new hosts before reloading its pool
pub const GUESS_WAIT_DELAY: Duration = Duration::from_secs(30);

/// Interval at which the service drives the engine timers
pub const GUESS_TIMER_RESOLUTION: Duration = Duration::from_millis(500);

/// Minimum delay between two pool reloads from the persistent store
pub const GUESS_DBLOAD_DELAY: Duration = Duration::from_secs(60);

/// Initial recontact delay after a timeout, doubled per consecutive timeout
pub const GUESS_TIMEOUT_DELAY: Duration = Duration::from_secs(5);

/// Consecutive timeouts after which a host is no longer queried
pub const GUESS_MAX_TIMEOUTS: u8 = 5;

// ============================================================================
// Query keys (capability tokens)
// ============================================================================

/// Lifetime of a cached query key
pub const GUESS_QK_LIFE: Duration = Duration::from_secs(3600);

/// Throttle window for query key requests to the same host
pub const GUESS_QK_FREQ: Duration = Duration::from_secs(60);

/// Throttle window during which an alien host is not rediscovered
pub const GUESS_ALIEN_FREQ: Duration = Duration::from_secs(300);

/// Maximum length of a query key
pub const GUESS_QK_MAX_LEN: usize = 255;

// ============================================================================
// Host liveness
// ============================================================================

/// Hosts seen within this window are never pruned
pub const GUESS_FRESH_PERIOD: Duration = Duration::from_secs(3600);

/// Timeouts older than this no longer decay the alive probability
pub const GUESS_TIMEOUT_STALENESS: Duration = Duration::from_secs(3600);

/// Alive probability under which a host is considered dead
pub const GUESS_STABLE_PROBA: f64 = 1.0 / 3.0;

/// Multiplicative decay of the alive probability per consecutive timeout
pub const GUESS_ALIVE_DECIMATION: f64 = 0.85;

/// Period of the persistent store pruning sweep
pub const GUESS_PRUNE_PERIOD: Duration = Duration::from_secs(20 * 60);

// ============================================================================
// Link cache
// ============================================================================

/// Amount of GUESS hosts maintained in the link cache
pub const GUESS_LINK_CACHE_SIZE: usize = 75;

/// Period of the link cache maintenance check
pub const GUESS_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Link cache hosts quiet for longer than this are pinged
pub const GUESS_ALIVE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Probability (percent) of introducing ourselves when pinging a link host
pub const GUESS_INTRO_PROBA: u8 = 25;

/// Probability (percent) of adding a host that answered a query
pub const GUESS_LINK_ACK_PROBA: u8 = 25;

// ============================================================================
// Bandwidth
// ============================================================================

/// Period of the bandwidth throttle
pub const GUESS_BW_PERIOD: Duration = Duration::from_secs(1);

/// Default outgoing GUESS bandwidth per period (bytes), 0 means unlimited
pub const GUESS_DEFAULT_BANDWIDTH: u64 = 5 * 1024;

// ============================================================================
// Wire sizes
// ============================================================================

/// Size of a Gnutella message header
pub const GTA_HEADER_SIZE: usize = 23;

/// Size of a packed IPv4 host (address + port)
pub const PACKED_IPV4_LEN: usize = 6;

/// Size of a packed IPv6 host (address + port)
pub const PACKED_IPV6_LEN: usize = 18;

/// Size of a message unique identifier
pub const MUID_LEN: usize = 16;
