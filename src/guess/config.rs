use crate::constants::{
    GUESS_ALPHA, GUESS_DEFAULT_BANDWIDTH, GUESS_LINK_CACHE_SIZE, GUESS_MAX_KEPT_RESULTS,
    GUESS_MAX_ULTRAPEERS, GUESS_WARMING_COUNT,
};

/// Runtime settings of the GUESS engine.
#[derive(Debug, Clone, PartialEq)]
pub struct GuessConfig {
    /// Whether GUESS querying is allowed at all.
    pub enabled: bool,
    /// Outgoing bytes allowed per bandwidth period, 0 for unlimited.
    pub bandwidth_per_period: u64,
    pub link_cache_size: usize,
    /// Concurrent RPCs per query while warming up.
    pub alpha: usize,
    /// Kept results after which a query ends.
    pub max_kept_results: u32,
    /// Acknowledgments after which a query stops bounding its concurrency.
    pub warming_count: u32,
    /// Lower bound of the per-query acknowledgment budget.
    pub max_ultrapeers_floor: u32,
}

impl Default for GuessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bandwidth_per_period: GUESS_DEFAULT_BANDWIDTH,
            link_cache_size: GUESS_LINK_CACHE_SIZE,
            alpha: GUESS_ALPHA,
            max_kept_results: GUESS_MAX_KEPT_RESULTS,
            warming_count: GUESS_WARMING_COUNT,
            max_ultrapeers_floor: GUESS_MAX_ULTRAPEERS,
        }
    }
}

impl GuessConfig {
    pub fn unlimited_bandwidth(mut self) -> Self {
        self.bandwidth_per_period = 0;
        self
    }
}
