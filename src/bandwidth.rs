//! Outgoing GUESS bandwidth throttling.
//!
//! All queries and query key requests share one per-period byte budget.
//! Traffic is charged when a message actually leaves the send queue, and
//! the periodic tick refills the budget, carrying forward any overage so a
//! burst in one period is paid back in the next ones.
//!
//! # Example
//!
//! ```
//! use rgnut::bandwidth::UdpBandwidth;
//!
//! // 1000 bytes per period
//! let mut bw = UdpBandwidth::new(1000);
//!
//! bw.charge(1500);
//! assert!(bw.exhausted());
//!
//! // The 500 bytes overage are carried into the next period
//! assert!(bw.tick());
//! assert_eq!(bw.available(), 500);
//!
//! // A budget of 0 means unlimited
//! let mut unlimited = UdpBandwidth::unlimited();
//! unlimited.charge(u64::MAX);
//! assert!(!unlimited.exhausted());
//! ```

/// Per-period outgoing byte budget.
#[derive(Debug, Clone)]
pub struct UdpBandwidth {
    budget: u64,
    spent: u64,
    total: u64,
}

impl UdpBandwidth {
    /// Creates a throttle allowing `budget` bytes per period.
    ///
    /// A budget of 0 means unlimited.
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            spent: 0,
            total: 0,
        }
    }

    /// Creates a throttle that never reports exhaustion.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Updates the per-period budget. A budget of 0 means unlimited.
    pub fn set_budget(&mut self, budget: u64) {
        self.budget = budget;
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn is_unlimited(&self) -> bool {
        self.budget == 0
    }

    /// Records `bytes` sent during the current period.
    pub fn charge(&mut self, bytes: u64) {
        self.spent = self.spent.saturating_add(bytes);
        self.total = self.total.saturating_add(bytes);
    }

    /// Whether this period's budget is used up.
    pub fn exhausted(&self) -> bool {
        !self.is_unlimited() && self.spent >= self.budget
    }

    /// Bytes still available in this period.
    pub fn available(&self) -> u64 {
        if self.is_unlimited() {
            u64::MAX
        } else {
            self.budget.saturating_sub(self.spent)
        }
    }

    /// Bytes charged during the current period, overage included.
    pub fn spent(&self) -> u64 {
        self.spent
    }

    /// Bytes charged since creation.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Starts a new period.
    ///
    /// Returns whether bandwidth is available again, i.e. whether waiters
    /// should be woken up.
    pub fn tick(&mut self) -> bool {
        if self.is_unlimited() {
            self.spent = 0;
        } else {
            self.spent = self.spent.saturating_sub(self.budget);
        }
        !self.exhausted()
    }
}

impl Default for UdpBandwidth {
    fn default() -> Self {
        Self::unlimited()
    }
}
