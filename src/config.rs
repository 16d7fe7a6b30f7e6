//! Engine configuration
//!
//! Rotation thresholds are deliberately configuration, not constants: the
//! right recency/churn horizons depend on the deployment (desktop vs. mobile,
//! mail-heavy vs. contact-heavy stores). Defaults are illustrative.

use serde::{Deserialize, Serialize};

/// Tunable thresholds for store rotation, capacity and retry behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Records in the open store before it seals and a new store opens
    pub rotate_after_records: usize,
    /// Age in days before a store seals regardless of size
    pub rotate_after_age_days: i64,
    /// Accumulated membership mutations before a store seals
    pub rotate_after_churn: u64,
    /// Absolute per-store record ceiling; exceeding it after rotation is
    /// `CapacityExceeded`
    pub store_ceiling: usize,
    /// Bounded internal retry count for transient capacity/lock contention
    pub retry_attempts: u32,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            rotate_after_records: 64 * 1024,
            rotate_after_age_days: 60,
            rotate_after_churn: 32 * 1024,
            store_ceiling: 256 * 1024,
            retry_attempts: 3,
        }
    }
}
