//! Sharding - value-tiered placement of records
//!
//! Key concepts:
//! - Shard group: classification bucket (high value / low value / speculative)
//!   governing which stores a record is eligible for.
//! - Shard store: physical partition holding one or more shards; exactly one
//!   store per group is open to new records at any time.
//! - Shard: logical subset of a store, composed of fixed-capacity blocks.
//! - Shard block: 1024-record chunk tracking allocation order and time range.
//!
//! Placement is driven by probability of access, probability of mutation and
//! expected record lifetime: segregating rarely-touched data keeps the hot
//! stores small, cache-friendly and cheap to compact.

pub mod block;
pub mod group;
pub mod migrate;
pub mod store;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub use block::{Shard, ShardBlock};
pub use group::ShardGroupManager;
pub use migrate::{MigrateReport, PruneReport, ShardMigrator};
pub use store::{SealReason, ShardStore, StoreStatus};

/// Records per shard block
pub const BLOCK_CAPACITY: usize = 1024;

/// Unique shard store identifier
pub type StoreId = u32;

/// Unique shard identifier
pub type ShardId = u32;

// ============================================================================
// Shard Group
// ============================================================================

/// Value tier a record is placed into
///
/// The enum discriminant doubles as the fixed lock-ordering rank for
/// cross-group migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ShardGroup {
    /// Data the user cares about with high probability
    HighValue = 1,
    /// Durable data the user has shown no great interest in
    LowValue = 2,
    /// Data that is not long for this world unless user action saves it
    Speculative = 3,
}

impl ShardGroup {
    /// All groups in lock-order rank
    pub fn all() -> [ShardGroup; 3] {
        [ShardGroup::HighValue, ShardGroup::LowValue, ShardGroup::Speculative]
    }

    /// Lock-ordering rank (lower rank locks first)
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub(crate) fn index(self) -> usize {
        self as usize - 1
    }
}

// ============================================================================
// Propagation Mode
// ============================================================================

/// Whether importance flows to/from related records across group boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Propagation {
    /// Importance propagates from related records normally
    Normal,
    /// Propagation is firewalled; spelunking through a mailing list must not
    /// suck in every message a known contact ever sent there
    Firewall,
}

// ============================================================================
// Record Location
// ============================================================================

/// The single (group, store, shard, block) a record occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLocation {
    pub group: ShardGroup,
    pub store: StoreId,
    pub shard: ShardId,
    pub block: u32,
}

// ============================================================================
// Move Epochs
// ============================================================================

/// Global move-epoch generator
///
/// Every placement and migration stamps the record's location entry with a
/// fresh epoch; holding a location across an epoch change is what
/// `StaleLocation` detects. Shard-level folds also use an epoch as their
/// idempotency token.
static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_epoch() -> u64 {
    NEXT_EPOCH.fetch_add(1, Ordering::SeqCst)
}
