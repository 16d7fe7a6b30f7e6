//! Shard stores - physical partitions with an open/sealed lifecycle
//!
//! Exactly one store per group accepts inserts. A store seals when it trips a
//! size, age or churn threshold; sealed stores are read-only until they are
//! folded into a catch-all store or, for speculative data, rescued and
//! destroyed.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::block::Shard;
use super::{ShardGroup, ShardId, StoreId};
use crate::config::StrataConfig;

/// Global store ID generator
static NEXT_STORE_ID: AtomicU32 = AtomicU32::new(1);

fn next_store_id() -> StoreId {
    NEXT_STORE_ID.fetch_add(1, Ordering::SeqCst)
}

// ============================================================================
// Store Status
// ============================================================================

/// Lifecycle status of a shard store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreStatus {
    /// Accepting new records (exactly one per group)
    Open,
    /// Read-only, pending fold-in
    Sealed,
    /// Speculative store slated for rescue of interesting records, then
    /// destruction
    RescueAndDestroy,
    /// Gone; any records it still held are deliberately abandoned
    Destroyed,
}

/// Why a store sealed, for fold-in scheduling
///
/// A recency rollover (Age) marks a fold candidate; a churn rollover marks a
/// compaction candidate first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SealReason {
    Size,
    Age,
    Churn,
    Manual,
}

// ============================================================================
// Shard Store
// ============================================================================

/// A physical partition holding one or more shards
///
/// Topology (which stores exist) is guarded by the group's lock in the
/// manager; per-store counters are atomics so allocation and migration paths
/// can update them without re-entering that lock.
#[derive(Debug)]
pub struct ShardStore {
    pub id: StoreId,
    pub group: ShardGroup,
    pub created_at: i64,
    status: RwLock<StoreStatus>,
    seal_reason: RwLock<Option<SealReason>>,
    record_count: AtomicUsize,
    churn: AtomicU64,
    /// Highest schema revision among resident records
    schema_revision: AtomicU32,
    shards: RwLock<Vec<Arc<Shard>>>,
}

impl ShardStore {
    /// Create an open store with one initial shard
    pub fn new(group: ShardGroup) -> Self {
        Self {
            id: next_store_id(),
            group,
            created_at: chrono::Utc::now().timestamp(),
            status: RwLock::new(StoreStatus::Open),
            seal_reason: RwLock::new(None),
            record_count: AtomicUsize::new(0),
            churn: AtomicU64::new(0),
            schema_revision: AtomicU32::new(0),
            shards: RwLock::new(vec![Arc::new(Shard::new())]),
        }
    }

    pub fn status(&self) -> StoreStatus {
        *self.status.read()
    }

    pub fn is_open(&self) -> bool {
        self.status() == StoreStatus::Open
    }

    pub fn seal_reason(&self) -> Option<SealReason> {
        *self.seal_reason.read()
    }

    /// Seal the store; it no longer accepts inserts
    pub fn seal(&self, reason: SealReason) {
        *self.status.write() = StoreStatus::Sealed;
        *self.seal_reason.write() = Some(reason);
    }

    pub(crate) fn set_status(&self, status: StoreStatus) {
        *self.status.write() = status;
    }

    pub fn record_count(&self) -> usize {
        self.record_count.load(Ordering::SeqCst)
    }

    pub(crate) fn add_record(&self) {
        self.record_count.fetch_add(1, Ordering::SeqCst);
        self.churn.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn sub_record(&self) {
        self.record_count.fetch_sub(1, Ordering::SeqCst);
        self.churn.fetch_add(1, Ordering::SeqCst);
    }

    pub fn churn(&self) -> u64 {
        self.churn.load(Ordering::SeqCst)
    }

    pub fn schema_revision(&self) -> u32 {
        self.schema_revision.load(Ordering::SeqCst)
    }

    /// Track the highest schema revision seen among residents
    pub(crate) fn note_schema_revision(&self, revision: u32) {
        self.schema_revision.fetch_max(revision, Ordering::SeqCst);
    }

    /// The shard new allocations land in
    pub fn primary_shard(&self) -> Arc<Shard> {
        self.shards.read()[0].clone()
    }

    pub fn shards(&self) -> Vec<Arc<Shard>> {
        self.shards.read().clone()
    }

    pub fn shard(&self, id: ShardId) -> Option<Arc<Shard>> {
        self.shards.read().iter().find(|s| s.id == id).cloned()
    }

    /// Whether the open store has tripped a rotation threshold
    pub fn rotation_due(&self, cfg: &StrataConfig, now: i64) -> Option<SealReason> {
        if self.record_count() >= cfg.rotate_after_records {
            return Some(SealReason::Size);
        }
        if now - self.created_at >= cfg.rotate_after_age_days * 86_400 {
            return Some(SealReason::Age);
        }
        if self.churn() >= cfg.rotate_after_churn {
            return Some(SealReason::Churn);
        }
        None
    }

    /// Whether the absolute per-store ceiling has been hit
    pub fn at_ceiling(&self, cfg: &StrataConfig) -> bool {
        self.record_count() >= cfg.store_ceiling
    }
}
