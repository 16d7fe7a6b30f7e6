//! Shards and shard blocks
//!
//! Blocks fill in allocation order, not sort order, so inserts stay O(1);
//! `block_start` records the shard-wide allocation ordinal of the block's
//! first record and strictly increases within a shard. Each block tracks the
//! date range and mutation churn of its residents for fold-in scheduling.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use super::{ShardId, BLOCK_CAPACITY};
use crate::record::RecordId;

/// Global shard ID generator
static NEXT_SHARD_ID: AtomicU32 = AtomicU32::new(1);

fn next_shard_id() -> ShardId {
    NEXT_SHARD_ID.fetch_add(1, Ordering::SeqCst)
}

// ============================================================================
// Shard Block
// ============================================================================

/// Fixed-capacity chunk of a shard
#[derive(Debug, Clone)]
pub struct ShardBlock {
    /// Allocation ordinal of this block's first record; monotonic per shard
    pub block_start: u64,
    /// Membership mutations applied to this block
    pub mutation_count: u64,
    /// Earliest sort stamp among residents (0 until first insert)
    pub date_start: i64,
    /// Latest sort stamp among residents
    pub date_end: i64,
    /// Resident record ids in allocation order
    records: Vec<RecordId>,
}

impl ShardBlock {
    fn new(block_start: u64) -> Self {
        Self {
            block_start,
            mutation_count: 0,
            date_start: 0,
            date_end: 0,
            records: Vec::with_capacity(BLOCK_CAPACITY),
        }
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= BLOCK_CAPACITY
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[RecordId] {
        &self.records
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.records.contains(&id)
    }

    fn push(&mut self, id: RecordId, stamp: i64) {
        debug_assert!(!self.is_full());
        if self.records.is_empty() {
            self.date_start = stamp;
            self.date_end = stamp;
        } else {
            self.date_start = self.date_start.min(stamp);
            self.date_end = self.date_end.max(stamp);
        }
        self.records.push(id);
        self.mutation_count += 1;
    }

    fn remove(&mut self, id: RecordId) -> bool {
        if let Some(pos) = self.records.iter().position(|&r| r == id) {
            self.records.remove(pos);
            self.mutation_count += 1;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Shard State
// ============================================================================

/// Membership state of a shard, guarded by the shard's exclusive lock
#[derive(Debug, Default)]
pub struct ShardState {
    blocks: Vec<ShardBlock>,
    /// Total records ever allocated into this shard; never decreases, so
    /// `block_start` stays monotonic even across removals
    allocated: u64,
    /// Membership mutations across all blocks
    pub churn: u64,
    /// Idempotency token of an in-progress or completed shard-level fold
    pub fold_epoch: Option<u64>,
}

impl ShardState {
    /// Insert a record, opening a new block if the last one is full
    ///
    /// Returns the index of the block the record landed in.
    pub fn insert(&mut self, id: RecordId, stamp: i64) -> u32 {
        // The allocation ordinal decides, not resident count: a block that
        // lost records to removal is never backfilled.
        let needs_block = match self.blocks.last() {
            Some(b) => self.allocated >= b.block_start + BLOCK_CAPACITY as u64,
            None => true,
        };
        if needs_block {
            self.blocks.push(ShardBlock::new(self.allocated));
        }
        let idx = self.blocks.len() - 1;
        self.blocks[idx].push(id, stamp);
        self.allocated += 1;
        self.churn += 1;
        idx as u32
    }

    /// Remove a record, searching the hinted block first
    ///
    /// Returns the index of the block it was removed from.
    pub fn remove(&mut self, id: RecordId, block_hint: Option<u32>) -> Option<u32> {
        if let Some(hint) = block_hint {
            let i = hint as usize;
            if i < self.blocks.len() && self.blocks[i].remove(id) {
                self.churn += 1;
                return Some(hint);
            }
        }
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if block.remove(id) {
                self.churn += 1;
                return Some(i as u32);
            }
        }
        None
    }

    pub fn record_count(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[ShardBlock] {
        &self.blocks
    }

    /// Record ids resident in one block, cloned out for chunked migration
    pub fn block_records(&self, block: usize) -> Vec<RecordId> {
        self.blocks.get(block).map(|b| b.records.to_vec()).unwrap_or_default()
    }
}

// ============================================================================
// Shard
// ============================================================================

/// Logical subset of a shard store
///
/// Membership is only ever mutated under the shard's exclusive lock; readers
/// go through the lookup registry instead of scanning.
#[derive(Debug)]
pub struct Shard {
    pub id: ShardId,
    state: Mutex<ShardState>,
}

impl Shard {
    pub fn new() -> Self {
        Self { id: next_shard_id(), state: Mutex::new(ShardState::default()) }
    }

    /// The exclusive membership lock; migrations hold both endpoints' locks
    pub(crate) fn state(&self) -> &Mutex<ShardState> {
        &self.state
    }

    /// Insert under the shard lock; returns the destination block index
    pub fn insert(&self, id: RecordId, stamp: i64) -> u32 {
        self.state.lock().insert(id, stamp)
    }

    /// Remove under the shard lock; returns the source block index
    pub fn remove(&self, id: RecordId, block_hint: Option<u32>) -> Option<u32> {
        self.state.lock().remove(id, block_hint)
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().record_count()
    }

    pub fn block_count(&self) -> usize {
        self.state.lock().block_count()
    }
}

impl Default for Shard {
    fn default() -> Self {
        Self::new()
    }
}
