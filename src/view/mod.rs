//! View slices - live windowed total orderings for presentation
//!
//! A view slice is a pre-computed total ordering over a filtered record
//! subset, letting the UI browse a huge set without materializing it. Every
//! membership mutation becomes exactly one structural delta with sequence-
//! splice semantics, so a consumer can maintain a shadow array by literally
//! replaying each delta. The stable and clustering decorators adapt raw
//! deltas for presentation; reconciling presentation jitter beyond that is
//! out of scope here.

pub mod cluster;
pub mod slice;
pub mod stable;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::record::{NounType, Record, RecordId};
use crate::shard::ShardGroup;
use crate::Result;

pub use slice::ViewSlice;

// ============================================================================
// Structural Deltas
// ============================================================================

/// One structural change to a slice's order
///
/// A combined remove+insert at one index is a single explicit `Move`, never
/// two independent deltas. Indices are post-application: replaying a `Move`
/// means remove at `from`, then insert at `to` in the shortened array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceDelta {
    SpliceAdd { index: usize, items: Vec<RecordId> },
    SpliceRemove { index: usize, count: usize },
    Move { from: usize, to: usize, count: usize },
}

/// Failure reported by a slice listener
///
/// A failing listener never corrupts slice state; the slice logs the failure
/// and keeps delivering subsequent deltas.
#[derive(Debug, thiserror::Error)]
#[error("slice listener failed: {0}")]
pub struct ListenerError(pub String);

/// Consumer of structural deltas
pub trait SliceListener: Send {
    fn on_delta(&mut self, delta: &SliceDelta) -> std::result::Result<(), ListenerError>;
}

/// Adapter sharing one listener between the emitting slice and the caller
pub struct SharedListener<T: SliceListener>(pub Arc<Mutex<T>>);

impl<T: SliceListener> SliceListener for SharedListener<T> {
    fn on_delta(&mut self, delta: &SliceDelta) -> std::result::Result<(), ListenerError> {
        self.0.lock().on_delta(delta)
    }
}

/// Reference consumer: a literal replayed copy of the slice order
#[derive(Debug, Default)]
pub struct ShadowArray {
    pub items: Vec<RecordId>,
}

impl SliceListener for ShadowArray {
    fn on_delta(&mut self, delta: &SliceDelta) -> std::result::Result<(), ListenerError> {
        match delta {
            SliceDelta::SpliceAdd { index, items } => {
                for (i, id) in items.iter().enumerate() {
                    self.items.insert(index + i, *id);
                }
            }
            SliceDelta::SpliceRemove { index, count } => {
                for _ in 0..*count {
                    self.items.remove(*index);
                }
            }
            SliceDelta::Move { from, to, count } => {
                for _ in 0..*count {
                    let id = self.items.remove(*from);
                    self.items.insert(*to, id);
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Sort & Filter Specs
// ============================================================================

/// Total-order specification; record id breaks stamp ties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortSpec {
    StampAscending,
    StampDescending,
}

impl SortSpec {
    /// Compare two (stamp, id) sort keys under this spec
    pub fn cmp(&self, a: (i64, RecordId), b: (i64, RecordId)) -> std::cmp::Ordering {
        match self {
            SortSpec::StampAscending => a.cmp(&b),
            SortSpec::StampDescending => b.cmp(&a),
        }
    }
}

/// Which records a slice observes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Restrict to these noun types; `None` means all
    pub nouns: Option<Vec<NounType>>,
    /// Restrict to these shard groups; `None` means all
    pub groups: Option<Vec<ShardGroup>>,
}

impl RecordFilter {
    /// Observe everything
    pub fn any() -> Self {
        Self::default()
    }

    /// Observe one shard group
    pub fn group(group: ShardGroup) -> Self {
        Self { nouns: None, groups: Some(vec![group]) }
    }

    /// Observe one noun type
    pub fn noun(noun: NounType) -> Self {
        Self { nouns: Some(vec![noun]), groups: None }
    }

    pub fn matches(&self, noun: NounType, group: ShardGroup) -> bool {
        self.matches_noun(noun) && self.matches_group(group)
    }

    pub fn matches_noun(&self, noun: NounType) -> bool {
        self.nouns.as_ref().map(|n| n.contains(&noun)).unwrap_or(true)
    }

    pub fn matches_group(&self, group: ShardGroup) -> bool {
        self.groups.as_ref().map(|g| g.contains(&group)).unwrap_or(true)
    }
}

// ============================================================================
// Record Metadata & Fetch
// ============================================================================

/// The index nugget a slice keeps per record
#[derive(Debug, Clone, Copy)]
pub struct SliceMeta {
    pub id: RecordId,
    pub stamp: i64,
    pub noun: NounType,
    pub group: ShardGroup,
}

/// Lazy record-body fetch used by `request_visible_range`
pub trait RecordFetch {
    fn fetch(&self, id: RecordId) -> Result<Record>;
}

// ============================================================================
// Slice Hub
// ============================================================================

/// Registry of live slices, notified synchronously with each mutation
///
/// Synchronous invocation guarantees no two structural deltas for the same
/// slice ever interleave.
pub struct SliceHub {
    slices: RwLock<Vec<Arc<Mutex<ViewSlice>>>>,
}

impl SliceHub {
    pub fn new() -> Self {
        Self { slices: RwLock::new(Vec::new()) }
    }

    /// Create and register a slice bound to a filter + sort spec
    pub fn attach(&self, filter: RecordFilter, sort: SortSpec) -> Arc<Mutex<ViewSlice>> {
        let slice = Arc::new(Mutex::new(ViewSlice::new(filter, sort)));
        self.slices.write().push(slice.clone());
        slice
    }

    /// Deregister a slice; it receives no further deltas
    pub fn detach(&self, slice: &Arc<Mutex<ViewSlice>>) {
        self.slices.write().retain(|s| !Arc::ptr_eq(s, slice));
    }

    pub fn slice_count(&self) -> usize {
        self.slices.read().len()
    }

    pub(crate) fn record_added(&self, meta: SliceMeta) {
        for slice in self.slices.read().iter() {
            slice.lock().on_added(meta);
        }
    }

    pub(crate) fn record_removed(&self, id: RecordId) {
        for slice in self.slices.read().iter() {
            slice.lock().on_removed(id);
        }
    }

    /// A migration: observers of the source see one remove, observers of the
    /// destination see one add, observers of both see no structural change.
    pub(crate) fn record_moved(&self, meta: SliceMeta, from_group: ShardGroup) {
        for slice in self.slices.read().iter() {
            slice.lock().on_moved(meta, from_group);
        }
    }

    pub(crate) fn record_resorted(&self, id: RecordId, new_stamp: i64) {
        for slice in self.slices.read().iter() {
            slice.lock().on_resorted(id, new_stamp);
        }
    }
}

impl Default for SliceHub {
    fn default() -> Self {
        Self::new()
    }
}
