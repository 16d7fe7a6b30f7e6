//! Stable view slice - nothing the user is looking at vanishes silently
//!
//! Wraps a view slice plus a caller-chosen visible window and remaps raw
//! deltas so removals inside the window leave an explicit marker instead of
//! shifting content under the user's eyes. The window is pinned to its items,
//! not to absolute indices: churn before or after the window adjusts offsets
//! silently and produces no notification.

use super::{ListenerError, SliceDelta, SliceListener};
use crate::record::RecordId;

// ============================================================================
// Item State
// ============================================================================

/// Presentation state of one tracked window item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Backed by live data
    Materialized,
    /// Backing data is gone; stays positionally present, flagged stale
    Suppressed,
    /// Backing data is gone; replaced in place by a placeholder
    Tombstoned,
}

/// What a removal inside the window turns the item into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleMode {
    Suppress,
    Tombstone,
}

/// One tracked item in the stable window
#[derive(Debug, Clone, Copy)]
pub struct StableItem {
    pub id: RecordId,
    pub state: ItemState,
}

/// Notification to the presentation collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StableNotice {
    /// A live item entered the window at this window position
    Inserted { pos: usize, id: RecordId },
    /// An item moved within the window
    PositionChanged { from: usize, to: usize },
    /// An item the user could see lost its backing data; it remains
    /// enumerable in this state until `reconcile()`
    Stale { pos: usize, id: RecordId, state: ItemState },
}

// ============================================================================
// Stable View Slice
// ============================================================================

/// Window-pinning decorator over a view slice
///
/// Tracks only the window contents plus a shadow of the full underlying
/// order (rebuilt by replaying every delta), so moves into the window can
/// name the arriving record without consulting the slice.
pub struct StableViewSlice {
    mode: StaleMode,
    /// Replayed copy of the underlying slice order
    shadow: Vec<RecordId>,
    /// Underlying index of the first tracked (backed) item
    offset: usize,
    /// Tracked window: backed items plus stale leftovers, in display order
    items: Vec<StableItem>,
    notices: Vec<StableNotice>,
}

impl StableViewSlice {
    /// Track the window `[start, start + len)` of the given underlying order
    pub fn new(order: &[RecordId], start: usize, len: usize, mode: StaleMode) -> Self {
        let end = (start + len).min(order.len());
        let start = start.min(end);
        Self {
            mode,
            shadow: order.to_vec(),
            offset: start,
            items: order[start..end]
                .iter()
                .map(|&id| StableItem { id, state: ItemState::Materialized })
                .collect(),
            notices: Vec::new(),
        }
    }

    /// Current window contents, stale markers included
    pub fn items(&self) -> &[StableItem] {
        &self.items
    }

    /// State of a tracked record, if it is in the window
    pub fn state_of(&self, id: RecordId) -> Option<ItemState> {
        self.items.iter().find(|i| i.id == id).map(|i| i.state)
    }

    /// Drain pending notifications
    pub fn take_notices(&mut self) -> Vec<StableNotice> {
        std::mem::take(&mut self.notices)
    }

    /// Clear stale items, returning what was cleared
    ///
    /// Until this is called, every Suppressed/Tombstoned item remains
    /// enumerable; nothing is silently forgotten.
    pub fn reconcile(&mut self) -> Vec<StableItem> {
        let (stale, live): (Vec<_>, Vec<_>) = self
            .items
            .drain(..)
            .partition(|i| i.state != ItemState::Materialized);
        self.items = live;
        stale
    }

    // ========================================================================
    // Window Arithmetic
    // ========================================================================

    /// Count of tracked items still backed by the underlying order
    fn backed_len(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.state == ItemState::Materialized)
            .count()
    }

    /// Items index of the rel-th backed item
    fn backed_pos(&self, rel: usize) -> Option<usize> {
        let mut seen = 0;
        for (i, item) in self.items.iter().enumerate() {
            if item.state == ItemState::Materialized {
                if seen == rel {
                    return Some(i);
                }
                seen += 1;
            }
        }
        None
    }

    /// Items index at which an insert becomes the rel-th backed item
    fn backed_insert_pos(&self, rel: usize) -> usize {
        let mut seen = 0;
        for (i, item) in self.items.iter().enumerate() {
            if item.state == ItemState::Materialized {
                if seen == rel {
                    return i;
                }
                seen += 1;
            }
        }
        self.items.len()
    }

    // ========================================================================
    // Delta Handlers
    // ========================================================================

    fn apply_add(&mut self, index: usize, id: RecordId) {
        self.shadow.insert(index, id);
        if index < self.offset {
            // Churn before the window; contents unchanged.
            self.offset += 1;
            return;
        }
        let rel = index - self.offset;
        if rel >= self.backed_len() {
            // At or past the window's exclusive end; not tracked.
            return;
        }
        let pos = self.backed_insert_pos(rel);
        self.items.insert(pos, StableItem { id, state: ItemState::Materialized });
        self.notices.push(StableNotice::Inserted { pos, id });
    }

    fn apply_remove(&mut self, index: usize) {
        let id = self.shadow.remove(index);
        if index < self.offset {
            self.offset -= 1;
            return;
        }
        let rel = index - self.offset;
        if rel >= self.backed_len() {
            return;
        }
        let pos = match self.backed_pos(rel) {
            Some(p) => p,
            None => return,
        };
        let state = match self.mode {
            StaleMode::Suppress => ItemState::Suppressed,
            StaleMode::Tombstone => ItemState::Tombstoned,
        };
        self.items[pos] = StableItem { id, state };
        self.notices.push(StableNotice::Stale { pos, id, state });
    }

    fn apply_move(&mut self, from: usize, to: usize) {
        let id = self.shadow[from];
        let from_in = from >= self.offset && from - self.offset < self.backed_len();

        // Leave phase.
        self.shadow.remove(from);
        let mut taken: Option<(usize, StableItem)> = None;
        if from < self.offset {
            self.offset -= 1;
        } else if from_in {
            if let Some(pos) = self.backed_pos(from - self.offset) {
                taken = Some((pos, self.items.remove(pos)));
            }
        }

        // Enter phase; `to` is already a post-removal index.
        self.shadow.insert(to, id);
        // A resident item may re-enter at the window's trailing edge; an
        // outside item entering there is not tracked.
        let span = self.backed_len() + usize::from(taken.is_some());
        let to_in = to >= self.offset && to - self.offset < span;

        match (taken, to_in) {
            (Some((old_pos, item)), true) => {
                let new_pos = self.backed_insert_pos(to - self.offset);
                self.items.insert(new_pos, item);
                if new_pos != old_pos {
                    self.notices
                        .push(StableNotice::PositionChanged { from: old_pos, to: new_pos });
                }
            }
            (Some((old_pos, item)), false) => {
                // Moved out of the window: treated as a removal.
                if to < self.offset {
                    self.offset += 1;
                }
                let state = match self.mode {
                    StaleMode::Suppress => ItemState::Suppressed,
                    StaleMode::Tombstone => ItemState::Tombstoned,
                };
                self.items.insert(old_pos, StableItem { id: item.id, state });
                self.notices
                    .push(StableNotice::Stale { pos: old_pos, id: item.id, state });
            }
            (None, true) => {
                let pos = self.backed_insert_pos(to - self.offset);
                self.items.insert(pos, StableItem { id, state: ItemState::Materialized });
                self.notices.push(StableNotice::Inserted { pos, id });
            }
            (None, false) => {
                if to < self.offset {
                    self.offset += 1;
                }
            }
        }
    }
}

impl SliceListener for StableViewSlice {
    fn on_delta(&mut self, delta: &SliceDelta) -> std::result::Result<(), ListenerError> {
        match delta {
            SliceDelta::SpliceAdd { index, items } => {
                for (i, id) in items.iter().enumerate() {
                    self.apply_add(index + i, *id);
                }
            }
            SliceDelta::SpliceRemove { index, count } => {
                for _ in 0..*count {
                    self.apply_remove(*index);
                }
            }
            SliceDelta::Move { from, to, count } => {
                for _ in 0..*count {
                    self.apply_move(*from, *to);
                }
            }
        }
        Ok(())
    }
}
