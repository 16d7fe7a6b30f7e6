//! View slice core - the live total order and its splice deltas

use ahash::AHashMap;

use super::{
    ListenerError, RecordFetch, RecordFilter, SliceDelta, SliceListener, SliceMeta, SortSpec,
};
use crate::record::{Record, RecordId};
use crate::shard::ShardGroup;
use crate::Result;

/// One positioned entry in the slice order
#[derive(Debug, Clone, Copy)]
struct SliceItem {
    id: RecordId,
    stamp: i64,
}

/// A live total order over a filtered record subset
///
/// The order itself is index-sized (id + sort stamp per entry); record
/// bodies are only materialized for the requested visible range, fetched
/// lazily from shard storage.
pub struct ViewSlice {
    filter: RecordFilter,
    sort: SortSpec,
    order: Vec<SliceItem>,
    /// Membership and current group per resident id
    meta: AHashMap<RecordId, SliceMeta>,
    /// Requested window `[start, start + count)`
    visible: Option<(usize, usize)>,
    /// Fetched bodies for the visible range
    materialized: AHashMap<RecordId, Record>,
    listener: Option<Box<dyn SliceListener>>,
    listener_failures: u64,
}

impl ViewSlice {
    pub fn new(filter: RecordFilter, sort: SortSpec) -> Self {
        Self {
            filter,
            sort,
            order: Vec::new(),
            meta: AHashMap::new(),
            visible: None,
            materialized: AHashMap::new(),
            listener: None,
            listener_failures: 0,
        }
    }

    /// Attach the structural-delta listener
    pub fn set_listener(&mut self, listener: Box<dyn SliceListener>) {
        self.listener = Some(listener);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The full order as ids, in slice position order
    pub fn ids(&self) -> Vec<RecordId> {
        self.order.iter().map(|i| i.id).collect()
    }

    /// Id at a slice position
    pub fn id_at(&self, index: usize) -> Option<RecordId> {
        self.order.get(index).map(|i| i.id)
    }

    /// How many listener callbacks have failed (and been skipped past)
    pub fn listener_failures(&self) -> u64 {
        self.listener_failures
    }

    // ========================================================================
    // Visible Range
    // ========================================================================

    /// Materialize record bodies for `[start, start + count)`
    ///
    /// Bodies already resident are not re-fetched; bodies that fell outside
    /// the new window are dropped.
    pub fn request_visible_range(
        &mut self,
        start: usize,
        count: usize,
        fetch: &dyn RecordFetch,
    ) -> Result<()> {
        let end = (start + count).min(self.order.len());
        let start = start.min(end);
        let wanted: Vec<RecordId> = self.order[start..end].iter().map(|i| i.id).collect();

        self.materialized.retain(|id, _| wanted.contains(id));
        for id in wanted {
            if !self.materialized.contains_key(&id) {
                let record = fetch.fetch(id)?;
                self.materialized.insert(id, record);
            }
        }
        self.visible = Some((start, end - start));
        Ok(())
    }

    /// The currently requested window
    pub fn visible_range(&self) -> Option<(usize, usize)> {
        self.visible
    }

    /// Materialized body for a record inside the visible range
    pub fn materialized(&self, id: RecordId) -> Option<&Record> {
        self.materialized.get(&id)
    }

    // ========================================================================
    // Membership Events (from the slice hub)
    // ========================================================================

    pub(crate) fn on_added(&mut self, meta: SliceMeta) {
        if !self.filter.matches(meta.noun, meta.group) || self.meta.contains_key(&meta.id) {
            return;
        }
        let index = self.insertion_index(meta.stamp, meta.id);
        self.order.insert(index, SliceItem { id: meta.id, stamp: meta.stamp });
        self.meta.insert(meta.id, meta);
        self.emit(SliceDelta::SpliceAdd { index, items: vec![meta.id] });
    }

    pub(crate) fn on_removed(&mut self, id: RecordId) {
        let Some(meta) = self.meta.remove(&id) else { return };
        let Some(index) = self.index_of(meta.stamp, id) else { return };
        self.order.remove(index);
        self.materialized.remove(&id);
        self.emit(SliceDelta::SpliceRemove { index, count: 1 });
    }

    /// A migration observed from this slice's perspective
    pub(crate) fn on_moved(&mut self, meta: SliceMeta, from_group: ShardGroup) {
        let was_in = self.filter.matches(meta.noun, from_group) && self.meta.contains_key(&meta.id);
        let now_in = self.filter.matches(meta.noun, meta.group);
        match (was_in, now_in) {
            (true, true) => {
                // Same position, new group; nothing structural happened.
                if let Some(m) = self.meta.get_mut(&meta.id) {
                    m.group = meta.group;
                }
            }
            (true, false) => self.on_removed(meta.id),
            (false, true) => self.on_added(meta),
            (false, false) => {}
        }
    }

    /// A record's sort stamp changed; its position moves in one delta
    pub(crate) fn on_resorted(&mut self, id: RecordId, new_stamp: i64) {
        let Some(meta) = self.meta.get(&id).copied() else { return };
        let Some(from) = self.index_of(meta.stamp, id) else { return };
        self.order.remove(from);
        let to = self.insertion_index(new_stamp, id);
        self.order.insert(to, SliceItem { id, stamp: new_stamp });
        if let Some(m) = self.meta.get_mut(&id) {
            m.stamp = new_stamp;
        }
        if from == to {
            return;
        }
        self.emit(SliceDelta::Move { from, to, count: 1 });
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn insertion_index(&self, stamp: i64, id: RecordId) -> usize {
        self.order
            .binary_search_by(|item| self.sort.cmp((item.stamp, item.id), (stamp, id)))
            .unwrap_or_else(|i| i)
    }

    fn index_of(&self, stamp: i64, id: RecordId) -> Option<usize> {
        self.order
            .binary_search_by(|item| self.sort.cmp((item.stamp, item.id), (stamp, id)))
            .ok()
    }

    /// State is already mutated when the listener runs; a failing listener
    /// is logged and counted, never propagated.
    fn emit(&mut self, delta: SliceDelta) {
        if let Some(listener) = self.listener.as_mut() {
            if let Err(e) = listener.on_delta(&delta) {
                log::warn!("view slice listener failed on {:?}: {}", delta, e);
                self.listener_failures += 1;
            }
        }
    }
}
