//! Shard group manager - allocation, rotation and location resolution
//!
//! Owns, per group, the ordered list of shard stores. Allocation always goes
//! to the group's single open store, sealing and opening stores as
//! thresholds trip *before* the insert proceeds. Point lookups go through
//! the lookup registry's location index; the manager never scans stores to
//! find a record. The manager also owns the slice hub: every membership
//! mutation synchronously notifies attached view slices.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use super::store::{SealReason, ShardStore, StoreStatus};
use super::{next_epoch, RecordLocation, ShardGroup, StoreId};
use crate::classify::Classification;
use crate::config::StrataConfig;
use crate::lookup::{LocationTicket, LookupRegistry};
use crate::record::schema::SchemaRegistry;
use crate::record::{NounType, Record, RecordId};
use crate::shard::block::Shard;
use crate::storage::BlockIo;
use crate::view::{RecordFetch, RecordFilter, SliceHub, SliceMeta, SortSpec, ViewSlice};
use crate::{Result, StrataError};

/// Manager-resident metadata per placed record
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordEntry {
    pub noun: NounType,
    pub sort_stamp: i64,
    pub classification: Classification,
    pub schema_revision: u32,
    /// Idempotency token of the shard-level fold that last touched this
    /// record, if any
    pub fold_token: Option<u64>,
}

/// Owner of all shard groups, stores and shards
pub struct ShardGroupManager {
    cfg: StrataConfig,
    lookup: Arc<LookupRegistry>,
    schemas: Arc<SchemaRegistry>,
    io: Arc<dyn BlockIo>,
    /// Store topology per group; the per-group lock covers topology only,
    /// never cross-group traffic
    groups: [RwLock<Vec<Arc<ShardStore>>>; 3],
    hub: SliceHub,
    records: RwLock<AHashMap<RecordId, RecordEntry>>,
}

impl ShardGroupManager {
    /// Build a manager with one open store per group
    pub fn new(
        cfg: StrataConfig,
        lookup: Arc<LookupRegistry>,
        schemas: Arc<SchemaRegistry>,
        io: Arc<dyn BlockIo>,
    ) -> Self {
        let groups = [
            RwLock::new(vec![Arc::new(ShardStore::new(ShardGroup::HighValue))]),
            RwLock::new(vec![Arc::new(ShardStore::new(ShardGroup::LowValue))]),
            RwLock::new(vec![Arc::new(ShardStore::new(ShardGroup::Speculative))]),
        ];
        Self {
            cfg,
            lookup,
            schemas,
            io,
            groups,
            hub: SliceHub::new(),
            records: RwLock::new(AHashMap::new()),
        }
    }

    pub fn config(&self) -> &StrataConfig {
        &self.cfg
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Place a record into its classified group's open store
    ///
    /// The record is validated against its noun schema, the open store is
    /// rotated first if a threshold tripped, and the location index is
    /// updated before any observer hears about the record. Capacity
    /// exhaustion is retried a bounded number of times, then surfaces typed.
    pub fn allocate(
        &self,
        mut record: Record,
        classification: Classification,
    ) -> Result<LocationTicket> {
        record.schema_revision = self.schemas.validate(&record)?;

        let mut attempt = 0;
        loop {
            match self.try_allocate(&record, classification) {
                Err(StrataError::CapacityExceeded(group)) if attempt + 1 < self.cfg.retry_attempts => {
                    attempt += 1;
                    log::debug!(
                        "allocation into {:?} hit capacity, retry {}/{}",
                        group,
                        attempt,
                        self.cfg.retry_attempts
                    );
                }
                other => return other,
            }
        }
    }

    fn try_allocate(&self, record: &Record, classification: Classification) -> Result<LocationTicket> {
        let group = classification.group;
        let store = self.ensure_open(group);
        if store.at_ceiling(&self.cfg) {
            return Err(StrataError::CapacityExceeded(group));
        }

        let shard = store.primary_shard();
        let block = shard.insert(record.id, record.sort_stamp);
        let location = RecordLocation { group, store: store.id, shard: shard.id, block };

        if let Err(e) = self.io.write_record(&location, record) {
            // Undo the membership insert; the record was never placed.
            shard.remove(record.id, Some(block));
            return Err(e);
        }
        store.add_record();
        store.note_schema_revision(record.schema_revision);

        let epoch = next_epoch();
        self.lookup.set_location(record.id, location, epoch);
        self.records.write().insert(
            record.id,
            RecordEntry {
                noun: record.noun,
                sort_stamp: record.sort_stamp,
                classification,
                schema_revision: record.schema_revision,
                fold_token: None,
            },
        );
        self.hub.record_added(SliceMeta {
            id: record.id,
            stamp: record.sort_stamp,
            noun: record.noun,
            group,
        });
        Ok(LocationTicket { record: record.id, location, epoch })
    }

    /// The group's open store, rotating first if a threshold tripped
    pub(crate) fn ensure_open(&self, group: ShardGroup) -> Arc<ShardStore> {
        let now = chrono::Utc::now().timestamp();
        let mut stores = self.groups[group.index()].write();
        let open = stores.iter().find(|s| s.is_open()).cloned();
        let store = match open {
            Some(store) => store,
            None => {
                let fresh = Arc::new(ShardStore::new(group));
                stores.push(fresh.clone());
                fresh
            }
        };
        if let Some(reason) = store.rotation_due(&self.cfg, now) {
            store.seal(reason);
            log::info!(
                "sealed store {} in {:?} ({:?}, {} records), opening successor",
                store.id,
                group,
                reason,
                store.record_count()
            );
            let fresh = Arc::new(ShardStore::new(group));
            stores.push(fresh.clone());
            return fresh;
        }
        store
    }

    /// Seal the group's open store now and open a successor
    pub fn rotate(&self, group: ShardGroup) -> Result<StoreId> {
        let mut stores = self.groups[group.index()].write();
        let open = stores
            .iter()
            .find(|s| s.is_open())
            .cloned()
            .ok_or(StrataError::NoOpenStore(group))?;
        open.seal(SealReason::Manual);
        stores.push(Arc::new(ShardStore::new(group)));
        Ok(open.id)
    }

    /// Slate a sealed speculative store for rescue-and-destruction
    pub fn mark_rescue_and_destroy(&self, store: StoreId) -> Result<()> {
        let handle = self.store_handle(ShardGroup::Speculative, store)?;
        if handle.status() != StoreStatus::Sealed {
            return Err(StrataError::StoreNotSealed(store));
        }
        handle.set_status(StoreStatus::RescueAndDestroy);
        Ok(())
    }

    // ========================================================================
    // Location
    // ========================================================================

    /// O(1) point lookup through the location index; never scans stores
    pub fn locate(&self, id: RecordId) -> Result<LocationTicket> {
        self.lookup.locate(id)
    }

    /// Re-validate a ticket across a possible migration boundary
    pub fn resolve(&self, ticket: &LocationTicket) -> Result<RecordLocation> {
        self.lookup.resolve(ticket)
    }

    // ========================================================================
    // Record Lifecycle
    // ========================================================================

    /// Delete a record everywhere: membership, body, index, slices
    pub fn remove_record(&self, id: RecordId) -> Result<()> {
        let ticket = self.lookup.locate(id)?;
        let loc = ticket.location;
        let store = self.store_handle(loc.group, loc.store)?;
        let shard = store.shard(loc.shard).ok_or(StrataError::ShardNotFound(loc.shard))?;
        if shard.remove(id, Some(loc.block)).is_none() {
            return Err(StrataError::StaleLocation(id));
        }
        store.sub_record();
        self.io.delete_record(&loc, id)?;
        self.lookup.clear_location(id);
        self.records.write().remove(&id);
        self.hub.record_removed(id);
        Ok(())
    }

    /// A record's sort stamp changed; re-sort it in every observing slice
    pub fn resort_record(&self, id: RecordId, new_stamp: i64) -> Result<()> {
        let ticket = self.lookup.locate(id)?;
        let mut body = self.io.read_record(&ticket.location, id)?;
        body.sort_stamp = new_stamp;
        body.mutation_count += 1;
        self.io.write_record(&ticket.location, &body)?;
        if let Some(entry) = self.records.write().get_mut(&id) {
            entry.sort_stamp = new_stamp;
        }
        self.hub.record_resorted(id, new_stamp);
        Ok(())
    }

    /// Current classification of a placed record
    pub fn classification(&self, id: RecordId) -> Result<Classification> {
        self.records
            .read()
            .get(&id)
            .map(|e| e.classification)
            .ok_or(StrataError::RecordNotFound(id))
    }

    /// Records currently resident in one group, across all its stores
    pub fn group_record_count(&self, group: ShardGroup) -> usize {
        self.groups[group.index()]
            .read()
            .iter()
            .filter(|s| s.status() != StoreStatus::Destroyed)
            .map(|s| s.record_count())
            .sum()
    }

    /// Store handles for one group, in creation order
    pub fn stores(&self, group: ShardGroup) -> Vec<Arc<ShardStore>> {
        self.groups[group.index()].read().clone()
    }

    pub(crate) fn store_handle(&self, group: ShardGroup, store: StoreId) -> Result<Arc<ShardStore>> {
        self.groups[group.index()]
            .read()
            .iter()
            .find(|s| s.id == store)
            .cloned()
            .ok_or(StrataError::StoreNotFound(store))
    }

    pub(crate) fn shard_handle(&self, loc: &RecordLocation) -> Result<Arc<Shard>> {
        let store = self.store_handle(loc.group, loc.store)?;
        store
            .shard(loc.shard)
            .ok_or(StrataError::ShardNotFound(loc.shard))
    }

    // ========================================================================
    // Migrator Support
    // ========================================================================

    pub(crate) fn entry(&self, id: RecordId) -> Result<RecordEntry> {
        self.records
            .read()
            .get(&id)
            .copied()
            .ok_or(StrataError::RecordNotFound(id))
    }

    pub(crate) fn set_group(&self, id: RecordId, group: ShardGroup) {
        if let Some(entry) = self.records.write().get_mut(&id) {
            entry.classification.group = group;
        }
    }

    pub(crate) fn set_fold_token(&self, id: RecordId, token: u64) {
        if let Some(entry) = self.records.write().get_mut(&id) {
            entry.fold_token = Some(token);
        }
    }

    pub(crate) fn forget_record(&self, id: RecordId) {
        self.lookup.clear_location(id);
        self.records.write().remove(&id);
        self.hub.record_removed(id);
    }

    pub(crate) fn hub(&self) -> &SliceHub {
        &self.hub
    }

    pub(crate) fn io(&self) -> &Arc<dyn BlockIo> {
        &self.io
    }

    pub(crate) fn lookup(&self) -> &Arc<LookupRegistry> {
        &self.lookup
    }

    // ========================================================================
    // View Slices
    // ========================================================================

    /// Create a slice over current and future records matching the filter
    pub fn attach_slice(&self, filter: RecordFilter, sort: SortSpec) -> Arc<Mutex<ViewSlice>> {
        let slice = self.hub.attach(filter, sort);
        {
            // Seed with current membership; duplicate adds from concurrent
            // allocations are absorbed by the slice's membership guard.
            let mut locked = slice.lock();
            for (&id, entry) in self.records.read().iter() {
                locked.on_added(SliceMeta {
                    id,
                    stamp: entry.sort_stamp,
                    noun: entry.noun,
                    group: entry.classification.group,
                });
            }
        }
        slice
    }

    /// Deregister a slice from all change feeds
    pub fn detach_slice(&self, slice: &Arc<Mutex<ViewSlice>>) {
        self.hub.detach(slice);
    }
}

impl RecordFetch for ShardGroupManager {
    fn fetch(&self, id: RecordId) -> Result<Record> {
        // Locations are re-resolved on every read, never cached across a
        // migration boundary.
        let ticket = self.lookup.locate(id)?;
        self.io.read_record(&ticket.location, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AttrValue, ImportanceAttrs, SourceDurability};
    use crate::shard::BLOCK_CAPACITY;
    use crate::storage::MemoryBlockIo;

    fn manager(cfg: StrataConfig) -> ShardGroupManager {
        ShardGroupManager::new(
            cfg,
            Arc::new(LookupRegistry::new()),
            Arc::new(SchemaRegistry::builtin()),
            Arc::new(MemoryBlockIo::new()),
        )
    }

    fn message(stamp: i64) -> Record {
        let mut r = Record::new(
            NounType::MESSAGE,
            stamp,
            ImportanceAttrs::durable(SourceDurability::AccessibleCheap),
        );
        r.set_raw("subject", AttrValue::Str("s".into()));
        r
    }

    fn high() -> Classification {
        Classification {
            group: ShardGroup::HighValue,
            propagation: crate::shard::Propagation::Normal,
        }
    }

    #[test]
    fn test_allocate_then_locate_returns_open_store() {
        let mgr = manager(StrataConfig::default());
        let open = mgr.ensure_open(ShardGroup::HighValue).id;
        let r = message(10);
        let id = r.id;
        let ticket = mgr.allocate(r, high()).unwrap();
        assert_eq!(ticket.location.store, open);
        assert_eq!(mgr.locate(id).unwrap().location, ticket.location);
        assert_eq!(mgr.resolve(&ticket).unwrap(), ticket.location);
    }

    #[test]
    fn test_rotation_seals_before_insert() {
        let cfg = StrataConfig {
            rotate_after_records: 2,
            store_ceiling: 100,
            ..StrataConfig::default()
        };
        let mgr = manager(cfg);
        let first = mgr.ensure_open(ShardGroup::HighValue).id;
        for _ in 0..2 {
            mgr.allocate(message(1), high()).unwrap();
        }
        // Third insert must land in a fresh store, not the sealed one.
        let ticket = mgr.allocate(message(2), high()).unwrap();
        assert_ne!(ticket.location.store, first);
        let stores = mgr.stores(ShardGroup::HighValue);
        assert_eq!(stores.len(), 2);
        assert_eq!(stores[0].status(), StoreStatus::Sealed);
        assert_eq!(stores[0].seal_reason(), Some(SealReason::Size));
    }

    #[test]
    fn test_rotation_by_churn() {
        let cfg = StrataConfig {
            rotate_after_records: 1000,
            rotate_after_churn: 4,
            ..StrataConfig::default()
        };
        let mgr = manager(cfg);
        let first = mgr.ensure_open(ShardGroup::LowValue).id;
        let low = Classification {
            group: ShardGroup::LowValue,
            propagation: crate::shard::Propagation::Normal,
        };
        // Two insert/delete cycles: four membership mutations, one resident.
        for _ in 0..2 {
            let r = message(1);
            let id = r.id;
            mgr.allocate(r, low).unwrap();
            mgr.remove_record(id).unwrap();
        }
        let ticket = mgr.allocate(message(2), low).unwrap();
        assert_ne!(ticket.location.store, first);
        let stores = mgr.stores(ShardGroup::LowValue);
        assert_eq!(stores[0].seal_reason(), Some(SealReason::Churn));
    }

    #[test]
    fn test_ceiling_surfaces_capacity_exceeded() {
        // Ceiling == rotation threshold == 1 means even a fresh store is
        // immediately full once one record lands.
        let cfg = StrataConfig {
            rotate_after_records: 1000,
            store_ceiling: 1,
            retry_attempts: 2,
            ..StrataConfig::default()
        };
        let mgr = manager(cfg);
        mgr.allocate(message(1), high()).unwrap();
        assert!(matches!(
            mgr.allocate(message(2), high()),
            Err(StrataError::CapacityExceeded(ShardGroup::HighValue))
        ));
    }

    #[test]
    fn test_block_split_scenario() {
        // 1025 records into an empty high-value shard: two blocks, the
        // second holding one record starting at ordinal 1024.
        let mgr = manager(StrataConfig::default());
        for i in 0..(BLOCK_CAPACITY as i64 + 1) {
            mgr.allocate(message(i), high()).unwrap();
        }
        let store = &mgr.stores(ShardGroup::HighValue)[0];
        let shard = store.primary_shard();
        let state = shard.state().lock();
        assert_eq!(state.block_count(), 2);
        assert_eq!(state.blocks()[1].len(), 1);
        assert_eq!(state.blocks()[1].block_start, 1024);
    }

    #[test]
    fn test_remove_record_clears_everything() {
        let mgr = manager(StrataConfig::default());
        let r = message(5);
        let id = r.id;
        mgr.allocate(r, high()).unwrap();
        mgr.remove_record(id).unwrap();
        assert!(matches!(mgr.locate(id), Err(StrataError::RecordNotFound(_))));
        assert_eq!(mgr.group_record_count(ShardGroup::HighValue), 0);
    }

    #[test]
    fn test_slice_seeded_and_live() {
        let mgr = manager(StrataConfig::default());
        let a = message(10);
        let ida = a.id;
        mgr.allocate(a, high()).unwrap();

        let slice = mgr.attach_slice(RecordFilter::group(ShardGroup::HighValue), SortSpec::StampAscending);
        assert_eq!(slice.lock().ids(), vec![ida]);

        let b = message(5);
        let idb = b.id;
        mgr.allocate(b, high()).unwrap();
        assert_eq!(slice.lock().ids(), vec![idb, ida]);

        mgr.detach_slice(&slice);
        mgr.allocate(message(1), high()).unwrap();
        assert_eq!(slice.lock().len(), 2);
    }

    #[test]
    fn test_resort_record_moves_slice_position() {
        let mgr = manager(StrataConfig::default());
        let a = message(10);
        let b = message(20);
        let (ida, idb) = (a.id, b.id);
        mgr.allocate(a, high()).unwrap();
        mgr.allocate(b, high()).unwrap();

        let slice = mgr.attach_slice(RecordFilter::any(), SortSpec::StampAscending);
        mgr.resort_record(ida, 30).unwrap();
        assert_eq!(slice.lock().ids(), vec![idb, ida]);
        assert_eq!(mgr.fetch(ida).unwrap().sort_stamp, 30);
    }

    #[test]
    fn test_schema_violation_blocks_allocation() {
        let mgr = manager(StrataConfig::default());
        let r = Record::new(
            NounType::MESSAGE,
            0,
            ImportanceAttrs::durable(SourceDurability::External),
        );
        // Missing required "subject".
        assert!(matches!(
            mgr.allocate(r, high()),
            Err(StrataError::SchemaViolation { .. })
        ));
    }
}
