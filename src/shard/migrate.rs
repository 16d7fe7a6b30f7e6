//! Shard migration - atomic relocation between shard groups
//!
//! A single-record migration holds both endpoint shard locks for its whole
//! critical section and updates the location index before releasing them, so
//! no reader ever observes a half-moved record. Locks are always taken in
//! group rank order (high-value side first), which makes concurrent
//! migrations deadlock-free by construction. Shard-level folds move records
//! in block-sized chunks and stamp each moved record with the fold's epoch
//! token, so an interrupted fold can be re-run and skip work already done.

use std::sync::Arc;

use super::block::Shard;
use super::group::ShardGroupManager;
use super::store::{ShardStore, StoreStatus};
use super::{next_epoch, RecordLocation, ShardGroup, ShardId, StoreId};
use crate::lookup::LocationTicket;
use crate::record::{Record, RecordId};
use crate::view::SliceMeta;
use crate::{Result, StrataError};

/// Outcome of a shard-level fold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateReport {
    /// Records relocated by this run
    pub moved: usize,
    /// Records skipped (already stamped by this fold, or gone)
    pub skipped: usize,
    /// Records still resident in the source shard
    pub remaining: usize,
}

/// Outcome of a speculative-store prune
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    /// Records promoted out before destruction
    pub rescued: usize,
    /// Records deliberately dropped with the store
    pub abandoned: usize,
    /// Whether the store was fully drained and destroyed
    pub completed: bool,
}

/// Executor for record- and shard-level migrations
pub struct ShardMigrator {
    manager: Arc<ShardGroupManager>,
}

impl ShardMigrator {
    pub fn new(manager: Arc<ShardGroupManager>) -> Self {
        Self { manager }
    }

    // ========================================================================
    // Single-Record Migration
    // ========================================================================

    /// Move one record to another group's open store
    ///
    /// Retries a bounded number of times if the record moves underneath us,
    /// then fails typed. Migrating a record already in the target group is a
    /// no-op.
    pub fn migrate_record(&self, id: RecordId, to_group: ShardGroup) -> Result<LocationTicket> {
        let mut attempt = 0;
        loop {
            // Fresh per attempt: the stamp may change between retries.
            let entry = self.manager.entry(id)?;
            let ticket = self.manager.locate(id)?;
            if ticket.location.group == to_group {
                return Ok(ticket);
            }
            let source_store = self
                .manager
                .store_handle(ticket.location.group, ticket.location.store)?;
            let source_shard = source_store
                .shard(ticket.location.shard)
                .ok_or(StrataError::ShardNotFound(ticket.location.shard))?;

            match self.relocate(
                id,
                entry.sort_stamp,
                ticket.location,
                &source_store,
                &source_shard,
                to_group,
            ) {
                Ok(_) => {
                    self.manager.hub().record_moved(
                        SliceMeta {
                            id,
                            stamp: entry.sort_stamp,
                            noun: entry.noun,
                            group: to_group,
                        },
                        ticket.location.group,
                    );
                    return self.manager.locate(id);
                }
                Err(StrataError::StaleLocation(_))
                    if attempt + 1 < self.manager.config().retry_attempts =>
                {
                    attempt += 1;
                    log::debug!("record {} moved during migration, retry {}", id, attempt);
                }
                Err(StrataError::StaleLocation(_)) => {
                    return Err(StrataError::MigrationConflict(id))
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ========================================================================
    // Shard-Level Fold
    // ========================================================================

    /// Fold an entire shard of a sealed store into another group
    pub fn migrate_shard(
        &self,
        from_group: ShardGroup,
        store: StoreId,
        shard: ShardId,
        to_group: ShardGroup,
    ) -> Result<MigrateReport> {
        self.migrate_shard_chunked(from_group, store, shard, to_group, usize::MAX)
    }

    /// Fold at most `max_blocks` block-sized chunks, then yield
    ///
    /// The fold's epoch token survives in the shard state, so a later call
    /// resumes where this one stopped and re-running over already-moved
    /// records is harmless.
    pub fn migrate_shard_chunked(
        &self,
        from_group: ShardGroup,
        store: StoreId,
        shard: ShardId,
        to_group: ShardGroup,
        max_blocks: usize,
    ) -> Result<MigrateReport> {
        let source_store = self.manager.store_handle(from_group, store)?;
        if source_store.is_open() {
            return Err(StrataError::StoreNotSealed(store));
        }
        let source_shard = source_store
            .shard(shard)
            .ok_or(StrataError::ShardNotFound(shard))?;

        let run_epoch = {
            let mut state = source_shard.state().lock();
            match state.fold_epoch {
                Some(epoch) => epoch,
                None => {
                    let epoch = next_epoch();
                    state.fold_epoch = Some(epoch);
                    epoch
                }
            }
        };

        let mut moved = 0usize;
        let mut skipped = 0usize;
        let mut blocks_done = 0usize;
        while blocks_done < max_blocks {
            let batch = Self::next_batch(&source_shard);
            if batch.is_empty() {
                break;
            }
            let mut metas = Vec::new();
            let mut batch_moved = 0usize;
            for id in batch {
                let entry = match self.manager.entry(id) {
                    Ok(entry) => entry,
                    Err(_) => {
                        skipped += 1;
                        continue;
                    }
                };
                if entry.fold_token == Some(run_epoch) {
                    skipped += 1;
                    continue;
                }
                let from = self.manager.locate(id)?.location;
                match self.relocate(id, entry.sort_stamp, from, &source_store, &source_shard, to_group)
                {
                    Ok(_) => {
                        self.manager.set_fold_token(id, run_epoch);
                        metas.push(SliceMeta {
                            id,
                            stamp: entry.sort_stamp,
                            noun: entry.noun,
                            group: to_group,
                        });
                        moved += 1;
                        batch_moved += 1;
                    }
                    Err(StrataError::CapacityExceeded(_)) => {
                        return Err(StrataError::PartialMigration {
                            moved,
                            remaining: source_shard.record_count(),
                        });
                    }
                    Err(StrataError::StaleLocation(_)) => skipped += 1,
                    Err(e) => return Err(e),
                }
            }
            for meta in metas {
                self.manager.hub().record_moved(meta, from_group);
            }
            blocks_done += 1;
            if batch_moved == 0 {
                // Everything left in this block was skip-only; a second pass
                // over it would not make progress.
                break;
            }
        }
        Ok(MigrateReport {
            moved,
            skipped,
            remaining: source_shard.record_count(),
        })
    }

    // ========================================================================
    // Speculative Prune
    // ========================================================================

    /// Rescue interesting records out of a rescue-and-destroy store, then
    /// destroy it with everything else still inside
    ///
    /// `rescue` inspects each record body; matches are promoted into
    /// `to_group`, the rest are deliberately abandoned. A block budget makes
    /// the prune cancellable; an incomplete run leaves the store intact and
    /// reports `completed: false`.
    pub fn prune_speculative(
        &self,
        to_group: ShardGroup,
        rescue: &dyn Fn(&Record) -> bool,
        max_blocks: Option<usize>,
    ) -> Result<PruneReport> {
        if to_group == ShardGroup::Speculative {
            return Err(StrataError::PruneDestinationInvalid(to_group));
        }
        let store = self
            .manager
            .stores(ShardGroup::Speculative)
            .into_iter()
            .find(|s| s.status() == StoreStatus::RescueAndDestroy)
            .ok_or(StrataError::PruneSourceMissing)?;

        let budget = max_blocks.unwrap_or(usize::MAX);
        let mut rescued = 0usize;
        let mut abandoned = 0usize;
        let mut blocks_done = 0usize;
        for shard in store.shards() {
            loop {
                let batch = Self::next_batch(&shard);
                if batch.is_empty() {
                    break;
                }
                // Budget exhaustion only matters while work remains; a run
                // that drains the store still completes it.
                if blocks_done >= budget {
                    return Ok(PruneReport { rescued, abandoned, completed: false });
                }
                let mut metas = Vec::new();
                for id in batch {
                    let ticket = match self.manager.locate(id) {
                        Ok(ticket) => ticket,
                        Err(_) => continue,
                    };
                    let body = self.manager.io().read_record(&ticket.location, id)?;
                    if rescue(&body) {
                        let entry = self.manager.entry(id)?;
                        self.relocate(id, entry.sort_stamp, ticket.location, &store, &shard, to_group)?;
                        metas.push(SliceMeta {
                            id,
                            stamp: entry.sort_stamp,
                            noun: entry.noun,
                            group: to_group,
                        });
                        rescued += 1;
                    } else {
                        // Abandoned: membership and index entry go now, the
                        // body goes with the store.
                        shard.remove(id, Some(ticket.location.block));
                        store.sub_record();
                        self.manager.forget_record(id);
                        abandoned += 1;
                    }
                }
                for meta in metas {
                    self.manager.hub().record_moved(meta, ShardGroup::Speculative);
                }
                blocks_done += 1;
            }
        }

        self.manager.io().destroy_store(store.id)?;
        store.set_status(StoreStatus::Destroyed);
        log::info!(
            "pruned speculative store {}: {} rescued, {} abandoned",
            store.id,
            rescued,
            abandoned
        );
        Ok(PruneReport { rescued, abandoned, completed: true })
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Snapshot of the first non-empty block's residents
    fn next_batch(shard: &Arc<Shard>) -> Vec<RecordId> {
        let state = shard.state().lock();
        for block in state.blocks() {
            if !block.is_empty() {
                return block.records().to_vec();
            }
        }
        Vec::new()
    }

    /// The migration critical section: both shard locks in rank order,
    /// membership moved, index updated, counters adjusted, all before the
    /// locks release. Slice notification is the caller's job.
    fn relocate(
        &self,
        id: RecordId,
        stamp: i64,
        from: RecordLocation,
        source_store: &Arc<ShardStore>,
        source_shard: &Arc<Shard>,
        to_group: ShardGroup,
    ) -> Result<RecordLocation> {
        let dest_store = self.manager.ensure_open(to_group);
        if dest_store.at_ceiling(self.manager.config()) {
            return Err(StrataError::CapacityExceeded(to_group));
        }
        let dest_shard = dest_store.primary_shard();

        let src = source_shard.state();
        let dst = dest_shard.state();
        let source_first = from.group.rank() <= to_group.rank();
        let (mut first, mut second) = if source_first {
            (src.lock(), dst.lock())
        } else {
            (dst.lock(), src.lock())
        };
        let (src_guard, dst_guard) = if source_first {
            (&mut first, &mut second)
        } else {
            (&mut second, &mut first)
        };

        if src_guard.remove(id, Some(from.block)).is_none() {
            // The record left this shard since we looked; caller re-locates.
            return Err(StrataError::StaleLocation(id));
        }
        let block = dst_guard.insert(id, stamp);
        let to = RecordLocation {
            group: to_group,
            store: dest_store.id,
            shard: dest_shard.id,
            block,
        };
        if let Err(e) = self.manager.io().move_record(&from, &to, id) {
            // Put the membership back where it was; the index follows.
            dst_guard.remove(id, Some(block));
            let reblock = src_guard.insert(id, stamp);
            let mut home = from;
            home.block = reblock;
            self.manager.lookup().set_location(id, home, next_epoch());
            return Err(e);
        }
        self.manager.lookup().set_location(id, to, next_epoch());
        source_store.sub_record();
        dest_store.add_record();
        self.manager.set_group(id, to_group);
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Classification;
    use crate::config::StrataConfig;
    use crate::lookup::LookupRegistry;
    use crate::record::schema::SchemaRegistry;
    use crate::record::{AttrValue, ImportanceAttrs, NounType, SourceDurability};
    use crate::shard::Propagation;
    use crate::storage::MemoryBlockIo;
    use crate::view::{RecordFilter, SortSpec};

    fn setup() -> (Arc<ShardGroupManager>, ShardMigrator) {
        setup_with(StrataConfig::default())
    }

    fn setup_with(cfg: StrataConfig) -> (Arc<ShardGroupManager>, ShardMigrator) {
        let mgr = Arc::new(ShardGroupManager::new(
            cfg,
            Arc::new(LookupRegistry::new()),
            Arc::new(SchemaRegistry::builtin()),
            Arc::new(MemoryBlockIo::new()),
        ));
        let migrator = ShardMigrator::new(mgr.clone());
        (mgr, migrator)
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

    fn in_group(group: ShardGroup) -> Classification {
        let propagation = match group {
            ShardGroup::Speculative => Propagation::Firewall,
            _ => Propagation::Normal,
        };
        Classification { group, propagation }
    }

    #[test]
    fn test_migrate_record_between_groups() {
        let (mgr, migrator) = setup();
        let r = message(10);
        let id = r.id;
        let old = mgr.allocate(r, in_group(ShardGroup::Speculative)).unwrap();

        let fresh = migrator.migrate_record(id, ShardGroup::HighValue).unwrap();
        assert_eq!(fresh.location.group, ShardGroup::HighValue);
        assert_eq!(mgr.group_record_count(ShardGroup::Speculative), 0);
        assert_eq!(mgr.group_record_count(ShardGroup::HighValue), 1);

        // The pre-migration ticket is now stale; a fresh locate works.
        assert!(matches!(mgr.resolve(&old), Err(StrataError::StaleLocation(_))));
        assert_eq!(mgr.locate(id).unwrap().location.group, ShardGroup::HighValue);
        assert_eq!(mgr.classification(id).unwrap().group, ShardGroup::HighValue);
    }

    #[test]
    fn test_migrate_record_same_group_is_noop() {
        let (mgr, migrator) = setup();
        let r = message(1);
        let id = r.id;
        let ticket = mgr.allocate(r, in_group(ShardGroup::LowValue)).unwrap();
        let again = migrator.migrate_record(id, ShardGroup::LowValue).unwrap();
        assert_eq!(again.location, ticket.location);
        assert_eq!(again.epoch, ticket.epoch);
    }

    #[test]
    fn test_migration_conserves_slice_counts() {
        let (mgr, migrator) = setup();
        let everything = mgr.attach_slice(RecordFilter::any(), SortSpec::StampAscending);
        let high = mgr.attach_slice(RecordFilter::group(ShardGroup::HighValue), SortSpec::StampAscending);
        let spec = mgr.attach_slice(RecordFilter::group(ShardGroup::Speculative), SortSpec::StampAscending);

        let r = message(5);
        let id = r.id;
        mgr.allocate(r, in_group(ShardGroup::Speculative)).unwrap();
        assert_eq!((everything.lock().len(), high.lock().len(), spec.lock().len()), (1, 0, 1));

        migrator.migrate_record(id, ShardGroup::HighValue).unwrap();
        // Source observer: one remove. Destination observer: one add.
        // Observer of both: no structural change.
        assert_eq!((everything.lock().len(), high.lock().len(), spec.lock().len()), (1, 1, 0));
    }

    #[test]
    fn test_migrate_shard_requires_sealed_source() {
        let (mgr, migrator) = setup();
        mgr.allocate(message(1), in_group(ShardGroup::LowValue)).unwrap();
        let store = mgr.stores(ShardGroup::LowValue)[0].clone();
        let shard = store.primary_shard();
        assert!(matches!(
            migrator.migrate_shard(ShardGroup::LowValue, store.id, shard.id, ShardGroup::HighValue),
            Err(StrataError::StoreNotSealed(_))
        ));
    }

    #[test]
    fn test_migrate_shard_folds_and_is_idempotent() {
        let (mgr, migrator) = setup();
        for i in 0..3 {
            mgr.allocate(message(i), in_group(ShardGroup::LowValue)).unwrap();
        }
        let sealed = mgr.rotate(ShardGroup::LowValue).unwrap();
        let store = mgr.store_handle(ShardGroup::LowValue, sealed).unwrap();
        let shard = store.primary_shard();

        let report = migrator
            .migrate_shard(ShardGroup::LowValue, sealed, shard.id, ShardGroup::HighValue)
            .unwrap();
        assert_eq!(report, MigrateReport { moved: 3, skipped: 0, remaining: 0 });
        assert_eq!(mgr.group_record_count(ShardGroup::HighValue), 3);
        assert_eq!(store.record_count(), 0);

        // Re-running the fold finds nothing left and changes nothing.
        let again = migrator
            .migrate_shard(ShardGroup::LowValue, sealed, shard.id, ShardGroup::HighValue)
            .unwrap();
        assert_eq!(again, MigrateReport { moved: 0, skipped: 0, remaining: 0 });
        assert_eq!(mgr.group_record_count(ShardGroup::HighValue), 3);
    }

    #[test]
    fn test_migrate_shard_chunked_resumes() {
        use crate::shard::BLOCK_CAPACITY;

        let (mgr, migrator) = setup();
        let total = BLOCK_CAPACITY + 1;
        for i in 0..total {
            mgr.allocate(message(i as i64), in_group(ShardGroup::LowValue)).unwrap();
        }
        let sealed = mgr.rotate(ShardGroup::LowValue).unwrap();
        let store = mgr.store_handle(ShardGroup::LowValue, sealed).unwrap();
        let shard = store.primary_shard();

        // One block per call: the first run leaves the overflow record.
        let first = migrator
            .migrate_shard_chunked(ShardGroup::LowValue, sealed, shard.id, ShardGroup::HighValue, 1)
            .unwrap();
        assert_eq!(first.moved, BLOCK_CAPACITY);
        assert_eq!(first.remaining, 1);

        let second = migrator
            .migrate_shard_chunked(ShardGroup::LowValue, sealed, shard.id, ShardGroup::HighValue, 1)
            .unwrap();
        assert_eq!(second.moved, 1);
        assert_eq!(second.remaining, 0);
        assert_eq!(mgr.group_record_count(ShardGroup::HighValue), total);
    }

    #[test]
    fn test_prune_rescues_starred_and_abandons_rest() {
        let (mgr, migrator) = setup();
        let mut a = message(1);
        a.set_raw("starred", AttrValue::Bool(true));
        let (ida, b) = (a.id, message(2));
        let idb = b.id;
        mgr.allocate(a, in_group(ShardGroup::Speculative)).unwrap();
        mgr.allocate(b, in_group(ShardGroup::Speculative)).unwrap();

        let sealed = mgr.rotate(ShardGroup::Speculative).unwrap();
        mgr.mark_rescue_and_destroy(sealed).unwrap();

        let starred = |r: &Record| matches!(r.raw.get("starred"), Some(AttrValue::Bool(true)));
        let report = migrator
            .prune_speculative(ShardGroup::HighValue, &starred, None)
            .unwrap();
        assert_eq!(report, PruneReport { rescued: 1, abandoned: 1, completed: true });

        // A survives in the durable group; B is gone for good.
        assert_eq!(mgr.locate(ida).unwrap().location.group, ShardGroup::HighValue);
        assert!(matches!(mgr.locate(idb), Err(StrataError::RecordNotFound(_))));
        let store = mgr.store_handle(ShardGroup::Speculative, sealed).unwrap();
        assert_eq!(store.status(), StoreStatus::Destroyed);
    }

    #[test]
    fn test_prune_budget_resumes_without_losing_records() {
        use crate::shard::BLOCK_CAPACITY;

        let (mgr, migrator) = setup();
        for i in 0..BLOCK_CAPACITY {
            mgr.allocate(message(i as i64), in_group(ShardGroup::Speculative)).unwrap();
        }
        // The overflow record lands in block 1 and is worth keeping.
        let mut keeper = message(9999);
        keeper.set_raw("starred", AttrValue::Bool(true));
        let kid = keeper.id;
        mgr.allocate(keeper, in_group(ShardGroup::Speculative)).unwrap();

        let sealed = mgr.rotate(ShardGroup::Speculative).unwrap();
        mgr.mark_rescue_and_destroy(sealed).unwrap();
        let starred = |r: &Record| matches!(r.raw.get("starred"), Some(AttrValue::Bool(true)));

        // One block of budget: the run stops with the store intact and the
        // untouched remainder still resident.
        let first = migrator
            .prune_speculative(ShardGroup::HighValue, &starred, Some(1))
            .unwrap();
        assert_eq!(
            first,
            PruneReport { rescued: 0, abandoned: BLOCK_CAPACITY, completed: false }
        );
        let store = mgr.store_handle(ShardGroup::Speculative, sealed).unwrap();
        assert_eq!(store.status(), StoreStatus::RescueAndDestroy);
        assert!(mgr.locate(kid).is_ok());

        // The next run drains the remainder and destroys the store even
        // though it spends its whole budget doing so.
        let second = migrator
            .prune_speculative(ShardGroup::HighValue, &starred, Some(1))
            .unwrap();
        assert_eq!(second, PruneReport { rescued: 1, abandoned: 0, completed: true });
        assert_eq!(mgr.locate(kid).unwrap().location.group, ShardGroup::HighValue);
        assert_eq!(
            mgr.store_handle(ShardGroup::Speculative, sealed).unwrap().status(),
            StoreStatus::Destroyed
        );
    }

    #[test]
    fn test_migrate_carries_current_sort_stamp() {
        let (mgr, migrator) = setup();
        let anchor = message(20);
        let aid = anchor.id;
        mgr.allocate(anchor, in_group(ShardGroup::HighValue)).unwrap();
        let r = message(10);
        let id = r.id;
        mgr.allocate(r, in_group(ShardGroup::Speculative)).unwrap();

        let high = mgr.attach_slice(
            RecordFilter::group(ShardGroup::HighValue),
            SortSpec::StampAscending,
        );
        // The stamp changes before the migration lands; the destination
        // slice must sort by the current stamp, not a stale snapshot.
        mgr.resort_record(id, 30).unwrap();
        migrator.migrate_record(id, ShardGroup::HighValue).unwrap();
        assert_eq!(high.lock().ids(), vec![aid, id]);
    }

    #[test]
    fn test_prune_requires_rescue_store() {
        let (_mgr, migrator) = setup();
        let keep_none = |_: &Record| false;
        assert!(matches!(
            migrator.prune_speculative(ShardGroup::LowValue, &keep_none, None),
            Err(StrataError::PruneSourceMissing)
        ));
    }

    #[test]
    fn test_prune_destination_must_be_durable() {
        let (_mgr, migrator) = setup();
        let keep_all = |_: &Record| true;
        assert!(matches!(
            migrator.prune_speculative(ShardGroup::Speculative, &keep_all, None),
            Err(StrataError::PruneDestinationInvalid(ShardGroup::Speculative))
        ));
    }
}
