//! End-to-end placement scenarios across the public API

use std::sync::Arc;

use parking_lot::Mutex;

use stratabase::lookup::provisional::ProvisionalArena;
use stratabase::view::{RecordFetch, SharedListener};
use stratabase::{
    AttrValue, ClusteredItem, ClusteringViewSlice, ImportanceAttrs, ImportanceClassifier,
    ItemState, LookupRegistry, MemoryBlockIo, NounType, Propagation, Record, RecordFilter,
    SchemaRegistry, ShardGroup, ShardGroupManager, ShardMigrator, SortSpec, SourceDurability,
    StableViewSlice, StaleMode, StrataConfig, StrataError,
};

fn engine() -> (Arc<ShardGroupManager>, ShardMigrator, Arc<LookupRegistry>) {
    let lookup = Arc::new(LookupRegistry::new());
    let mgr = Arc::new(ShardGroupManager::new(
        StrataConfig::default(),
        lookup.clone(),
        Arc::new(SchemaRegistry::builtin()),
        Arc::new(MemoryBlockIo::new()),
    ));
    let migrator = ShardMigrator::new(mgr.clone());
    (mgr, migrator, lookup)
}

fn message(stamp: i64, attrs: ImportanceAttrs) -> Record {
    let mut r = Record::new(NounType::MESSAGE, stamp, attrs);
    r.set_raw("subject", AttrValue::Str(format!("msg at {}", stamp)));
    r
}

fn plain(stamp: i64) -> Record {
    message(stamp, ImportanceAttrs::durable(SourceDurability::AccessibleCheap))
}

#[test]
fn classify_allocate_locate_fetch() {
    let (mgr, _, _) = engine();
    let classifier = ImportanceClassifier::default();

    let mut attrs = ImportanceAttrs::durable(SourceDurability::Definitive);
    attrs.high_interest = true;
    let record = message(100, attrs.clone());
    let id = record.id;

    let classification = classifier.classify(&attrs, Propagation::Normal);
    assert_eq!(classification.group, ShardGroup::HighValue);

    let ticket = mgr.allocate(record, classification).unwrap();
    assert_eq!(ticket.location.group, ShardGroup::HighValue);
    assert_eq!(mgr.locate(id).unwrap().location, ticket.location);

    let body = mgr.fetch(id).unwrap();
    assert_eq!(body.raw.get("subject"), Some(&AttrValue::Str("msg at 100".into())));
}

#[test]
fn migration_is_conservative_across_observers() {
    let (mgr, migrator, _) = engine();
    let classifier = ImportanceClassifier::default();

    let everything = mgr.attach_slice(RecordFilter::any(), SortSpec::StampAscending);
    let high = mgr.attach_slice(RecordFilter::group(ShardGroup::HighValue), SortSpec::StampAscending);
    let spec = mgr.attach_slice(RecordFilter::group(ShardGroup::Speculative), SortSpec::StampAscending);

    let attrs = ImportanceAttrs::exploratory(SourceDurability::AccessibleCheap);
    let record = message(7, attrs.clone());
    let id = record.id;
    let c = classifier.classify(&attrs, Propagation::Normal);
    assert_eq!(c.group, ShardGroup::Speculative);
    let old = mgr.allocate(record, c).unwrap();

    // The user stars it: reclassify and act on the request.
    migrator.migrate_record(id, ShardGroup::HighValue).unwrap();

    // Total membership never changed; it moved between group observers.
    assert_eq!(everything.lock().len(), 1);
    assert_eq!(high.lock().ids(), vec![id]);
    assert_eq!(spec.lock().len(), 0);

    // The pre-move ticket is stale; re-locating recovers.
    assert!(matches!(mgr.resolve(&old), Err(StrataError::StaleLocation(_))));
    assert_eq!(mgr.locate(id).unwrap().location.group, ShardGroup::HighValue);
}

#[test]
fn sealed_store_folds_into_catchall() {
    let (mgr, migrator, _) = engine();
    let classifier = ImportanceClassifier::default();
    let c = classifier.classify(
        &ImportanceAttrs::durable(SourceDurability::External),
        Propagation::Normal,
    );
    assert_eq!(c.group, ShardGroup::LowValue);

    for i in 0..10 {
        mgr.allocate(plain(i), c).unwrap();
    }
    let sealed = mgr.rotate(ShardGroup::LowValue).unwrap();
    let shard_id = mgr
        .stores(ShardGroup::LowValue)
        .iter()
        .find(|s| s.id == sealed)
        .map(|s| s.primary_shard().id)
        .unwrap();

    let report = migrator
        .migrate_shard(ShardGroup::LowValue, sealed, shard_id, ShardGroup::HighValue)
        .unwrap();
    assert_eq!((report.moved, report.remaining), (10, 0));

    // Idempotent: nothing left to fold, counts unchanged.
    let again = migrator
        .migrate_shard(ShardGroup::LowValue, sealed, shard_id, ShardGroup::HighValue)
        .unwrap();
    assert_eq!((again.moved, again.remaining), (0, 0));
    assert_eq!(mgr.group_record_count(ShardGroup::HighValue), 10);
    assert_eq!(mgr.group_record_count(ShardGroup::LowValue), 0);
}

#[test]
fn stable_window_survives_removal_until_reconcile() {
    let (mgr, _, _) = engine();
    let slice = mgr.attach_slice(RecordFilter::any(), SortSpec::StampAscending);

    let records: Vec<Record> = (1..=5).map(plain).collect();
    let ids: Vec<_> = records.iter().map(|r| r.id).collect();
    let c = ImportanceClassifier::default().classify(
        &ImportanceAttrs::durable(SourceDurability::AccessibleCheap),
        Propagation::Normal,
    );
    for r in records {
        mgr.allocate(r, c).unwrap();
    }

    // User is looking at positions 1..4 of the ascending order.
    let stable = Arc::new(Mutex::new(StableViewSlice::new(
        &slice.lock().ids(),
        1,
        3,
        StaleMode::Suppress,
    )));
    slice.lock().set_listener(Box::new(SharedListener(stable.clone())));

    // The middle visible record is deleted out from under the view.
    mgr.remove_record(ids[2]).unwrap();
    {
        let s = stable.lock();
        assert_eq!(s.state_of(ids[2]), Some(ItemState::Suppressed));
        // Still enumerable at its position; nothing shifted silently.
        let window: Vec<_> = s.items().iter().map(|i| i.id).collect();
        assert_eq!(window, vec![ids[1], ids[2], ids[3]]);
    }

    let cleared = stable.lock().reconcile();
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].id, ids[2]);
}

#[test]
fn clustering_collapses_conversation_runs() {
    let (mgr, _, _) = engine();
    let slice = mgr.attach_slice(RecordFilter::any(), SortSpec::StampAscending);

    // Three messages of the same conversation.
    let mut records: Vec<Record> = (1..=3).map(plain).collect();
    let ids: Vec<_> = records.iter().map(|r| r.id).collect();
    let conversation: ahash::AHashMap<u64, u64> = ids.iter().map(|&id| (id, 1)).collect();

    let c = ImportanceClassifier::default().classify(
        &ImportanceAttrs::durable(SourceDurability::AccessibleCheap),
        Propagation::Normal,
    );
    let third = records.pop().unwrap();
    for r in records {
        mgr.allocate(r, c).unwrap();
    }

    let clustering = Arc::new(Mutex::new(ClusteringViewSlice::new(
        &slice.lock().ids(),
        3,
        Box::new(move |id| conversation.get(&id).copied().unwrap_or(0)),
        ClusteringViewSlice::count_reducer(),
    )));
    slice.lock().set_listener(Box::new(SharedListener(clustering.clone())));

    // Two same-conversation messages: below threshold, shown singly.
    assert_eq!(clustering.lock().items().len(), 2);

    // Third arrives live; the run crosses the threshold and collapses.
    mgr.allocate(third, c).unwrap();
    let items = clustering.lock().items();
    assert_eq!(items.len(), 1);
    match &items[0] {
        ClusteredItem::Cluster(agg) => {
            assert_eq!(agg.members, vec![ids[0], ids[1], ids[2]]);
            assert_eq!(agg.label, "3 items");
        }
        other => panic!("expected a cluster, got {:?}", other),
    }
}

#[test]
fn prune_rescues_starred_and_destroys_store() {
    let (mgr, migrator, _) = engine();
    let spec_slice = mgr.attach_slice(RecordFilter::group(ShardGroup::Speculative), SortSpec::StampAscending);
    let high_slice = mgr.attach_slice(RecordFilter::group(ShardGroup::HighValue), SortSpec::StampAscending);

    let attrs = ImportanceAttrs::exploratory(SourceDurability::AccessibleCheap);
    let c = ImportanceClassifier::default().classify(&attrs, Propagation::Normal);

    let mut starred = message(1, attrs.clone());
    starred.set_raw("starred", AttrValue::Bool(true));
    let ida = starred.id;
    let boring = message(2, attrs);
    let idb = boring.id;
    mgr.allocate(starred, c).unwrap();
    mgr.allocate(boring, c).unwrap();
    assert_eq!(spec_slice.lock().len(), 2);

    let sealed = mgr.rotate(ShardGroup::Speculative).unwrap();
    mgr.mark_rescue_and_destroy(sealed).unwrap();

    let keep = |r: &Record| matches!(r.raw.get("starred"), Some(AttrValue::Bool(true)));
    let report = migrator.prune_speculative(ShardGroup::HighValue, &keep, None).unwrap();
    assert_eq!((report.rescued, report.abandoned, report.completed), (1, 1, true));

    // Observers saw the rescue as a move and the abandonment as a removal.
    assert_eq!(spec_slice.lock().len(), 0);
    assert_eq!(high_slice.lock().ids(), vec![ida]);

    assert_eq!(mgr.locate(ida).unwrap().location.group, ShardGroup::HighValue);
    assert!(matches!(mgr.locate(idb), Err(StrataError::RecordNotFound(_))));
    assert!(mgr.fetch(ida).is_ok());
}

#[test]
fn forward_references_bind_on_materialize() {
    let (mgr, _, lookup) = engine();
    let arena = ProvisionalArena::new();
    lookup.register_namespace(NounType::CONVERSATION, "thread-key");

    // Messages arrive before their conversation exists.
    let pid = arena.reserve();
    arena.link(pid, NounType::CONVERSATION, "thread-key", "deadbeef").unwrap();

    let conversation = Record::new(
        NounType::CONVERSATION,
        50,
        ImportanceAttrs::durable(SourceDurability::Definitive),
    );
    let cid = conversation.id;
    let c = ImportanceClassifier::default().classify(
        &ImportanceAttrs::durable(SourceDurability::Definitive),
        Propagation::Normal,
    );
    mgr.allocate(conversation, c).unwrap();

    let bound = arena.materialize(pid, cid, &lookup).unwrap();
    assert_eq!(bound, 1);
    assert_eq!(lookup.lookup(NounType::CONVERSATION, "thread-key", "deadbeef"), Some(cid));
    // The binding resolves to a locatable record.
    assert!(mgr.locate(cid).is_ok());
}

#[test]
fn resort_moves_in_one_delta() {
    let (mgr, _, _) = engine();
    let slice = mgr.attach_slice(RecordFilter::any(), SortSpec::StampAscending);

    let c = ImportanceClassifier::default().classify(
        &ImportanceAttrs::durable(SourceDurability::AccessibleCheap),
        Propagation::Normal,
    );
    let records: Vec<Record> = (1..=3).map(plain).collect();
    let ids: Vec<_> = records.iter().map(|r| r.id).collect();
    for r in records {
        mgr.allocate(r, c).unwrap();
    }

    let shadow = Arc::new(Mutex::new(stratabase::view::ShadowArray::default()));
    {
        let mut locked = slice.lock();
        shadow.lock().items = locked.ids();
        locked.set_listener(Box::new(SharedListener(shadow.clone())));
    }

    mgr.resort_record(ids[0], 99).unwrap();
    assert_eq!(slice.lock().ids(), vec![ids[1], ids[2], ids[0]]);
    // The replayed shadow matches: the move was one delta, not two.
    assert_eq!(shadow.lock().items, vec![ids[1], ids[2], ids[0]]);
}
