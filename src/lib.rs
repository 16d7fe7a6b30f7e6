//! StrataBase Storage Placement Engine
//!
//! A sharded, value-tiered placement engine for a personal knowledge store
//! (messages, contacts, identities) that grows without bound and must serve
//! both fast point lookups and UI-friendly windowed browsing.
//!
//! Core pieces:
//! - Importance classification: maps a record's importance attributes to a
//!   target shard group and a propagation mode.
//! - Shard groups / stores / blocks: value-tiered physical placement with
//!   rotate-before-insert store lifecycle.
//! - Shard migration: atomic, resumable relocation of single records or
//!   whole shards between groups.
//! - View slices: live windowed total orderings with splice-style structural
//!   deltas, plus stable-window and clustering decorators for presentation.
//!
//! Content ingestion, the physical persistence engine and UI rendering are
//! external collaborators behind explicit traits.

pub mod classify;
pub mod config;
pub mod lookup;
pub mod record;
pub mod shard;
pub mod storage;
pub mod view;

// Re-export main types
pub use classify::{Classification, ImportanceClassifier, ImportancePolicy, ReclassifyRequest};
pub use config::StrataConfig;
pub use lookup::{LocationTicket, LookupRegistry};
pub use record::schema::{AttrSpec, NounSchema, SchemaRegistry};
pub use record::{AttrValue, ImportanceAttrs, NounType, Record, RecordId, SourceDurability};
pub use shard::group::ShardGroupManager;
pub use shard::migrate::{MigrateReport, PruneReport, ShardMigrator};
pub use shard::{Propagation, RecordLocation, ShardGroup, ShardId, StoreId, BLOCK_CAPACITY};
pub use storage::{BlockIo, MemoryBlockIo};
pub use view::cluster::{Aggregate, ClusteredItem, ClusteringViewSlice};
pub use view::slice::ViewSlice;
pub use view::stable::{ItemState, StableNotice, StableViewSlice, StaleMode};
pub use view::{RecordFilter, SliceDelta, SliceListener, SortSpec};

/// Placement engine error type
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    #[error("store capacity ceiling reached in group {0:?}")]
    CapacityExceeded(ShardGroup),

    #[error("stale location for record {0}: re-locate required")]
    StaleLocation(RecordId),

    #[error("migration conflict on record {0}: retries exhausted")]
    MigrationConflict(RecordId),

    #[error("shard migration interrupted: {moved} moved, {remaining} remaining")]
    PartialMigration { moved: usize, remaining: usize },

    #[error("record {0} not found")]
    RecordNotFound(RecordId),

    #[error("noun type {0} is not registered")]
    NounNotRegistered(NounType),

    #[error("schema violation for noun {noun}: {detail}")]
    SchemaViolation { noun: NounType, detail: String },

    #[error("lookup namespace {namespace:?} is not registered for noun {noun}")]
    NamespaceNotFound { noun: NounType, namespace: String },

    #[error("store {0} is not open for inserts")]
    StoreSealed(StoreId),

    #[error("store {0} not found")]
    StoreNotFound(StoreId),

    #[error("store {0} must seal before fold or rescue")]
    StoreNotSealed(StoreId),

    #[error("no open store in group {0:?}")]
    NoOpenStore(ShardGroup),

    #[error("shard {0} not found")]
    ShardNotFound(ShardId),

    #[error("prune requires a rescue-and-destroy store in the speculative group")]
    PruneSourceMissing,

    #[error("prune destination group {0:?} must be non-speculative")]
    PruneDestinationInvalid(ShardGroup),

    #[error("provisional id {0} has no pending entry")]
    ProvisionalNotFound(u64),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, StrataError>;
