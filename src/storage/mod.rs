//! Physical store collaborator
//!
//! One physical unit backs each shard store. The placement engine only
//! issues record-level read/write/move requests plus store destruction and a
//! compaction trigger; file formats, table layout and actual compaction are
//! implemented externally behind `BlockIo`. The in-memory implementation
//! backs tests and small deployments.

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::record::{Record, RecordId};
use crate::shard::{RecordLocation, StoreId};
use crate::{Result, StrataError};

/// Record-level interface to the physical persistence engine
pub trait BlockIo: Send + Sync {
    /// Persist a record at its assigned location
    fn write_record(&self, loc: &RecordLocation, record: &Record) -> Result<()>;

    /// Fetch a record body from its location
    fn read_record(&self, loc: &RecordLocation, id: RecordId) -> Result<Record>;

    /// Relocate a record's body between stores
    fn move_record(&self, from: &RecordLocation, to: &RecordLocation, id: RecordId) -> Result<()>;

    /// Delete a record's body
    fn delete_record(&self, loc: &RecordLocation, id: RecordId) -> Result<()>;

    /// Drop a whole physical store; residents are gone
    fn destroy_store(&self, store: StoreId) -> Result<()>;

    /// Ask the engine to compact a store when convenient
    fn compact_store(&self, store: StoreId) -> Result<()>;
}

/// In-memory physical store, one record map per shard store
pub struct MemoryBlockIo {
    stores: RwLock<AHashMap<StoreId, AHashMap<RecordId, Record>>>,
}

impl MemoryBlockIo {
    pub fn new() -> Self {
        Self { stores: RwLock::new(AHashMap::new()) }
    }

    /// Resident record count in one store
    pub fn store_len(&self, store: StoreId) -> usize {
        self.stores.read().get(&store).map(|m| m.len()).unwrap_or(0)
    }
}

impl Default for MemoryBlockIo {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockIo for MemoryBlockIo {
    fn write_record(&self, loc: &RecordLocation, record: &Record) -> Result<()> {
        self.stores
            .write()
            .entry(loc.store)
            .or_default()
            .insert(record.id, record.clone());
        Ok(())
    }

    fn read_record(&self, loc: &RecordLocation, id: RecordId) -> Result<Record> {
        self.stores
            .read()
            .get(&loc.store)
            .and_then(|m| m.get(&id))
            .cloned()
            .ok_or(StrataError::RecordNotFound(id))
    }

    fn move_record(&self, from: &RecordLocation, to: &RecordLocation, id: RecordId) -> Result<()> {
        let mut stores = self.stores.write();
        let record = stores
            .get_mut(&from.store)
            .and_then(|m| m.remove(&id))
            .ok_or(StrataError::RecordNotFound(id))?;
        stores.entry(to.store).or_default().insert(id, record);
        Ok(())
    }

    fn delete_record(&self, loc: &RecordLocation, id: RecordId) -> Result<()> {
        self.stores
            .write()
            .get_mut(&loc.store)
            .and_then(|m| m.remove(&id))
            .map(|_| ())
            .ok_or(StrataError::RecordNotFound(id))
    }

    fn destroy_store(&self, store: StoreId) -> Result<()> {
        self.stores.write().remove(&store);
        Ok(())
    }

    fn compact_store(&self, _store: StoreId) -> Result<()> {
        // Nothing to compact in memory.
        Ok(())
    }
}
