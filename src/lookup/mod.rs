//! Lookup registry - keyed namespaces and the record location index
//!
//! A lookup namespace maps arbitrary string keys to record ids and is
//! explicitly associated with a noun type (e-mail address -> identity,
//! message-id header -> message, ...). The registry is built at startup and
//! passed by `Arc` into every core operation; nothing consults it implicitly.
//!
//! The location index is the O(1) path behind `locate()`: the placement
//! engine never scans stores to find a record. Migrations update the index
//! inside the migration lock, before release, so no reader ever resolves a
//! stale location without being told so.

pub mod provisional;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::record::{NounType, RecordId};
use crate::shard::RecordLocation;
use crate::{Result, StrataError};

/// A located record plus the move epoch it was observed at
///
/// Holding a ticket across a migration is detected by `resolve`: if the
/// record has moved since, the ticket is stale and the caller must
/// re-`locate()`.
#[derive(Debug, Clone, Copy)]
pub struct LocationTicket {
    pub record: RecordId,
    pub location: RecordLocation,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy)]
struct LocationEntry {
    location: RecordLocation,
    epoch: u64,
}

/// Keyed lookup namespaces plus the record location index
pub struct LookupRegistry {
    namespaces: RwLock<AHashMap<(NounType, String), AHashMap<String, RecordId>>>,
    locations: RwLock<AHashMap<RecordId, LocationEntry>>,
}

impl LookupRegistry {
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(AHashMap::new()),
            locations: RwLock::new(AHashMap::new()),
        }
    }

    // ========================================================================
    // Keyed namespaces
    // ========================================================================

    /// Register a namespace for a noun type; idempotent
    pub fn register_namespace(&self, noun: NounType, name: &str) {
        self.namespaces
            .write()
            .entry((noun, name.to_string()))
            .or_default();
    }

    /// Bind a key to a record id within a namespace
    pub fn bind(&self, noun: NounType, namespace: &str, key: &str, id: RecordId) -> Result<()> {
        let mut namespaces = self.namespaces.write();
        let ns = namespaces
            .get_mut(&(noun, namespace.to_string()))
            .ok_or_else(|| StrataError::NamespaceNotFound {
                noun,
                namespace: namespace.to_string(),
            })?;
        ns.insert(key.to_string(), id);
        Ok(())
    }

    /// Resolve a key within a namespace
    pub fn lookup(&self, noun: NounType, namespace: &str, key: &str) -> Option<RecordId> {
        self.namespaces
            .read()
            .get(&(noun, namespace.to_string()))
            .and_then(|ns| ns.get(key).copied())
    }

    // ========================================================================
    // Location index
    // ========================================================================

    /// Record a placement; called inside the placement/migration lock
    pub(crate) fn set_location(&self, id: RecordId, location: RecordLocation, epoch: u64) {
        self.locations
            .write()
            .insert(id, LocationEntry { location, epoch });
    }

    /// Forget a record entirely (deletion or accepted abandonment)
    pub(crate) fn clear_location(&self, id: RecordId) {
        self.locations.write().remove(&id);
    }

    /// Current location of a record, freshly read
    pub fn locate(&self, id: RecordId) -> Result<LocationTicket> {
        let locations = self.locations.read();
        let entry = locations.get(&id).ok_or(StrataError::RecordNotFound(id))?;
        Ok(LocationTicket { record: id, location: entry.location, epoch: entry.epoch })
    }

    /// Re-validate a previously obtained ticket
    ///
    /// Returns the current location if the record has not moved since the
    /// ticket was issued; `StaleLocation` if it has.
    pub fn resolve(&self, ticket: &LocationTicket) -> Result<RecordLocation> {
        let locations = self.locations.read();
        let entry = locations
            .get(&ticket.record)
            .ok_or(StrataError::RecordNotFound(ticket.record))?;
        if entry.epoch != ticket.epoch {
            return Err(StrataError::StaleLocation(ticket.record));
        }
        Ok(entry.location)
    }

    /// Whether the record is currently placed anywhere
    pub fn is_placed(&self, id: RecordId) -> bool {
        self.locations.read().contains_key(&id)
    }
}

impl Default for LookupRegistry {
    fn default() -> Self {
        Self::new()
    }
}
