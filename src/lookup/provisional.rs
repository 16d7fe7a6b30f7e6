//! Two-phase forward references
//!
//! Ingestion regularly needs to link records to owners that do not exist yet
//! (messages arriving before their conversation record is created). Rather
//! than dangling references, callers reserve a provisional logical id,
//! queue the namespace links that should point at the eventual record, and
//! bind them all in one step once the owner materializes.

use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;

use super::LookupRegistry;
use crate::record::{NounType, RecordId};
use crate::{Result, StrataError};

/// A logical id for a record that has not been created yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProvisionalId(pub u64);

/// A namespace binding waiting for its target to materialize
#[derive(Debug, Clone)]
struct PendingLink {
    noun: NounType,
    namespace: String,
    key: String,
}

/// Arena of provisional ids and their queued links
pub struct ProvisionalArena {
    next: AtomicU64,
    pending: Mutex<AHashMap<ProvisionalId, Vec<PendingLink>>>,
}

impl ProvisionalArena {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1), pending: Mutex::new(AHashMap::new()) }
    }

    /// Reserve a provisional id for a not-yet-created record
    pub fn reserve(&self) -> ProvisionalId {
        let id = ProvisionalId(self.next.fetch_add(1, Ordering::SeqCst));
        self.pending.lock().insert(id, Vec::new());
        id
    }

    /// Queue a namespace link to be bound when the owner materializes
    pub fn link(&self, id: ProvisionalId, noun: NounType, namespace: &str, key: &str) -> Result<()> {
        let mut pending = self.pending.lock();
        let links = pending.get_mut(&id).ok_or(StrataError::ProvisionalNotFound(id.0))?;
        links.push(PendingLink {
            noun,
            namespace: namespace.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    /// Queued link count for a provisional id
    pub fn pending_links(&self, id: ProvisionalId) -> usize {
        self.pending.lock().get(&id).map(|l| l.len()).unwrap_or(0)
    }

    /// Bind every queued link to the materialized record in one step
    ///
    /// The arena entry is consumed while the pending lock is held, so a
    /// concurrent materialize of the same id cannot double-bind.
    pub fn materialize(
        &self,
        id: ProvisionalId,
        record: RecordId,
        registry: &LookupRegistry,
    ) -> Result<usize> {
        let links = {
            let mut pending = self.pending.lock();
            pending.remove(&id).ok_or(StrataError::ProvisionalNotFound(id.0))?
        };
        let count = links.len();
        for link in links {
            registry.bind(link.noun, &link.namespace, &link.key, record)?;
        }
        Ok(count)
    }
}

impl Default for ProvisionalArena {
    fn default() -> Self {
        Self::new()
    }
}
