//! Record model - dynamic per-noun-type records with importance attributes
//!
//! The schema is deliberately "soft": extensions define noun types and their
//! attributes at startup, so a record is a tagged bag of named typed values
//! validated against the versioned schema registry rather than a fixed struct.
//! Importance attributes capture why a record matters (user action, source
//! durability, derived stability) and drive shard-group placement.

pub mod schema;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

// ============================================================================
// Record ID
// ============================================================================

/// Unique record identifier
pub type RecordId = u64;

/// Global record ID generator
static NEXT_RECORD_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next record id
pub fn next_record_id() -> RecordId {
    NEXT_RECORD_ID.fetch_add(1, Ordering::SeqCst)
}

// ============================================================================
// Noun Type
// ============================================================================

/// Kind tag for a record (message, contact, identity, ...)
///
/// Extensions register additional noun types with the schema registry at
/// startup; the built-in ones have fixed well-known values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NounType(pub u16);

impl NounType {
    pub const MESSAGE: NounType = NounType(1);
    pub const CONTACT: NounType = NounType(2);
    pub const IDENTITY: NounType = NounType(3);
    pub const CONVERSATION: NounType = NounType(4);
}

impl fmt::Display for NounType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "noun#{}", self.0)
    }
}

// ============================================================================
// Importance Attributes
// ============================================================================

/// Whether the user acted on the record directly or we inferred interest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserAction {
    /// Mutating action taken by the user (starring, tagging)
    Explicit,
    /// Inference made by observing the user
    Implicit,
}

/// How durable the record's source copy is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceDurability {
    /// We hold the original copy; losing it loses the data
    Definitive,
    /// Another copy exists but retrieving it needs user interaction
    Inaccessible,
    /// Re-fetchable but costly (scraping, metered, rate-limited)
    AccessibleExpensive,
    /// Re-fetchable cheaply on demand
    AccessibleCheap,
    /// A bolted-on system can reproduce everything it ever provided
    External,
}

/// Stability of derived data under recomputation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stability {
    /// Recomputation yields the same answer
    Stable,
    /// Recomputation may differ (classifier output, corpus-dependent stats)
    Unstable,
}

/// Cost of recomputing derived data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DerivedCost {
    Expensive,
    Cheap,
}

/// Classification of a record's derived columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedClass {
    pub stability: Stability,
    pub cost: DerivedCost,
}

/// The importance-attribute set carried by every record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportanceAttrs {
    /// Direct or inferred user interest, if any
    pub user_action: Option<UserAction>,
    /// Durability class of the record's source
    pub source: SourceDurability,
    /// Stability/cost class of derived columns, if any exist
    pub derived: Option<DerivedClass>,
    /// Judged high-interest by the ingestion context
    pub high_interest: bool,
    /// Produced by an exploratory/unsubscribed ingestion context
    pub exploratory: bool,
}

impl ImportanceAttrs {
    /// Attributes for plain durable data with no interest signal
    pub fn durable(source: SourceDurability) -> Self {
        Self {
            user_action: None,
            source,
            derived: None,
            high_interest: false,
            exploratory: false,
        }
    }

    /// Attributes for data from an exploratory ingestion context
    pub fn exploratory(source: SourceDurability) -> Self {
        Self {
            exploratory: true,
            ..Self::durable(source)
        }
    }
}

// ============================================================================
// Attribute Values
// ============================================================================

/// Type tag for a named record attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrType {
    Bool,
    Int,
    Float,
    Str,
    Id,
    IdList,
    Stamp,
}

/// A dynamically typed attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Reference to another record
    Id(RecordId),
    IdList(Vec<RecordId>),
    /// Millisecond timestamp
    Stamp(i64),
}

impl AttrValue {
    /// The type tag of this value
    pub fn type_of(&self) -> AttrType {
        match self {
            AttrValue::Bool(_) => AttrType::Bool,
            AttrValue::Int(_) => AttrType::Int,
            AttrValue::Float(_) => AttrType::Float,
            AttrValue::Str(_) => AttrType::Str,
            AttrValue::Id(_) => AttrType::Id,
            AttrValue::IdList(_) => AttrType::IdList,
            AttrValue::Stamp(_) => AttrType::Stamp,
        }
    }
}

// ============================================================================
// Record
// ============================================================================

/// A classified, placeable knowledge-store record
///
/// Raw columns hold source data as ingested; derived columns hold computed
/// inputs/outputs that are expensive enough to persist. Both are validated
/// against the noun type's registered schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub noun: NounType,
    /// Primary sort timestamp (millis); preserved across migrations
    pub sort_stamp: i64,
    /// Count of mutations applied to this record over its life
    pub mutation_count: u32,
    /// Schema revision this record was last validated against
    pub schema_revision: u32,
    pub importance: ImportanceAttrs,
    /// Raw source columns
    pub raw: AHashMap<String, AttrValue>,
    /// Derived columns
    pub derived: AHashMap<String, AttrValue>,
}

impl Record {
    /// Create a new record with a freshly allocated id
    pub fn new(noun: NounType, sort_stamp: i64, importance: ImportanceAttrs) -> Self {
        Self {
            id: next_record_id(),
            noun,
            sort_stamp,
            mutation_count: 0,
            schema_revision: 0,
            importance,
            raw: AHashMap::new(),
            derived: AHashMap::new(),
        }
    }

    /// Set a raw column, counting the mutation
    pub fn set_raw(&mut self, name: impl Into<String>, value: AttrValue) {
        self.raw.insert(name.into(), value);
        self.mutation_count += 1;
    }

    /// Set a derived column, counting the mutation
    pub fn set_derived(&mut self, name: impl Into<String>, value: AttrValue) {
        self.derived.insert(name.into(), value);
        self.mutation_count += 1;
    }
}
