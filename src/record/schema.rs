//! Versioned per-noun-type schema registry
//!
//! Because the record schema is defined by whatever extensions are loaded,
//! every noun type carries an explicit, versioned attribute schema. The
//! registry is built at startup, handed around by `Arc`, and records are
//! stamped with the revision they validated against so a later pass can tell
//! which stores a configuration change affects.

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{AttrType, NounType, Record};
use crate::{Result, StrataError};

/// Declaration of one named attribute on a noun type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttrSpec {
    pub name: String,
    pub ty: AttrType,
    pub required: bool,
}

impl AttrSpec {
    pub fn required(name: &str, ty: AttrType) -> Self {
        Self { name: name.to_string(), ty, required: true }
    }

    pub fn optional(name: &str, ty: AttrType) -> Self {
        Self { name: name.to_string(), ty, required: false }
    }
}

/// Schema for one noun type at one revision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NounSchema {
    pub noun: NounType,
    pub name: String,
    pub revision: u32,
    /// Raw-column attribute declarations
    pub raw: Vec<AttrSpec>,
    /// Derived-column attribute declarations
    pub derived: Vec<AttrSpec>,
}

impl NounSchema {
    fn check(&self, columns: &AHashMap<String, super::AttrValue>, specs: &[AttrSpec], noun: NounType) -> Result<()> {
        for spec in specs {
            match columns.get(&spec.name) {
                Some(v) if v.type_of() != spec.ty => {
                    return Err(StrataError::SchemaViolation {
                        noun,
                        detail: format!(
                            "attribute {:?} expects {:?}, got {:?}",
                            spec.name,
                            spec.ty,
                            v.type_of()
                        ),
                    });
                }
                None if spec.required => {
                    return Err(StrataError::SchemaViolation {
                        noun,
                        detail: format!("missing required attribute {:?}", spec.name),
                    });
                }
                _ => {}
            }
        }
        for name in columns.keys() {
            if !specs.iter().any(|s| &s.name == name) {
                return Err(StrataError::SchemaViolation {
                    noun,
                    detail: format!("unknown attribute {:?}", name),
                });
            }
        }
        Ok(())
    }
}

/// Registry of noun-type schemas, keyed by noun, versioned per registration
pub struct SchemaRegistry {
    schemas: RwLock<AHashMap<NounType, NounSchema>>,
}

impl SchemaRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self { schemas: RwLock::new(AHashMap::new()) }
    }

    /// Registry pre-loaded with the built-in messaging nouns
    pub fn builtin() -> Self {
        let reg = Self::new();
        reg.register(
            NounType::MESSAGE,
            "message",
            vec![
                AttrSpec::required("subject", AttrType::Str),
                AttrSpec::optional("body", AttrType::Str),
                AttrSpec::optional("author", AttrType::Id),
                AttrSpec::optional("conversation", AttrType::Id),
                AttrSpec::optional("received", AttrType::Stamp),
                AttrSpec::optional("starred", AttrType::Bool),
            ],
            vec![
                AttrSpec::optional("lang", AttrType::Str),
                AttrSpec::optional("topic_score", AttrType::Float),
            ],
        );
        reg.register(
            NounType::CONTACT,
            "contact",
            vec![
                AttrSpec::required("name", AttrType::Str),
                AttrSpec::optional("identities", AttrType::IdList),
            ],
            vec![AttrSpec::optional("popularity", AttrType::Int)],
        );
        reg.register(
            NounType::IDENTITY,
            "identity",
            vec![
                AttrSpec::required("kind", AttrType::Str),
                AttrSpec::required("value", AttrType::Str),
                AttrSpec::optional("contact", AttrType::Id),
            ],
            vec![],
        );
        reg.register(
            NounType::CONVERSATION,
            "conversation",
            vec![
                AttrSpec::optional("subject", AttrType::Str),
                AttrSpec::optional("messages", AttrType::IdList),
            ],
            vec![],
        );
        reg
    }

    /// Register or upgrade a noun schema; each registration bumps the revision
    pub fn register(&self, noun: NounType, name: &str, raw: Vec<AttrSpec>, derived: Vec<AttrSpec>) -> u32 {
        let mut schemas = self.schemas.write();
        let revision = schemas.get(&noun).map(|s| s.revision + 1).unwrap_or(1);
        schemas.insert(
            noun,
            NounSchema { noun, name: name.to_string(), revision, raw, derived },
        );
        revision
    }

    /// Current revision for a noun, if registered
    pub fn revision(&self, noun: NounType) -> Option<u32> {
        self.schemas.read().get(&noun).map(|s| s.revision)
    }

    /// Registered display name for a noun, if any
    pub fn name(&self, noun: NounType) -> Option<String> {
        self.schemas.read().get(&noun).map(|s| s.name.clone())
    }

    /// Validate a record's columns against its noun schema
    ///
    /// Returns the revision the record validated against; the caller stamps
    /// it onto the record before placement.
    pub fn validate(&self, record: &Record) -> Result<u32> {
        let schemas = self.schemas.read();
        let schema = schemas
            .get(&record.noun)
            .ok_or(StrataError::NounNotRegistered(record.noun))?;
        schema.check(&record.raw, &schema.raw, record.noun)?;
        schema.check(&record.derived, &schema.derived, record.noun)?;
        Ok(schema.revision)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AttrValue, ImportanceAttrs, SourceDurability};

    fn message(subject: &str) -> Record {
        let mut r = Record::new(
            NounType::MESSAGE,
            1000,
            ImportanceAttrs::durable(SourceDurability::AccessibleCheap),
        );
        r.set_raw("subject", AttrValue::Str(subject.to_string()));
        r
    }

    #[test]
    fn test_validate_ok_and_stamps_revision() {
        let reg = SchemaRegistry::builtin();
        let rev = reg.validate(&message("hello")).unwrap();
        assert_eq!(rev, 1);
    }

    #[test]
    fn test_missing_required_attribute() {
        let reg = SchemaRegistry::builtin();
        let r = Record::new(
            NounType::MESSAGE,
            0,
            ImportanceAttrs::durable(SourceDurability::External),
        );
        assert!(matches!(
            reg.validate(&r),
            Err(StrataError::SchemaViolation { .. })
        ));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let reg = SchemaRegistry::builtin();
        let mut r = message("x");
        r.set_raw("starred", AttrValue::Int(1));
        assert!(matches!(
            reg.validate(&r),
            Err(StrataError::SchemaViolation { .. })
        ));
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let reg = SchemaRegistry::builtin();
        let mut r = message("x");
        r.set_raw("no_such_column", AttrValue::Bool(true));
        assert!(matches!(
            reg.validate(&r),
            Err(StrataError::SchemaViolation { .. })
        ));
    }

    #[test]
    fn test_unregistered_noun() {
        let reg = SchemaRegistry::builtin();
        let r = Record::new(
            NounType(999),
            0,
            ImportanceAttrs::durable(SourceDurability::External),
        );
        assert!(matches!(
            reg.validate(&r),
            Err(StrataError::NounNotRegistered(_))
        ));
    }

    #[test]
    fn test_reregistration_bumps_revision() {
        let reg = SchemaRegistry::builtin();
        let rev = reg.register(
            NounType::MESSAGE,
            "message",
            vec![AttrSpec::required("subject", AttrType::Str)],
            vec![],
        );
        assert_eq!(rev, 2);
        assert_eq!(reg.revision(NounType::MESSAGE), Some(2));
    }
}
