//! Importance classification - importance attributes to (group, propagation)
//!
//! The classifier is pure policy: it maps a record's importance attributes
//! and its current propagation context to a target shard group, and emits
//! reclassification requests when attributes or related records change. It
//! never moves data itself; the migrator acts on its requests.

use serde::{Deserialize, Serialize};

use crate::record::{ImportanceAttrs, Record, RecordId, SourceDurability, UserAction};
use crate::shard::{Propagation, ShardGroup};

// ============================================================================
// Policy
// ============================================================================

/// Configurable classification policy
///
/// The rules are deliberately data, not code, so a deployment can tighten or
/// loosen what counts as high value without touching placement logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportancePolicy {
    /// Explicit user action promotes to high value
    pub explicit_action_promotes: bool,
    /// Implicit (inferred) user interest promotes to high value
    pub implicit_action_promotes: bool,
    /// High-interest data from a definitive/inaccessible source is high value
    pub fragile_high_interest_promotes: bool,
    /// Exploratory-context data is firewalled by default
    pub firewall_speculative: bool,
}

impl Default for ImportancePolicy {
    fn default() -> Self {
        Self {
            explicit_action_promotes: true,
            implicit_action_promotes: true,
            fragile_high_interest_promotes: true,
            firewall_speculative: true,
        }
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Classifier output: where a record belongs and how importance may flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub group: ShardGroup,
    pub propagation: Propagation,
}

/// Request to re-place a record; the migrator consumes these
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclassifyRequest {
    pub record: RecordId,
    pub target: Classification,
}

// ============================================================================
// Classifier
// ============================================================================

/// Maps importance attributes to shard placement
pub struct ImportanceClassifier {
    policy: ImportancePolicy,
}

impl ImportanceClassifier {
    pub fn new(policy: ImportancePolicy) -> Self {
        Self { policy }
    }

    /// Classify a record's importance attributes under a propagation context
    ///
    /// Never fails: input with no recognizable signal defaults conservatively
    /// to the low-value group.
    pub fn classify(&self, attrs: &ImportanceAttrs, ctx: Propagation) -> Classification {
        // Exploratory data stays speculative no matter how interesting it
        // looks; only explicit user action rescues it (via reclassify).
        if attrs.exploratory && attrs.user_action != Some(UserAction::Explicit) {
            let propagation = if self.policy.firewall_speculative {
                Propagation::Firewall
            } else {
                ctx
            };
            return Classification { group: ShardGroup::Speculative, propagation };
        }

        let group = if self.is_high_value(attrs) {
            ShardGroup::HighValue
        } else {
            // Durable-but-dull and anything unclassifiable both land here.
            ShardGroup::LowValue
        };
        // An established firewall is sticky; normal context stays normal.
        Classification { group, propagation: ctx }
    }

    fn is_high_value(&self, attrs: &ImportanceAttrs) -> bool {
        match attrs.user_action {
            Some(UserAction::Explicit) if self.policy.explicit_action_promotes => return true,
            Some(UserAction::Implicit) if self.policy.implicit_action_promotes => return true,
            _ => {}
        }
        if self.policy.fragile_high_interest_promotes
            && attrs.high_interest
            && matches!(
                attrs.source,
                SourceDurability::Definitive | SourceDurability::Inaccessible
            )
        {
            return true;
        }
        false
    }

    /// Re-evaluate a record whose own attributes changed
    ///
    /// Emits a request only if the target group differs from the current one.
    pub fn reclassify(
        &self,
        record: &Record,
        current: Classification,
    ) -> Option<ReclassifyRequest> {
        let target = self.classify(&record.importance, current.propagation);
        if target.group == current.group {
            return None;
        }
        Some(ReclassifyRequest { record: record.id, target })
    }

    /// Re-evaluate a record because a related record's classification changed
    ///
    /// Under normal propagation, relation to a high-value record pulls this
    /// one up. A firewalled record ignores related changes entirely; that is
    /// the point of the firewall.
    pub fn on_related_change(
        &self,
        record: &Record,
        current: Classification,
        related: Classification,
    ) -> Option<ReclassifyRequest> {
        if current.propagation == Propagation::Firewall {
            return None;
        }
        if related.group == ShardGroup::HighValue && current.group != ShardGroup::HighValue {
            return Some(ReclassifyRequest {
                record: record.id,
                target: Classification {
                    group: ShardGroup::HighValue,
                    propagation: current.propagation,
                },
            });
        }
        None
    }
}

impl Default for ImportanceClassifier {
    fn default() -> Self {
        Self::new(ImportancePolicy::default())
    }
}
