//! In-memory static-rule overlay consulted before the durable store.
//!
//! Overlay entries come wholesale from externally maintained configuration
//! and are never persisted by the engine. Updates replace the entire map
//! behind a copy-on-write swap, so concurrent readers always observe a
//! complete snapshot and never a partially-applied update.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::cel::PolicyEvaluator;
use crate::rule::{RuleIdentifierSet, RuleRecord, RuleState};

/// Immutable-snapshot map of identifier to rule, replaced wholesale on
/// each configuration push.
#[derive(Default)]
pub struct StaticRuleOverlay {
    rules: RwLock<Arc<HashMap<String, RuleRecord>>>,
}

// Mutex/RwLock poisoning indicates a panic in another thread, which is
// unrecoverable.
#[allow(clippy::missing_panics_doc)]
impl StaticRuleOverlay {
    /// An empty overlay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes the overlay from an ordered list of rule entries and
    /// swaps it in whole.
    ///
    /// Each entry is re-validated (including CEL compilation) even though
    /// the caller is trusted for validation timing; invalid entries and
    /// tombstones are logged and skipped rather than failing the push.
    /// Later entries override earlier ones with the same identifier.
    /// Returns the number of entries cached.
    pub fn update(&self, entries: &[RuleRecord], evaluator: &dyn PolicyEvaluator) -> usize {
        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            let rule = match entry.normalized() {
                Ok(rule) => rule,
                Err(error) => {
                    tracing::warn!(
                        identifier = %entry.identifier,
                        %error,
                        "skipping invalid static rule"
                    );
                    continue;
                }
            };
            if rule.state == RuleState::Remove {
                tracing::warn!(
                    identifier = %rule.identifier,
                    "skipping static rule with tombstone state"
                );
                continue;
            }
            if rule.state == RuleState::Cel {
                let source = rule.expression.as_deref().unwrap_or_default();
                if let Err(error) = evaluator.compile(source) {
                    tracing::warn!(
                        identifier = %rule.identifier,
                        %error,
                        "skipping static rule with uncompilable expression"
                    );
                    continue;
                }
            }
            map.insert(rule.identifier.clone(), rule);
        }

        let cached = map.len();
        *self.rules.write().unwrap() = Arc::new(map);
        cached
    }

    /// True when the overlay holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.read().unwrap().is_empty()
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.read().unwrap().len()
    }

    /// Probes the overlay in precedence order (CDHash, Binary, SigningID,
    /// Certificate, TeamID) and returns the first hit whose stored type
    /// matches the probed kind. The type guard prevents an entry keyed by
    /// an identifier string that coincidentally equals a different kind's
    /// field from matching.
    #[must_use]
    pub fn resolve(&self, ids: &RuleIdentifierSet) -> Option<RuleRecord> {
        let snapshot = Arc::clone(&self.rules.read().unwrap());
        if snapshot.is_empty() {
            return None;
        }
        let ids = ids.normalized();
        for (rule_type, value) in ids.probes() {
            if let Some(rule) = snapshot.get(value) {
                if rule.rule_type == rule_type {
                    return Some(rule.clone());
                }
            }
        }
        None
    }
}
