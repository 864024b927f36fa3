//! Durable rule storage for the authorization engine.
//!
//! This module owns the `SQLite`-backed [`RuleStore`]: schema-versioned
//! storage of authorization rules with transactional batch mutation,
//! precedence-ranked lookup, the decision-cache invalidation heuristic,
//! age-based culling of transitive rules, and the memoized content digest
//! used for remote reconciliation.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use warden_core::cel::CelPolicyEvaluator;
//! use warden_core::rule::{RuleRecord, RuleState, RuleType};
//! use warden_core::store::{RuleCleanup, RuleStore};
//!
//! # fn example() -> Result<(), warden_core::store::RuleStoreError> {
//! let store = RuleStore::open("/var/db/warden/rules.db", Arc::new(CelPolicyEvaluator::new()))?;
//!
//! let rule = RuleRecord::new("a".repeat(64), RuleType::Binary, RuleState::Block);
//! let outcome = store.add_rules(&[rule], RuleCleanup::None)?;
//! if outcome.flush_decision_cache {
//!     // tell the decision cache to drop its entries
//! }
//! # Ok(())
//! # }
//! ```

mod cache_policy;
mod digest;
mod migrations;
mod store;


pub use migrations::CURRENT_SCHEMA_VERSION;
pub use store::{AddRulesOutcome, RuleCleanup, RuleStore, RuleStoreError};
