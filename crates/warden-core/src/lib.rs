//! Rule store and decision-resolution engine for the warden
//! binary-authorization agent.
//!
//! Given a candidate executable's identity tuple — binary hash, signing
//! certificate hash, team identifier, signing identifier, code-directory
//! hash — this crate decides which rule governs its execution and
//! maintains the rule corpus that decision derives from.
//!
//! # Components
//!
//! - [`rule`]: the persisted rule entity and the lookup key.
//! - [`store`]: durable, schema-versioned `SQLite` storage with
//!   transactional batch mutation, cache-invalidation heuristics,
//!   transitive-rule culling, and the sync digest.
//! - [`overlay`]: in-memory static rules consulted before the store.
//! - [`anchor`]: bootstrap-time always-allow set for OS-critical binaries.
//! - [`resolve`]: the precedence-ordered resolution algorithm.
//! - [`cel`]: the expression-evaluator façade for conditional rules.
//! - [`config`]: operational tunables.
//!
//! Everything upstream of the identifier tuple (event interception,
//! hashing, signature parsing, IPC, the remote sync client) and everything
//! downstream of the resolved rule (the decision cache, telemetry) are
//! external collaborators.

pub mod anchor;
pub mod cel;
pub mod config;
pub mod overlay;
pub mod resolve;
pub mod rule;
pub mod store;

pub use anchor::{BinaryIdentity, CriticalBinaryTrustAnchor};
pub use cel::{ActivationContext, CelPolicyEvaluator, CompiledPolicy, EvalError, PolicyEvaluator};
pub use config::{ConfigError, CullConfig, EngineConfig};
pub use overlay::StaticRuleOverlay;
pub use resolve::ResolutionEngine;
pub use rule::{RuleError, RuleIdentifierSet, RuleRecord, RuleState, RuleType};
pub use store::{
    AddRulesOutcome, CURRENT_SCHEMA_VERSION, RuleCleanup, RuleStore, RuleStoreError,
};
