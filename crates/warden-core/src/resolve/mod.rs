//! Decision resolution: one identifier set in, one authoritative rule out.
//!
//! The algorithm is a contract, not an implementation detail:
//!
//! 1. If the static overlay is non-empty, probe it in precedence order and
//!    return the first type-guarded hit.
//! 2. Otherwise ask the durable store for the single highest-precedence
//!    match across all five identifier kinds.
//! 3. Otherwise, if the probed certificate hash equals the OS
//!    process-launcher's leaf certificate, synthesize an ephemeral allow
//!    (never persisted).
//! 4. Otherwise: no rule. There is no ambiguous verdict.
//!
//! More specific identifiers override broader ones so a single compromised
//! binary can be blocked without revoking trust in its entire signing
//! identity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::anchor::CriticalBinaryTrustAnchor;
use crate::cel::{ActivationContext, CompiledPolicy, EvalError, PolicyEvaluator};
use crate::overlay::StaticRuleOverlay;
use crate::rule::{RuleIdentifierSet, RuleRecord, RuleState, RuleType};
use crate::store::{RuleStore, RuleStoreError};

/// Resolves identifier sets to authoritative rules.
pub struct ResolutionEngine {
    store: Arc<RuleStore>,
    overlay: Arc<StaticRuleOverlay>,
    anchor: Arc<CriticalBinaryTrustAnchor>,
    evaluator: Arc<dyn PolicyEvaluator>,
    launcher_cert_sha256: Option<String>,
    // Compiled programs keyed by expression source. Source text is the
    // identity of a program, so entries never go stale.
    policy_cache: Mutex<HashMap<String, Arc<CompiledPolicy>>>,
}

// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable.
#[allow(clippy::missing_panics_doc)]
impl ResolutionEngine {
    /// Creates an engine over a store, overlay, and trust anchor.
    #[must_use]
    pub fn new(
        store: Arc<RuleStore>,
        overlay: Arc<StaticRuleOverlay>,
        anchor: Arc<CriticalBinaryTrustAnchor>,
        evaluator: Arc<dyn PolicyEvaluator>,
    ) -> Self {
        Self {
            store,
            overlay,
            anchor,
            evaluator,
            launcher_cert_sha256: None,
            policy_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Records the leaf-certificate hash of the OS process launcher,
    /// established once at startup (builder pattern).
    #[must_use]
    pub fn with_launcher_certificate(mut self, sha256: impl Into<String>) -> Self {
        self.launcher_cert_sha256 = Some(sha256.into().to_ascii_lowercase());
        self
    }

    /// Resolves the single authoritative rule for an identifier set, or
    /// `None` when no rule governs it.
    ///
    /// Resolving a transitive-allow rule from the durable store refreshes
    /// its timestamp so exercised rules survive culling; that refresh is
    /// best-effort and never fails the resolution.
    ///
    /// # Errors
    ///
    /// Returns an error only when the durable store lookup itself fails.
    pub fn resolve(
        &self,
        ids: &RuleIdentifierSet,
    ) -> Result<Option<RuleRecord>, RuleStoreError> {
        let ids = ids.normalized();

        if let Some(rule) = self.overlay.resolve(&ids) {
            return Ok(Some(rule));
        }

        if let Some(rule) = self.store.rule_for_identifiers(&ids)? {
            if rule.state == RuleState::AllowTransitive {
                self.store.reset_timestamp(&rule);
            }
            return Ok(Some(rule));
        }

        if let (Some(cert), Some(launcher)) = (
            ids.certificate_sha256.as_deref(),
            self.launcher_cert_sha256.as_deref(),
        ) {
            if cert.eq_ignore_ascii_case(launcher) {
                return Ok(Some(RuleRecord::new(
                    launcher.to_string(),
                    RuleType::Certificate,
                    RuleState::Allow,
                )));
            }
        }

        Ok(None)
    }

    /// Always-allow entry from the critical-binary trust anchor, probed by
    /// signing identifier then binary hash. Pure in-memory lookup for the
    /// hot decision path; never touches the store.
    #[must_use]
    pub fn critical_binary(&self, ids: &RuleIdentifierSet) -> Option<&RuleRecord> {
        let signing_hit = ids
            .signing_id
            .as_deref()
            .filter(|v| !v.is_empty())
            .and_then(|signing_id| self.anchor.allow_for_signing_id(signing_id));
        if signing_hit.is_some() {
            return signing_hit;
        }
        ids.binary_sha256
            .as_deref()
            .filter(|v| !v.is_empty())
            .and_then(|sha256| self.anchor.allow_for_hash(sha256))
    }

    /// Evaluates a CEL rule's expression against decision-time facts.
    ///
    /// Expressions compile once per distinct source text; decisions after
    /// the first reuse the compiled program. Returns `Allow` or `Block`.
    /// Any compile or runtime failure resolves as `Block` with a log line:
    /// conditional rules fail closed, the only fail-closed path in the
    /// engine.
    #[must_use]
    pub fn evaluate_cel(&self, rule: &RuleRecord, ctx: &ActivationContext) -> RuleState {
        let source = rule.expression.as_deref().unwrap_or_default();
        let verdict = self
            .compiled_policy(source)
            .and_then(|policy| self.evaluator.evaluate(&policy, ctx));
        match verdict {
            Ok(true) => RuleState::Allow,
            Ok(false) => RuleState::Block,
            Err(error) => {
                tracing::warn!(
                    identifier = %rule.identifier,
                    %error,
                    "policy expression failed; blocking"
                );
                RuleState::Block
            }
        }
    }

    fn compiled_policy(&self, source: &str) -> Result<Arc<CompiledPolicy>, EvalError> {
        if let Some(policy) = self.policy_cache.lock().unwrap().get(source) {
            return Ok(Arc::clone(policy));
        }
        // Compile outside the lock; only successful programs are cached.
        let policy = Arc::new(self.evaluator.compile(source)?);
        self.policy_cache
            .lock()
            .unwrap()
            .insert(source.to_string(), Arc::clone(&policy));
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::anchor::BinaryIdentity;
    use crate::cel::CelPolicyEvaluator;
    use crate::store::RuleCleanup;

    const CDHASH_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const BINARY_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const CERT_A: &str = "cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";
    const LAUNCHER_CERT: &str =
        "1111111111111111111111111111111111111111111111111111111111111111";
    const SIGNING_A: &str = "ABCDE12345:com.example.tool";
    const TEAM_A: &str = "ABCDE12345";

    fn engine() -> ResolutionEngine {
        engine_with(Arc::new(StaticRuleOverlay::new()), CriticalBinaryTrustAnchor::empty())
    }

    fn engine_with(
        overlay: Arc<StaticRuleOverlay>,
        anchor: CriticalBinaryTrustAnchor,
    ) -> ResolutionEngine {
        let store = Arc::new(RuleStore::in_memory().expect("in-memory store"));
        ResolutionEngine::new(
            store,
            overlay,
            Arc::new(anchor),
            Arc::new(CelPolicyEvaluator::new()),
        )
        .with_launcher_certificate(LAUNCHER_CERT)
    }

    fn all_ids() -> RuleIdentifierSet {
        RuleIdentifierSet::new()
            .with_cdhash(CDHASH_A)
            .with_binary_sha256(BINARY_A)
            .with_signing_id(SIGNING_A)
            .with_certificate_sha256(CERT_A)
            .with_team_id(TEAM_A)
    }

    fn ladder() -> Vec<RuleRecord> {
        vec![
            RuleRecord::new(CDHASH_A, RuleType::CdHash, RuleState::Block),
            RuleRecord::new(BINARY_A, RuleType::Binary, RuleState::Block),
            RuleRecord::new(SIGNING_A, RuleType::SigningId, RuleState::Block),
            RuleRecord::new(CERT_A, RuleType::Certificate, RuleState::Block),
            RuleRecord::new(TEAM_A, RuleType::TeamId, RuleState::Block),
        ]
    }

    #[test]
    fn test_precedence_ladder() {
        let engine = engine();
        engine
            .store
            .add_rules(&ladder(), RuleCleanup::None)
            .expect("add ladder");

        let expected = [
            RuleType::CdHash,
            RuleType::Binary,
            RuleType::SigningId,
            RuleType::Certificate,
            RuleType::TeamId,
        ];
        for rung in expected {
            let hit = engine
                .resolve(&all_ids())
                .expect("resolve")
                .expect("a rule matches");
            assert_eq!(hit.rule_type, rung, "expected {rung:?} to win");

            let tombstone = RuleRecord {
                state: RuleState::Remove,
                ..hit
            };
            engine
                .store
                .add_rules(&[tombstone], RuleCleanup::None)
                .expect("remove winner");
        }

        assert_eq!(engine.resolve(&all_ids()).expect("resolve"), None);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let engine = engine();
        engine
            .store
            .add_rules(
                &[RuleRecord::new(BINARY_A, RuleType::Binary, RuleState::Block)],
                RuleCleanup::None,
            )
            .expect("add rule");

        let ids = RuleIdentifierSet::new().with_binary_sha256(BINARY_A);
        let first = engine.resolve(&ids).expect("resolve");
        let second = engine.resolve(&ids).expect("resolve");
        assert_eq!(first, second);
    }

    #[test]
    fn test_probe_is_case_insensitive() {
        let engine = engine();
        engine
            .store
            .add_rules(
                &[RuleRecord::new(
                    BINARY_A.to_uppercase(),
                    RuleType::Binary,
                    RuleState::Block,
                )],
                RuleCleanup::None,
            )
            .expect("add rule");

        let ids = RuleIdentifierSet::new().with_binary_sha256(BINARY_A.to_uppercase());
        let hit = engine.resolve(&ids).expect("resolve").expect("rule found");
        assert_eq!(hit.identifier, BINARY_A);
    }

    #[test]
    fn test_unknown_identifier_finds_no_rule() {
        let engine = engine();
        engine
            .store
            .add_rules(
                &[RuleRecord::new(BINARY_A, RuleType::Binary, RuleState::Block)],
                RuleCleanup::None,
            )
            .expect("add rule");

        let ids = RuleIdentifierSet::new().with_binary_sha256("b".repeat(64));
        assert_eq!(engine.resolve(&ids).expect("resolve"), None);
    }

    #[test]
    fn test_empty_identifier_set_finds_no_rule() {
        let engine = engine();
        assert_eq!(
            engine.resolve(&RuleIdentifierSet::new()).expect("resolve"),
            None
        );
    }

    #[test]
    fn test_overlay_wins_over_store() {
        let overlay = Arc::new(StaticRuleOverlay::new());
        overlay.update(
            &[RuleRecord::new(BINARY_A, RuleType::Binary, RuleState::Allow)],
            &CelPolicyEvaluator::new(),
        );
        let engine = engine_with(overlay, CriticalBinaryTrustAnchor::empty());
        engine
            .store
            .add_rules(
                &[RuleRecord::new(BINARY_A, RuleType::Binary, RuleState::Block)],
                RuleCleanup::None,
            )
            .expect("add rule");

        let ids = RuleIdentifierSet::new().with_binary_sha256(BINARY_A);
        let hit = engine.resolve(&ids).expect("resolve").expect("rule found");
        assert_eq!(hit.state, RuleState::Allow);
    }

    #[test]
    fn test_overlay_miss_falls_through_to_store() {
        let overlay = Arc::new(StaticRuleOverlay::new());
        overlay.update(
            &[RuleRecord::new(
                "ZZZZZ99999",
                RuleType::TeamId,
                RuleState::Block,
            )],
            &CelPolicyEvaluator::new(),
        );
        let engine = engine_with(overlay, CriticalBinaryTrustAnchor::empty());
        engine
            .store
            .add_rules(
                &[RuleRecord::new(BINARY_A, RuleType::Binary, RuleState::Block)],
                RuleCleanup::None,
            )
            .expect("add rule");

        let ids = RuleIdentifierSet::new().with_binary_sha256(BINARY_A);
        let hit = engine.resolve(&ids).expect("resolve").expect("rule found");
        assert_eq!(hit.state, RuleState::Block);
    }

    #[test]
    fn test_launcher_certificate_fallback() {
        let engine = engine();
        let ids = RuleIdentifierSet::new().with_certificate_sha256(LAUNCHER_CERT.to_uppercase());
        let hit = engine.resolve(&ids).expect("resolve").expect("fallback hit");
        assert_eq!(hit.rule_type, RuleType::Certificate);
        assert_eq!(hit.state, RuleState::Allow);
        assert_eq!(hit.identifier, LAUNCHER_CERT);

        // The synthesized rule is ephemeral.
        assert_eq!(engine.store.rule_count().expect("count"), 0);
    }

    #[test]
    fn test_store_rule_beats_launcher_fallback() {
        let engine = engine();
        engine
            .store
            .add_rules(
                &[RuleRecord::new(
                    LAUNCHER_CERT,
                    RuleType::Certificate,
                    RuleState::Block,
                )],
                RuleCleanup::None,
            )
            .expect("add rule");

        let ids = RuleIdentifierSet::new().with_certificate_sha256(LAUNCHER_CERT);
        let hit = engine.resolve(&ids).expect("resolve").expect("rule found");
        assert_eq!(hit.state, RuleState::Block);
    }

    #[test]
    fn test_transitive_resolution_refreshes_timestamp() {
        let engine = engine();
        let stale = RuleRecord::new(BINARY_A, RuleType::Binary, RuleState::AllowTransitive)
            .with_timestamp(1_000);
        engine
            .store
            .add_rules(&[stale], RuleCleanup::None)
            .expect("add rule");

        let ids = RuleIdentifierSet::new().with_binary_sha256(BINARY_A);
        engine.resolve(&ids).expect("resolve").expect("rule found");

        let rules = engine.store.retrieve_all_rules().expect("retrieve");
        assert!(rules[0].timestamp > 1_000, "timestamp should be refreshed");
    }

    #[test]
    fn test_critical_binary_lookup() {
        let candidate = BinaryIdentity {
            path: "/usr/libexec/criticald".to_string(),
            sha256: Some(BINARY_A.to_string()),
            signing_id: Some("platform:com.os.criticald".to_string()),
            team_id: None,
            cert_chain_sha256: vec![LAUNCHER_CERT.to_string()],
        };
        let anchor = CriticalBinaryTrustAnchor::build(
            [candidate],
            &[LAUNCHER_CERT.to_string()],
            None,
        );
        let engine = engine_with(Arc::new(StaticRuleOverlay::new()), anchor);

        let ids = RuleIdentifierSet::new().with_signing_id("platform:com.os.criticald");
        let hit = engine.critical_binary(&ids).expect("anchored");
        assert_eq!(hit.state, RuleState::Allow);

        let ids = RuleIdentifierSet::new().with_binary_sha256(BINARY_A);
        assert!(engine.critical_binary(&ids).is_some());

        let ids = RuleIdentifierSet::new().with_binary_sha256("b".repeat(64));
        assert!(engine.critical_binary(&ids).is_none());
    }

    /// Evaluator that counts compilations, to observe program reuse.
    #[derive(Default)]
    struct CountingEvaluator {
        inner: CelPolicyEvaluator,
        compiles: AtomicUsize,
    }

    impl PolicyEvaluator for CountingEvaluator {
        fn compile(&self, source: &str) -> Result<CompiledPolicy, EvalError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            self.inner.compile(source)
        }

        fn evaluate(
            &self,
            policy: &CompiledPolicy,
            ctx: &ActivationContext,
        ) -> Result<bool, EvalError> {
            self.inner.evaluate(policy, ctx)
        }
    }

    #[test]
    fn test_expressions_compile_once_per_source_text() {
        let evaluator = Arc::new(CountingEvaluator::default());
        let engine = ResolutionEngine::new(
            Arc::new(RuleStore::in_memory().expect("in-memory store")),
            Arc::new(StaticRuleOverlay::new()),
            Arc::new(CriticalBinaryTrustAnchor::empty()),
            Arc::clone(&evaluator) as Arc<dyn PolicyEvaluator>,
        );
        let ctx = ActivationContext::for_path("/usr/local/bin/tool");

        let rule = RuleRecord::new(BINARY_A, RuleType::Binary, RuleState::Cel)
            .with_expression(r#"path == "/usr/local/bin/tool""#);
        for _ in 0..3 {
            assert_eq!(engine.evaluate_cel(&rule, &ctx), RuleState::Allow);
        }
        assert_eq!(evaluator.compiles.load(Ordering::SeqCst), 1);

        // A distinct expression compiles once more.
        let other = RuleRecord::new(BINARY_A, RuleType::Binary, RuleState::Cel)
            .with_expression("false");
        assert_eq!(engine.evaluate_cel(&other, &ctx), RuleState::Block);
        assert_eq!(engine.evaluate_cel(&other, &ctx), RuleState::Block);
        assert_eq!(evaluator.compiles.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_evaluate_cel_fails_closed() {
        let engine = engine();
        let ctx = ActivationContext::for_path("/usr/local/bin/tool");

        let rule = RuleRecord::new(BINARY_A, RuleType::Binary, RuleState::Cel)
            .with_expression("true");
        assert_eq!(engine.evaluate_cel(&rule, &ctx), RuleState::Allow);

        let rule = RuleRecord::new(BINARY_A, RuleType::Binary, RuleState::Cel)
            .with_expression("false");
        assert_eq!(engine.evaluate_cel(&rule, &ctx), RuleState::Block);

        // Runtime failure: unknown variable.
        let rule = RuleRecord::new(BINARY_A, RuleType::Binary, RuleState::Cel)
            .with_expression("no_such_variable == 1");
        assert_eq!(engine.evaluate_cel(&rule, &ctx), RuleState::Block);

        // Non-boolean result.
        let rule =
            RuleRecord::new(BINARY_A, RuleType::Binary, RuleState::Cel).with_expression("path");
        assert_eq!(engine.evaluate_cel(&rule, &ctx), RuleState::Block);
    }
}
