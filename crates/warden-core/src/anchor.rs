//! Bootstrap-time trust anchor for OS-critical binaries.
//!
//! At startup the agent inventories a curated list of critical system
//! paths (window server, security daemons, its own binaries) plus whatever
//! the OS default mute set reports, and hands their precomputed identities
//! to [`CriticalBinaryTrustAnchor::build`]. Hashing and signature parsing
//! happen outside the engine.
//!
//! A candidate earns an always-allow entry only when its certificate chain
//! matches the process-launcher's chain or its team identifier matches the
//! running agent's own; paths validating against neither are logged and
//! skipped, never trusted by path alone. The resulting maps are immutable
//! and answer lookups without a store round trip, keeping the hot decision
//! path cheap.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::rule::{RuleRecord, RuleState, RuleType};

/// Precomputed identity of one critical-binary candidate, produced by the
/// external hashing/signature collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct BinaryIdentity {
    /// Filesystem path, for logging only. Never a trust input.
    pub path: String,

    /// SHA-256 of the executable file.
    #[serde(default)]
    pub sha256: Option<String>,

    /// Signing identifier.
    #[serde(default)]
    pub signing_id: Option<String>,

    /// Team identifier.
    #[serde(default)]
    pub team_id: Option<String>,

    /// Leaf-first SHA-256 hashes of the signing certificate chain.
    #[serde(default)]
    pub cert_chain_sha256: Vec<String>,
}

impl BinaryIdentity {
    /// An identity for the binary at `path` with no signing facts yet.
    #[must_use]
    pub fn for_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Immutable always-allow set for critical system binaries, keyed by
/// signing identifier and by binary hash.
#[derive(Debug, Default)]
pub struct CriticalBinaryTrustAnchor {
    by_signing_id: HashMap<String, RuleRecord>,
    by_hash: HashMap<String, RuleRecord>,
}

impl CriticalBinaryTrustAnchor {
    /// An empty anchor; every lookup misses.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validates candidates and builds the anchor.
    ///
    /// `launcher_chain` is the leaf-first certificate chain of the OS
    /// process launcher; `own_team_id` is the running agent's team
    /// identifier. A candidate is accepted when its chain equals the
    /// launcher chain or its team id equals the agent's.
    #[must_use]
    pub fn build<I>(candidates: I, launcher_chain: &[String], own_team_id: Option<&str>) -> Self
    where
        I: IntoIterator<Item = BinaryIdentity>,
    {
        let mut anchor = Self::default();
        for candidate in candidates {
            // Hex hash comparison ignores case, matching the lookup side.
            let chain_trusted = !launcher_chain.is_empty()
                && candidate.cert_chain_sha256.len() == launcher_chain.len()
                && candidate
                    .cert_chain_sha256
                    .iter()
                    .zip(launcher_chain)
                    .all(|(ours, theirs)| ours.eq_ignore_ascii_case(theirs));
            let team_trusted = matches!(
                (own_team_id, candidate.team_id.as_deref()),
                (Some(own), Some(team)) if own == team
            );
            if !chain_trusted && !team_trusted {
                tracing::warn!(
                    path = %candidate.path,
                    "critical binary candidate failed trust validation; skipping"
                );
                continue;
            }

            if let Some(signing_id) = &candidate.signing_id {
                anchor.by_signing_id.insert(
                    signing_id.clone(),
                    allow_record(signing_id.clone(), RuleType::SigningId),
                );
            }
            if let Some(sha256) = &candidate.sha256 {
                let sha256 = sha256.to_ascii_lowercase();
                anchor
                    .by_hash
                    .insert(sha256.clone(), allow_record(sha256, RuleType::Binary));
            }
        }
        anchor
    }

    /// Always-allow entry for a signing identifier, if one was anchored.
    #[must_use]
    pub fn allow_for_signing_id(&self, signing_id: &str) -> Option<&RuleRecord> {
        self.by_signing_id.get(signing_id)
    }

    /// Always-allow entry for a binary hash, if one was anchored.
    #[must_use]
    pub fn allow_for_hash(&self, sha256: &str) -> Option<&RuleRecord> {
        self.by_hash.get(&sha256.to_ascii_lowercase())
    }

    /// Number of anchored entries across both keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_signing_id.len() + self.by_hash.len()
    }

    /// True when nothing was anchored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_signing_id.is_empty() && self.by_hash.is_empty()
    }
}

fn allow_record(identifier: String, rule_type: RuleType) -> RuleRecord {
    RuleRecord::new(identifier, rule_type, RuleState::Allow)
        .with_comment("critical system binary")
}
