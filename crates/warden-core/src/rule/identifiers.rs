//! The lookup key assembled from a candidate executable.

use serde::{Deserialize, Serialize};

use super::{
    RuleType, normalize_hex, normalize_signing_identifier, normalize_team_identifier,
};

/// Identity tuple gathered from a candidate executable by an external
/// collaborator (hashing and signature inspection happen outside the
/// engine).
///
/// Every field is optional: absence means that kind of identity was not
/// observed. Empty strings are treated as absent so they can never match a
/// stored rule by accident.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RuleIdentifierSet {
    /// Code-directory hash (40 hex chars).
    #[serde(default)]
    pub cdhash: Option<String>,

    /// SHA-256 of the executable file (64 hex chars).
    #[serde(default)]
    pub binary_sha256: Option<String>,

    /// Signing identifier (`TEAMID:signing.id` or `platform:signing.id`).
    #[serde(default)]
    pub signing_id: Option<String>,

    /// SHA-256 of the leaf signing certificate (64 hex chars).
    #[serde(default)]
    pub certificate_sha256: Option<String>,

    /// Developer team identifier (10 alphanumeric chars).
    #[serde(default)]
    pub team_id: Option<String>,
}

impl RuleIdentifierSet {
    /// An identifier set with no observed identities.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the code-directory hash (builder pattern).
    #[must_use]
    pub fn with_cdhash(mut self, cdhash: impl Into<String>) -> Self {
        self.cdhash = Some(cdhash.into());
        self
    }

    /// Sets the binary hash (builder pattern).
    #[must_use]
    pub fn with_binary_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.binary_sha256 = Some(sha256.into());
        self
    }

    /// Sets the signing identifier (builder pattern).
    #[must_use]
    pub fn with_signing_id(mut self, signing_id: impl Into<String>) -> Self {
        self.signing_id = Some(signing_id.into());
        self
    }

    /// Sets the certificate hash (builder pattern).
    #[must_use]
    pub fn with_certificate_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.certificate_sha256 = Some(sha256.into());
        self
    }

    /// Sets the team identifier (builder pattern).
    #[must_use]
    pub fn with_team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// True when no identity of any kind was observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.probes().next().is_none()
    }

    /// Yields `(type, identifier)` probes in precedence order, most
    /// specific first: CDHash, Binary, SigningID, Certificate, TeamID.
    /// Empty strings are skipped.
    pub fn probes(&self) -> impl Iterator<Item = (RuleType, &str)> {
        [
            (RuleType::CdHash, self.cdhash.as_deref()),
            (RuleType::Binary, self.binary_sha256.as_deref()),
            (RuleType::SigningId, self.signing_id.as_deref()),
            (RuleType::Certificate, self.certificate_sha256.as_deref()),
            (RuleType::TeamId, self.team_id.as_deref()),
        ]
        .into_iter()
        .filter_map(|(rule_type, value)| {
            let value = value.map(str::trim).filter(|v| !v.is_empty())?;
            Some((rule_type, value))
        })
    }

    /// Canonicalizes each field the same way stored identifiers are
    /// canonicalized, so probes match regardless of caller casing. Fields
    /// that fail their syntactic contract are kept trimmed as-is; they
    /// cannot match a stored rule, which only ever holds canonical
    /// identifiers. Empty fields collapse to `None`.
    #[must_use]
    pub fn normalized(&self) -> Self {
        fn canon(
            value: &Option<String>,
            normalize: impl Fn(&str) -> Option<String>,
        ) -> Option<String> {
            let value = value.as_deref().map(str::trim).filter(|v| !v.is_empty())?;
            Some(normalize(value).unwrap_or_else(|| value.to_string()))
        }

        Self {
            cdhash: canon(&self.cdhash, |v| normalize_hex(v, 40)),
            binary_sha256: canon(&self.binary_sha256, |v| normalize_hex(v, 64)),
            signing_id: canon(&self.signing_id, normalize_signing_identifier),
            certificate_sha256: canon(&self.certificate_sha256, |v| normalize_hex(v, 64)),
            team_id: canon(&self.team_id, normalize_team_identifier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_order_is_most_specific_first() {
        let ids = RuleIdentifierSet::new()
            .with_team_id("ABCDE12345")
            .with_cdhash("a".repeat(40))
            .with_binary_sha256("b".repeat(64));

        let order: Vec<RuleType> = ids.probes().map(|(t, _)| t).collect();
        assert_eq!(
            order,
            vec![RuleType::CdHash, RuleType::Binary, RuleType::TeamId]
        );
    }

    #[test]
    fn test_empty_strings_never_probe() {
        let ids = RuleIdentifierSet::new()
            .with_binary_sha256("")
            .with_team_id("   ");
        assert!(ids.is_empty());
        assert_eq!(ids.probes().count(), 0);
    }

    #[test]
    fn test_normalized_canonicalizes_fields() {
        let ids = RuleIdentifierSet::new()
            .with_binary_sha256("A".repeat(64))
            .with_team_id("abcde12345")
            .with_signing_id("abcde12345:com.example.Tool")
            .normalized();

        assert_eq!(ids.binary_sha256.as_deref(), Some("a".repeat(64).as_str()));
        assert_eq!(ids.team_id.as_deref(), Some("ABCDE12345"));
        assert_eq!(
            ids.signing_id.as_deref(),
            Some("ABCDE12345:com.example.Tool")
        );
    }

    #[test]
    fn test_normalized_keeps_malformed_fields_verbatim() {
        let ids = RuleIdentifierSet::new()
            .with_binary_sha256("not-a-hash")
            .normalized();
        assert_eq!(ids.binary_sha256.as_deref(), Some("not-a-hash"));
    }
}
