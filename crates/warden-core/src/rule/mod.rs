//! Rule data model for the binary-authorization engine.
//!
//! A [`RuleRecord`] is the persisted policy entity: an identifier string,
//! the kind of identity it names ([`RuleType`]), and the verdict it carries
//! ([`RuleState`]). The `(identifier, type)` pair is unique in storage.
//!
//! Identifier strings are syntactically constrained per type and are
//! canonicalized before storage so that lookups never depend on caller
//! casing:
//!
//! - `Binary` / `Certificate`: 64 hex chars, lowercase.
//! - `CdHash`: 40 hex chars, lowercase.
//! - `TeamId`: 10 alphanumeric chars, uppercase.
//! - `SigningId`: `TEAMID:signing.id` (team part uppercase) or
//!   `platform:signing.id` for platform binaries.

mod identifiers;

pub use identifiers::RuleIdentifierSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Team prefix used by signing identifiers of platform binaries, which have
/// no team identifier of their own.
pub const PLATFORM_TEAM: &str = "platform";

/// Validation errors for a single rule record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RuleError {
    /// The identifier string is empty or whitespace.
    #[error("rule identifier is empty")]
    EmptyIdentifier,

    /// The identifier does not meet the syntactic contract for its type.
    #[error("identifier {identifier:?} is not valid for rule type {rule_type:?}")]
    MalformedIdentifier {
        /// The offending identifier.
        identifier: String,
        /// The rule type it was validated against.
        rule_type: RuleType,
    },

    /// The rule type code did not map to a known type.
    #[error("rule type is unknown")]
    UnknownType,

    /// The rule state code did not map to a known state.
    #[error("rule state is unknown")]
    UnknownState,

    /// A CEL rule was supplied without an expression.
    #[error("CEL rule requires a non-empty expression")]
    MissingExpression,
}

/// The kind of identity a rule matches against.
///
/// The numeric code doubles as the precedence rank: lower code means a more
/// specific identity that wins resolution over broader ones. Codes are
/// deliberately non-contiguous so new kinds can be ranked between existing
/// ones without renumbering persisted rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum RuleType {
    /// Unrecognized persisted code. Never valid in a rule batch.
    Unknown,
    /// Code-directory hash of a specific signed build.
    CdHash,
    /// SHA-256 of the executable file.
    Binary,
    /// Team-scoped signing identifier.
    SigningId,
    /// SHA-256 of the leaf signing certificate.
    Certificate,
    /// Developer team identifier.
    TeamId,
}

impl RuleType {
    /// Persisted numeric code; also the precedence rank (lower wins).
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::CdHash => 500,
            Self::Binary => 1000,
            Self::SigningId => 2000,
            Self::Certificate => 3000,
            Self::TeamId => 4000,
        }
    }

    /// Maps a persisted code back to a type. Foreign codes become
    /// [`RuleType::Unknown`] so old stores read losslessly.
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            500 => Self::CdHash,
            1000 => Self::Binary,
            2000 => Self::SigningId,
            3000 => Self::Certificate,
            4000 => Self::TeamId,
            _ => Self::Unknown,
        }
    }
}

/// The verdict a rule carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum RuleState {
    /// Unrecognized persisted code. Never valid in a rule batch.
    Unknown,
    /// Execution is allowed.
    Allow,
    /// Execution is blocked with user notification.
    Block,
    /// Execution is blocked without notification.
    SilentBlock,
    /// Tombstone: delete the matching `(identifier, type)` row. Never
    /// persisted as a standing rule.
    Remove,
    /// Allowed, and outputs of this binary earn transitive trust.
    AllowCompiler,
    /// Allowed because a trusted compiler produced it. Subject to
    /// age-based culling.
    AllowTransitive,
    /// Allowed by local administrative action, keyed by binary hash.
    AllowLocalBinary,
    /// Allowed by local administrative action, keyed by signing id.
    AllowLocalSigningId,
    /// Governed by a CEL expression evaluated per decision.
    Cel,
}

impl RuleState {
    /// Persisted numeric code.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::Allow => 1,
            Self::Block => 2,
            Self::SilentBlock => 3,
            Self::Remove => 4,
            Self::AllowCompiler => 5,
            Self::AllowTransitive => 6,
            Self::AllowLocalBinary => 7,
            Self::AllowLocalSigningId => 8,
            Self::Cel => 9,
        }
    }

    /// Maps a persisted code back to a state; foreign codes become
    /// [`RuleState::Unknown`].
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Allow,
            2 => Self::Block,
            3 => Self::SilentBlock,
            4 => Self::Remove,
            5 => Self::AllowCompiler,
            6 => Self::AllowTransitive,
            7 => Self::AllowLocalBinary,
            8 => Self::AllowLocalSigningId,
            9 => Self::Cel,
            _ => Self::Unknown,
        }
    }
}

/// A single authorization rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RuleRecord {
    /// Identity string; semantics depend on `rule_type`.
    pub identifier: String,

    /// The kind of identity matched.
    #[serde(alias = "type")]
    pub rule_type: RuleType,

    /// The verdict carried.
    pub state: RuleState,

    /// Optional message shown when the rule blocks. Opaque to the engine.
    #[serde(default)]
    pub custom_msg: Option<String>,

    /// Optional URL shown when the rule blocks. Opaque to the engine.
    #[serde(default)]
    pub custom_url: Option<String>,

    /// Optional operator note. Opaque to the engine.
    #[serde(default)]
    pub comment: Option<String>,

    /// CEL source text; present iff `state == Cel`.
    #[serde(default)]
    pub expression: Option<String>,

    /// Seconds since the Unix epoch. Stamped at insert, refreshed when a
    /// transitive rule is exercised at decision time.
    #[serde(default)]
    pub timestamp: i64,
}

impl RuleRecord {
    /// Creates a rule with no display strings, expression, or timestamp.
    #[must_use]
    pub fn new(identifier: impl Into<String>, rule_type: RuleType, state: RuleState) -> Self {
        Self {
            identifier: identifier.into(),
            rule_type,
            state,
            custom_msg: None,
            custom_url: None,
            comment: None,
            expression: None,
            timestamp: 0,
        }
    }

    /// Attaches a CEL expression (builder pattern).
    #[must_use]
    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    /// Attaches an operator comment (builder pattern).
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Sets an explicit timestamp (builder pattern).
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Validates the record and returns its canonical form.
    ///
    /// Canonicalization lowercases hash identifiers, uppercases team codes,
    /// collapses empty expressions to `None`, and drops expressions from
    /// non-CEL rules so that "no expression" has exactly one representation.
    ///
    /// # Errors
    ///
    /// Returns a [`RuleError`] if the identifier is empty or malformed for
    /// the type, the type or state is `Unknown`, or a CEL rule lacks an
    /// expression.
    pub fn normalized(&self) -> Result<Self, RuleError> {
        let identifier = self.identifier.trim();
        if identifier.is_empty() {
            return Err(RuleError::EmptyIdentifier);
        }
        if self.rule_type == RuleType::Unknown {
            return Err(RuleError::UnknownType);
        }
        if self.state == RuleState::Unknown {
            return Err(RuleError::UnknownState);
        }

        let canonical = match self.rule_type {
            RuleType::Binary | RuleType::Certificate => normalize_hex(identifier, 64),
            RuleType::CdHash => normalize_hex(identifier, 40),
            RuleType::TeamId => normalize_team_identifier(identifier),
            RuleType::SigningId => normalize_signing_identifier(identifier),
            RuleType::Unknown => None,
        }
        .ok_or_else(|| RuleError::MalformedIdentifier {
            identifier: identifier.to_string(),
            rule_type: self.rule_type,
        })?;

        let expression = self
            .expression
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_owned);
        if self.state == RuleState::Cel && expression.is_none() {
            return Err(RuleError::MissingExpression);
        }
        let expression = if self.state == RuleState::Cel {
            expression
        } else {
            None
        };

        Ok(Self {
            identifier: canonical,
            expression,
            ..self.clone()
        })
    }
}

/// Lowercases a fixed-length hex digest, rejecting anything else.
pub(crate) fn normalize_hex(value: &str, expected_len: usize) -> Option<String> {
    let value = value.trim();
    if value.len() != expected_len || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(value.to_ascii_lowercase())
}

/// Uppercases a 10-character alphanumeric team code, rejecting anything else.
pub(crate) fn normalize_team_identifier(value: &str) -> Option<String> {
    let value = value.trim();
    if value.len() != 10 || !value.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    Some(value.to_ascii_uppercase())
}

/// Canonicalizes a `team:signing.id` pair. The team part is either a valid
/// team code (uppercased) or the literal platform prefix; the signing-id
/// part is preserved verbatim.
pub(crate) fn normalize_signing_identifier(value: &str) -> Option<String> {
    let value = value.trim();
    let (team, signing_id) = value.split_once(':')?;
    if signing_id.is_empty() {
        return None;
    }
    if team.eq_ignore_ascii_case(PLATFORM_TEAM) {
        return Some(format!("{PLATFORM_TEAM}:{signing_id}"));
    }
    let team = normalize_team_identifier(team)?;
    Some(format!("{team}:{signing_id}"))
}
