//! Decision-cache invalidation heuristic for just-validated rule batches.
//!
//! An external decision cache serves allow/block verdicts without hitting
//! the store. After a batch mutates the rule corpus, some cached verdicts
//! may be stale. The rules here are evaluated in order against pre-commit
//! store state; the first match requests a flush:
//!
//! 1. Any tombstone in the batch. A removal might un-shadow a
//!    lower-precedence rule, and the interaction with cached verdicts
//!    cannot be proven safe.
//! 2. 1000 or more non-Allow records in the batch. Bulk block operations
//!    skip the per-row novelty probe entirely.
//! 3. A non-Allow record the store does not already hold verbatim
//!    (`identifier`, `type`, `state`, and expression all equal).
//! 4. An Allow record (CDHash/Binary/SigningID only) shadowing an existing
//!    AllowCompiler row: a binary previously trusted only as compiler
//!    output is being promoted to a hard allow.

use rusqlite::{Connection, params};

use crate::rule::{RuleRecord, RuleState, RuleType};

/// Non-Allow batch size at which the per-row novelty probe is skipped.
pub(super) const NON_ALLOW_FLUSH_THRESHOLD: usize = 1000;

/// Evaluates the invalidation rules for a canonicalized batch against the
/// current contents of `conn`. Must run before the batch is applied.
pub(super) fn batch_requires_flush(
    conn: &Connection,
    batch: &[RuleRecord],
) -> rusqlite::Result<bool> {
    if batch.iter().any(|rule| rule.state == RuleState::Remove) {
        return Ok(true);
    }

    let non_allow = batch
        .iter()
        .filter(|rule| rule.state != RuleState::Allow)
        .count();
    if non_allow >= NON_ALLOW_FLUSH_THRESHOLD {
        return Ok(true);
    }

    for rule in batch.iter().filter(|rule| rule.state != RuleState::Allow) {
        // "No expression" and "empty expression" are one sentinel on both
        // sides of this comparison.
        let existing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rules
             WHERE identifier = ?1 AND type = ?2 AND state = ?3
               AND IFNULL(cel_expr, '') = ?4",
            params![
                rule.identifier,
                rule.rule_type.code(),
                rule.state.code(),
                rule.expression.as_deref().unwrap_or("")
            ],
            |row| row.get(0),
        )?;
        if existing == 0 {
            return Ok(true);
        }
    }

    for rule in batch.iter().filter(|rule| rule.state == RuleState::Allow) {
        // Certificate and TeamID rules cannot name a compiler-produced
        // binary, so promotion does not apply to them.
        if !matches!(
            rule.rule_type,
            RuleType::CdHash | RuleType::Binary | RuleType::SigningId
        ) {
            continue;
        }
        let shadowed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rules WHERE identifier = ?1 AND type = ?2 AND state = ?3",
            params![
                rule.identifier,
                rule.rule_type.code(),
                RuleState::AllowCompiler.code()
            ],
            |row| row.get(0),
        )?;
        if shadowed > 0 {
            return Ok(true);
        }
    }

    Ok(false)
}
