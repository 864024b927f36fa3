//! Streaming content digest over the non-transitive rule corpus.
//!
//! A remote sync authority compares this digest against its own to detect
//! drift without transferring the whole rule set. Transitive rules are
//! locally generated and excluded. The hash is fast and non-cryptographic;
//! determinism rests on rowid scan order being stable on an unchanged
//! store, which holds because every mutation invalidates the memo.

use std::hash::Hasher;

use rusqlite::{Connection, params};
use twox_hash::XxHash64;

use crate::rule::RuleState;

/// Streams every non-transitive row through XxHash64 in rowid order and
/// renders the result as 16 lowercase hex chars.
pub(super) fn digest_rules(conn: &Connection) -> rusqlite::Result<String> {
    let mut stmt = conn.prepare(
        "SELECT identifier, state, type, IFNULL(cel_expr, '')
         FROM rules
         WHERE state != ?1
         ORDER BY rowid ASC",
    )?;

    let mut hasher = XxHash64::with_seed(0);
    let mut rows = stmt.query(params![RuleState::AllowTransitive.code()])?;
    while let Some(row) = rows.next()? {
        let identifier: String = row.get(0)?;
        let state: i64 = row.get(1)?;
        let type_code: i64 = row.get(2)?;
        let expression: String = row.get(3)?;

        hasher.write(identifier.as_bytes());
        hasher.write_u8(0);
        hasher.write_i64(state);
        hasher.write_i64(type_code);
        hasher.write(expression.as_bytes());
        hasher.write_u8(0);
    }

    Ok(format!("{:016x}", hasher.finish()))
}
