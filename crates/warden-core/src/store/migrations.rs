//! Ordered, idempotent schema migrations for the rule store.
//!
//! The schema version lives in `PRAGMA user_version`. Each step is additive
//! (table creation, column add, data normalization) and guarded so that
//! re-running against an already-migrated store is a no-op. Version history
//! must stay additive for backward compatibility:
//!
//! - v1: base `rules` table, unique on `(identifier, type)`.
//! - v2: display columns (`customurl`, `comment`) and `timestamp`.
//! - v3: identifier-case normalization of pre-existing rows.
//! - v4: `cel_expr` column for expression-governed rules.

use rusqlite::{Connection, Transaction, params};

use crate::rule::{RuleType, normalize_signing_identifier};

/// Highest schema version this build understands.
pub const CURRENT_SCHEMA_VERSION: i64 = 4;

type Migration = fn(&Transaction<'_>) -> rusqlite::Result<()>;

const MIGRATIONS: &[(i64, Migration)] = &[
    (1, migrate_v1_base_table),
    (2, migrate_v2_display_and_timestamp),
    (3, migrate_v3_normalize_identifier_case),
    (4, migrate_v4_cel_expression),
];

/// Applies every migration newer than the store's recorded version and
/// returns the resulting version. Already-migrated stores pass through
/// untouched.
pub(super) fn migrate(conn: &mut Connection) -> rusqlite::Result<i64> {
    let recorded: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if recorded >= CURRENT_SCHEMA_VERSION {
        return Ok(recorded);
    }

    let tx = conn.transaction()?;
    for (version, step) in MIGRATIONS {
        if *version > recorded {
            step(&tx)?;
            tx.pragma_update(None, "user_version", version)?;
        }
    }
    tx.commit()?;
    Ok(CURRENT_SCHEMA_VERSION)
}

fn migrate_v1_base_table(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute(
        "CREATE TABLE IF NOT EXISTS rules (
            identifier TEXT NOT NULL,
            state INTEGER NOT NULL,
            type INTEGER NOT NULL,
            custommsg TEXT,
            PRIMARY KEY (identifier, type)
        )",
        [],
    )?;
    Ok(())
}

fn migrate_v2_display_and_timestamp(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    add_column_if_missing(tx, "customurl", "TEXT")?;
    add_column_if_missing(tx, "comment", "TEXT")?;
    add_column_if_missing(tx, "timestamp", "INTEGER NOT NULL DEFAULT 0")?;
    Ok(())
}

/// Rows written before canonicalization may carry mixed-case identifiers.
/// Hashes go lowercase, team codes uppercase, signing-id team prefixes
/// uppercase. Rows that fail the signing-id contract are left untouched
/// rather than destroyed.
fn migrate_v3_normalize_identifier_case(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE OR REPLACE rules SET identifier = LOWER(identifier) WHERE type IN (?1, ?2, ?3)",
        params![
            RuleType::CdHash.code(),
            RuleType::Binary.code(),
            RuleType::Certificate.code()
        ],
    )?;
    tx.execute(
        "UPDATE OR REPLACE rules SET identifier = UPPER(identifier) WHERE type = ?1",
        params![RuleType::TeamId.code()],
    )?;

    let mut stale = Vec::new();
    {
        let mut stmt =
            tx.prepare("SELECT identifier FROM rules WHERE type = ?1")?;
        let mut rows = stmt.query(params![RuleType::SigningId.code()])?;
        while let Some(row) = rows.next()? {
            let identifier: String = row.get(0)?;
            if let Some(canonical) = normalize_signing_identifier(&identifier) {
                if canonical != identifier {
                    stale.push((identifier, canonical));
                }
            }
        }
    }
    for (identifier, canonical) in stale {
        tx.execute(
            "UPDATE OR REPLACE rules SET identifier = ?1 WHERE identifier = ?2 AND type = ?3",
            params![canonical, identifier, RuleType::SigningId.code()],
        )?;
    }
    Ok(())
}

fn migrate_v4_cel_expression(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    add_column_if_missing(tx, "cel_expr", "TEXT")
}

fn add_column_if_missing(
    tx: &Transaction<'_>,
    column: &str,
    definition: &str,
) -> rusqlite::Result<()> {
    if has_column(tx, column)? {
        return Ok(());
    }
    tx.execute(
        &format!("ALTER TABLE rules ADD COLUMN {column} {definition}"),
        [],
    )?;
    Ok(())
}

fn has_column(tx: &Transaction<'_>, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = tx.prepare("SELECT name FROM pragma_table_info('rules')")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
