//! `SQLite`-backed rule store with transactional batch mutation.

// SQLite returns i64 for counts; they're always non-negative here.
// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(clippy::cast_sign_loss, clippy::missing_panics_doc)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use thiserror::Error;

use super::{cache_policy, digest, migrations};
use crate::cel::{CelPolicyEvaluator, EvalError, PolicyEvaluator};
use crate::config::CullConfig;
use crate::rule::{RuleError, RuleIdentifierSet, RuleRecord, RuleState, RuleType};

/// Errors from rule-store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuleStoreError {
    /// An empty batch was submitted without a cleanup mode to give it
    /// meaning.
    #[error("empty rule batch requires a cleanup mode")]
    EmptyRuleBatch,

    /// A record in the batch failed validation. Nothing was written.
    #[error("invalid rule {identifier:?}: {source}")]
    RuleInvalid {
        /// Identifier of the offending record, as submitted.
        identifier: String,
        /// The validation failure.
        #[source]
        source: RuleError,
    },

    /// A CEL record's expression failed to compile. Nothing was written.
    #[error("invalid expression on rule {identifier:?}: {source}")]
    RuleInvalidExpression {
        /// Identifier of the offending record.
        identifier: String,
        /// The compile failure.
        #[source]
        source: EvalError,
    },

    /// A tombstone delete failed mid-transaction; the batch rolled back.
    #[error("failed to remove rule {identifier:?}: {source}")]
    RemoveRuleFailed {
        /// Identifier of the record being removed.
        identifier: String,
        /// The underlying database error.
        #[source]
        source: rusqlite::Error,
    },

    /// An insert failed mid-transaction; the batch rolled back.
    #[error("failed to insert or replace rule {identifier:?}: {source}")]
    InsertOrReplaceRuleFailed {
        /// Identifier of the record being inserted.
        identifier: String,
        /// The underlying database error.
        #[source]
        source: rusqlite::Error,
    },

    /// Database error outside per-row apply (open, migrate, query).
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// What to delete before applying a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleCleanup {
    /// Apply the batch as-is.
    None,
    /// Delete every existing rule first.
    All,
    /// Delete every existing rule except transitive allows first.
    NonTransitive,
}

/// Result of a committed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct AddRulesOutcome {
    /// Whether the downstream decision cache must be flushed to avoid
    /// serving stale verdicts.
    pub flush_decision_cache: bool,
}

/// Durable, schema-versioned storage of [`RuleRecord`] rows, unique on
/// `(identifier, type)`.
///
/// All access — reads, writes, the digest memo, and the cull rate-limit —
/// is serialized through a single `Mutex`: strictly one operation at a
/// time, trading read concurrency for transactional simplicity. Callers
/// block until their turn; latency bounds are imposed outside the engine.
pub struct RuleStore {
    inner: Mutex<StoreInner>,
    evaluator: Arc<dyn PolicyEvaluator>,
    cull: CullConfig,
}

struct StoreInner {
    conn: Connection,
    schema_version: i64,
    digest_memo: Option<String>,
    last_cull: Option<Instant>,
}

impl RuleStore {
    /// Opens or creates a rule store at `path` and migrates it to the
    /// current schema version. The evaluator is used to validate CEL
    /// expressions at write time.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(
        path: impl AsRef<Path>,
        evaluator: Arc<dyn PolicyEvaluator>,
    ) -> Result<Self, RuleStoreError> {
        Self::open_with_config(path, evaluator, CullConfig::default())
    }

    /// Opens a store with explicit culling configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open_with_config(
        path: impl AsRef<Path>,
        evaluator: Arc<dyn PolicyEvaluator>,
        cull: CullConfig,
    ) -> Result<Self, RuleStoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::from_connection(conn, evaluator, cull)
    }

    /// Creates an in-memory store with the default CEL evaluator, for
    /// testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, RuleStoreError> {
        Self::in_memory_with_config(CullConfig::default())
    }

    /// Creates an in-memory store with explicit culling configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory_with_config(cull: CullConfig) -> Result<Self, RuleStoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, Arc::new(CelPolicyEvaluator::new()), cull)
    }

    fn from_connection(
        mut conn: Connection,
        evaluator: Arc<dyn PolicyEvaluator>,
        cull: CullConfig,
    ) -> Result<Self, RuleStoreError> {
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        let schema_version = migrations::migrate(&mut conn)?;

        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn,
                schema_version,
                digest_memo: None,
                last_cull: None,
            }),
            evaluator,
            cull,
        })
    }

    /// The schema version the store was migrated to at open.
    #[must_use]
    pub fn schema_version(&self) -> i64 {
        self.inner.lock().unwrap().schema_version
    }

    /// Applies a batch of rules in one transaction.
    ///
    /// Every record is validated (and CEL expressions compiled) before any
    /// row is touched; the first invalid record fails the whole batch with
    /// zero rows changed. Tombstones delete their `(identifier, type)`
    /// row; everything else is inserted with replace semantics. The
    /// cache-flush verdict is computed against pre-commit state inside the
    /// same transaction. On commit the digest memo is invalidated.
    ///
    /// An empty batch is only meaningful with a cleanup mode: it expresses
    /// "wipe rules without adding any".
    ///
    /// # Errors
    ///
    /// Returns a [`RuleStoreError`]; on any error the store is unchanged.
    pub fn add_rules(
        &self,
        batch: &[RuleRecord],
        cleanup: RuleCleanup,
    ) -> Result<AddRulesOutcome, RuleStoreError> {
        if batch.is_empty() && cleanup == RuleCleanup::None {
            return Err(RuleStoreError::EmptyRuleBatch);
        }
        let batch = self.validate_batch(batch)?;

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let tx = inner.conn.transaction()?;

        let mut flush = cache_policy::batch_requires_flush(&tx, &batch)?;
        match cleanup {
            RuleCleanup::None => {}
            RuleCleanup::All => {
                tx.execute("DELETE FROM rules", [])?;
                flush = true;
            }
            RuleCleanup::NonTransitive => {
                tx.execute(
                    "DELETE FROM rules WHERE state != ?1",
                    params![RuleState::AllowTransitive.code()],
                )?;
                flush = true;
            }
        }

        let now = unix_now();
        for rule in &batch {
            if rule.state == RuleState::Remove {
                tx.execute(
                    "DELETE FROM rules WHERE identifier = ?1 AND type = ?2",
                    params![rule.identifier, rule.rule_type.code()],
                )
                .map_err(|source| RuleStoreError::RemoveRuleFailed {
                    identifier: rule.identifier.clone(),
                    source,
                })?;
            } else {
                let timestamp = if rule.timestamp > 0 {
                    rule.timestamp
                } else {
                    now
                };
                tx.execute(
                    "INSERT OR REPLACE INTO rules
                     (identifier, state, type, custommsg, customurl, timestamp, comment, cel_expr)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        rule.identifier,
                        rule.state.code(),
                        rule.rule_type.code(),
                        rule.custom_msg,
                        rule.custom_url,
                        timestamp,
                        rule.comment,
                        rule.expression,
                    ],
                )
                .map_err(|source| RuleStoreError::InsertOrReplaceRuleFailed {
                    identifier: rule.identifier.clone(),
                    source,
                })?;
            }
        }

        tx.commit()?;
        inner.digest_memo = None;

        Ok(AddRulesOutcome {
            flush_decision_cache: flush,
        })
    }

    /// Evaluates the cache-invalidation heuristic for a batch without
    /// applying it. Answers "would committing this batch require a
    /// decision-cache flush against the store as it stands".
    ///
    /// # Errors
    ///
    /// Returns an error if a record fails validation or a probe query
    /// fails.
    pub fn rules_require_cache_flush(
        &self,
        batch: &[RuleRecord],
    ) -> Result<bool, RuleStoreError> {
        let batch = self.validate_batch(batch)?;
        let guard = self.inner.lock().unwrap();
        Ok(cache_policy::batch_requires_flush(&guard.conn, &batch)?)
    }

    fn validate_batch(&self, batch: &[RuleRecord]) -> Result<Vec<RuleRecord>, RuleStoreError> {
        let mut validated = Vec::with_capacity(batch.len());
        for rule in batch {
            let rule = rule
                .normalized()
                .map_err(|source| RuleStoreError::RuleInvalid {
                    identifier: rule.identifier.clone(),
                    source,
                })?;
            if rule.state == RuleState::Cel {
                let source_text = rule.expression.as_deref().unwrap_or_default();
                self.evaluator.compile(source_text).map_err(|source| {
                    RuleStoreError::RuleInvalidExpression {
                        identifier: rule.identifier.clone(),
                        source,
                    }
                })?;
            }
            validated.push(rule);
        }
        Ok(validated)
    }

    /// Total number of rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn rule_count(&self) -> Result<u64, RuleStoreError> {
        self.count("SELECT COUNT(*) FROM rules", &[])
    }

    /// Number of rules of one type.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn rule_count_by_type(&self, rule_type: RuleType) -> Result<u64, RuleStoreError> {
        self.count(
            "SELECT COUNT(*) FROM rules WHERE type = ?1",
            &[&rule_type.code()],
        )
    }

    /// Number of compiler-allow rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn compiler_rule_count(&self) -> Result<u64, RuleStoreError> {
        self.count(
            "SELECT COUNT(*) FROM rules WHERE state = ?1",
            &[&RuleState::AllowCompiler.code()],
        )
    }

    /// Number of transitive-allow rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn transitive_rule_count(&self) -> Result<u64, RuleStoreError> {
        self.count(
            "SELECT COUNT(*) FROM rules WHERE state = ?1",
            &[&RuleState::AllowTransitive.code()],
        )
    }

    fn count(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<u64, RuleStoreError> {
        let guard = self.inner.lock().unwrap();
        let count: i64 = guard.conn.query_row(sql, params, |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Full scan of every rule in storage (rowid) order, for export and
    /// audit.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn retrieve_all_rules(&self) -> Result<Vec<RuleRecord>, RuleStoreError> {
        let guard = self.inner.lock().unwrap();
        let mut stmt = guard.conn.prepare(
            "SELECT identifier, state, type, custommsg, customurl, timestamp, comment, cel_expr
             FROM rules
             ORDER BY rowid ASC",
        )?;
        let rules = stmt
            .query_map([], row_to_rule)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// Returns the single highest-precedence rule matching any identifier
    /// in the set, each compared only against its own type code. Type
    /// codes are the precedence ranks, so the explicit `ORDER BY type`
    /// is the precedence selection; ties are impossible because
    /// `(identifier, type)` is unique.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn rule_for_identifiers(
        &self,
        ids: &RuleIdentifierSet,
    ) -> Result<Option<RuleRecord>, RuleStoreError> {
        let ids = ids.normalized();
        let guard = self.inner.lock().unwrap();
        let mut stmt = guard.conn.prepare_cached(
            "SELECT identifier, state, type, custommsg, customurl, timestamp, comment, cel_expr
             FROM rules
             WHERE (identifier = ?1 AND type = 500)
                OR (identifier = ?2 AND type = 1000)
                OR (identifier = ?3 AND type = 2000)
                OR (identifier = ?4 AND type = 3000)
                OR (identifier = ?5 AND type = 4000)
             ORDER BY type ASC
             LIMIT 1",
        )?;
        let rule = stmt
            .query_row(
                params![
                    ids.cdhash,
                    ids.binary_sha256,
                    ids.signing_id,
                    ids.certificate_sha256,
                    ids.team_id
                ],
                row_to_rule,
            )
            .optional()?;
        Ok(rule)
    }

    /// Marks a transitive rule as recently exercised so it survives
    /// culling. Only the timestamp column is touched. Best-effort:
    /// failures are logged, never surfaced.
    pub fn reset_timestamp(&self, rule: &RuleRecord) {
        let now = unix_now();
        let guard = self.inner.lock().unwrap();
        if let Err(error) = guard.conn.execute(
            "UPDATE rules SET timestamp = ?1 WHERE identifier = ?2 AND type = ?3",
            params![now, rule.identifier, rule.rule_type.code()],
        ) {
            tracing::warn!(
                identifier = %rule.identifier,
                %error,
                "failed to refresh rule timestamp"
            );
        }
    }

    /// Deletes stale transitive-allow rules.
    ///
    /// Advisory hygiene triggered opportunistically by callers: a run is
    /// skipped unless the configured minimum interval has elapsed since
    /// the previous attempt, and unless total rule count has reached the
    /// configured floor. Surviving rules are those exercised (timestamp
    /// refreshed) within the retention window. Failures are logged and
    /// swallowed.
    pub fn remove_outdated_transitive_rules(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        if let Some(last) = inner.last_cull {
            if last.elapsed() < Duration::from_secs(self.cull.min_interval_secs) {
                return;
            }
        }
        inner.last_cull = Some(Instant::now());

        let total: i64 = match inner
            .conn
            .query_row("SELECT COUNT(*) FROM rules", [], |row| row.get(0))
        {
            Ok(total) => total,
            Err(error) => {
                tracing::warn!(%error, "transitive rule cull skipped: count query failed");
                return;
            }
        };
        if (total as u64) < self.cull.min_rule_count {
            return;
        }

        let cutoff = unix_now() - self.cull.retention_secs as i64;
        match inner.conn.execute(
            "DELETE FROM rules WHERE state = ?1 AND timestamp < ?2",
            params![RuleState::AllowTransitive.code(), cutoff],
        ) {
            Ok(removed) if removed > 0 => {
                tracing::debug!(removed, "culled stale transitive rules");
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(%error, "transitive rule cull failed");
            }
        }
    }

    /// Content digest over all non-transitive rules, memoized until the
    /// next successful mutation.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub fn rules_digest(&self) -> Result<String, RuleStoreError> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(memo) = &guard.digest_memo {
            return Ok(memo.clone());
        }
        let digest = digest::digest_rules(&guard.conn)?;
        guard.digest_memo = Some(digest.clone());
        Ok(digest)
    }
}

fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<RuleRecord> {
    let expression: Option<String> = row.get(7)?;
    Ok(RuleRecord {
        identifier: row.get(0)?,
        state: RuleState::from_code(row.get(1)?),
        rule_type: RuleType::from_code(row.get(2)?),
        custom_msg: row.get(3)?,
        custom_url: row.get(4)?,
        timestamp: row.get(5)?,
        comment: row.get(6)?,
        expression: expression.filter(|e| !e.is_empty()),
    })
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
