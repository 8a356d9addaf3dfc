//! Bot iteration store.
//!
//! Status writes go through compare-and-set updates so a transition only
//! lands when the row is still in the expected state. Promotion demotes the
//! current Active row and activates the candidate in one transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::MutexGuard;

use crate::{parse_timestamp, ValidationRecord};

/// Lifecycle state of a bot iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Candidate,
    Validated,
    Active,
    Superseded,
    RolledBack,
}

impl IterationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationStatus::Candidate => "candidate",
            IterationStatus::Validated => "validated",
            IterationStatus::Active => "active",
            IterationStatus::Superseded => "superseded",
            IterationStatus::RolledBack => "rolled_back",
        }
    }

    /// Superseded and RolledBack never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IterationStatus::Superseded | IterationStatus::RolledBack
        )
    }
}

impl std::fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IterationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "candidate" => Ok(IterationStatus::Candidate),
            "validated" => Ok(IterationStatus::Validated),
            "active" => Ok(IterationStatus::Active),
            "superseded" => Ok(IterationStatus::Superseded),
            "rolled_back" => Ok(IterationStatus::RolledBack),
            other => Err(format!("Unknown iteration status: {}", other)),
        }
    }
}

/// A stored bot iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    /// Version number; strictly increasing with creation order
    pub id: i64,
    pub prompt_text: String,
    /// SHA-256 hex digest of `prompt_text`
    pub prompt_hash: String,
    pub parent_id: Option<i64>,
    pub status: IterationStatus,
    /// Why the iteration reached its current status (rollbacks)
    pub status_reason: Option<String>,
    pub aggregate_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Result of an attempted promotion transaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Promotion {
    /// The candidate is Active; `superseded_id` was demoted in the same step
    Promoted { superseded_id: i64 },
    /// The candidate was not in Validated state; nothing changed
    NotValidated,
    /// Found a number of Active rows other than one; nothing changed
    ActiveCount(usize),
}

const COLUMNS: &str =
    "id, prompt_text, prompt_hash, parent_id, status, status_reason, aggregate_score, created_at";

/// Iterations store with a borrowed connection.
pub struct Iterations<'db> {
    conn: MutexGuard<'db, Connection>,
}

impl<'db> Iterations<'db> {
    pub(crate) fn new(conn: MutexGuard<'db, Connection>) -> Self {
        Self { conn }
    }

    /// Insert a new iteration and return its version number.
    pub fn insert(
        &self,
        prompt_text: &str,
        prompt_hash: &str,
        parent_id: Option<i64>,
        status: IterationStatus,
        created_at: DateTime<Utc>,
    ) -> Result<i64, rusqlite::Error> {
        self.conn.execute(
            r#"
            INSERT INTO bot_iterations (prompt_text, prompt_hash, parent_id, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                prompt_text,
                prompt_hash,
                parent_id,
                status.as_str(),
                created_at.to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Insert an Active seed iteration if the table is empty.
    ///
    /// Returns `None` when any iteration already exists.
    pub fn insert_seed(
        &self,
        prompt_text: &str,
        prompt_hash: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Option<i64>, rusqlite::Error> {
        let tx = self.conn.unchecked_transaction()?;
        let existing: i64 = tx.query_row("SELECT COUNT(*) FROM bot_iterations", [], |r| r.get(0))?;
        if existing > 0 {
            return Ok(None);
        }
        tx.execute(
            r#"
            INSERT INTO bot_iterations (prompt_text, prompt_hash, parent_id, status, created_at)
            VALUES (?1, ?2, NULL, 'active', ?3)
            "#,
            params![prompt_text, prompt_hash, created_at.to_rfc3339()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Some(id))
    }

    /// Get an iteration by version number.
    pub fn get(&self, id: i64) -> Result<Option<IterationRecord>, rusqlite::Error> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM bot_iterations WHERE id = ?1", COLUMNS),
                params![id],
                Self::row_to_record,
            )
            .optional()
    }

    /// All Active iterations; healthy storage holds exactly one.
    pub fn active(&self) -> Result<Vec<IterationRecord>, rusqlite::Error> {
        self.with_status(IterationStatus::Active)
    }

    pub fn with_status(
        &self,
        status: IterationStatus,
    ) -> Result<Vec<IterationRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM bot_iterations WHERE status = ?1 ORDER BY id",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.as_str()], Self::row_to_record)?;
        rows.collect()
    }

    /// List every iteration, oldest first.
    pub fn list(&self) -> Result<Vec<IterationRecord>, rusqlite::Error> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM bot_iterations ORDER BY id", COLUMNS))?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        rows.collect()
    }

    pub fn count(&self) -> Result<usize, rusqlite::Error> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM bot_iterations", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    pub fn count_with_status(&self, status: IterationStatus) -> Result<usize, rusqlite::Error> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM bot_iterations WHERE status = ?1",
            params![status.as_str()],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Move an iteration from `from` to `to`.
    ///
    /// Returns false (and writes nothing) if the row is not currently in
    /// `from`.
    pub fn transition(
        &self,
        id: i64,
        from: IterationStatus,
        to: IterationStatus,
        reason: Option<&str>,
    ) -> Result<bool, rusqlite::Error> {
        let rows = self.conn.execute(
            "UPDATE bot_iterations SET status = ?1, status_reason = ?2 WHERE id = ?3 AND status = ?4",
            params![to.as_str(), reason, id, from.as_str()],
        )?;
        Ok(rows == 1)
    }

    /// Move an iteration between statuses and attach its validation result
    /// in one transaction. Returns false, writing nothing, if the iteration
    /// is not in `from`.
    pub fn record_validation(
        &self,
        from: IterationStatus,
        to: IterationStatus,
        reason: Option<&str>,
        validation: &ValidationRecord,
    ) -> Result<bool, rusqlite::Error> {
        let tx = self.conn.unchecked_transaction()?;

        let rows = tx.execute(
            "UPDATE bot_iterations SET status = ?1, status_reason = ?2 WHERE id = ?3 AND status = ?4",
            params![to.as_str(), reason, validation.iteration_id, from.as_str()],
        )?;
        if rows != 1 {
            return Ok(false);
        }

        tx.execute(
            r#"
            INSERT INTO validation_results (iteration_id, passed, result, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                validation.iteration_id,
                validation.passed,
                validation.result,
                validation.created_at.to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok(true)
    }

    /// Record the aggregate evaluation score of an iteration.
    pub fn set_score(&self, id: i64, score: f64) -> Result<bool, rusqlite::Error> {
        let rows = self.conn.execute(
            "UPDATE bot_iterations SET aggregate_score = ?1 WHERE id = ?2",
            params![score, id],
        )?;
        Ok(rows == 1)
    }

    /// Record a score only if the iteration has none yet. Returns false when
    /// the iteration is missing or already scored.
    pub fn set_score_if_unscored(&self, id: i64, score: f64) -> Result<bool, rusqlite::Error> {
        let rows = self.conn.execute(
            "UPDATE bot_iterations SET aggregate_score = ?1 WHERE id = ?2 AND aggregate_score IS NULL",
            params![score, id],
        )?;
        Ok(rows == 1)
    }

    /// Demote the Active iteration and activate `candidate_id` atomically.
    ///
    /// The candidate must be Validated and exactly one Active row must
    /// exist; otherwise the transaction is dropped and nothing changes.
    pub fn promote(&self, candidate_id: i64) -> Result<Promotion, rusqlite::Error> {
        let tx = self.conn.unchecked_transaction()?;

        let mut stmt = tx.prepare("SELECT id FROM bot_iterations WHERE status = 'active'")?;
        let active: Vec<i64> = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        if active.len() != 1 {
            return Ok(Promotion::ActiveCount(active.len()));
        }
        let superseded_id = active[0];

        let activated = tx.execute(
            "UPDATE bot_iterations SET status = 'active', status_reason = NULL WHERE id = ?1 AND status = 'validated'",
            params![candidate_id],
        )?;
        if activated != 1 {
            return Ok(Promotion::NotValidated);
        }

        tx.execute(
            "UPDATE bot_iterations SET status = 'superseded', status_reason = ?1 WHERE id = ?2",
            params![format!("superseded by iteration {}", candidate_id), superseded_id],
        )?;

        tx.commit()?;
        Ok(Promotion::Promoted { superseded_id })
    }

    fn row_to_record(row: &rusqlite::Row) -> Result<IterationRecord, rusqlite::Error> {
        let status_str: String = row.get(4)?;
        let created_at_str: String = row.get(7)?;

        Ok(IterationRecord {
            id: row.get(0)?,
            prompt_text: row.get(1)?,
            prompt_hash: row.get(2)?,
            parent_id: row.get(3)?,
            status: status_str.parse().map_err(|e: String| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?,
            status_reason: row.get(5)?,
            aggregate_score: row.get(6)?,
            created_at: parse_timestamp(&created_at_str),
        })
    }
}
