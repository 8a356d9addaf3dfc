//! Evaluation runs store. One row per (iteration, persona); a scored row is
//! never replaced, a failed one may be replaced by a later attempt.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::MutexGuard;

use crate::parse_timestamp;

/// A stored evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRunRecord {
    pub id: String,
    pub iteration_id: i64,
    pub persona_id: String,
    pub transcript: String, // JSON array of turns
    pub completion: String,
    /// `scored` or `failed`
    pub status: String,
    pub scorecard: Option<String>, // JSON scorecard when scored
    pub aggregate_score: Option<f64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Evaluation runs store with a borrowed connection.
pub struct EvaluationRuns<'db> {
    conn: MutexGuard<'db, Connection>,
}

impl<'db> EvaluationRuns<'db> {
    pub(crate) fn new(conn: MutexGuard<'db, Connection>) -> Self {
        Self { conn }
    }

    /// Insert a run. Returns false if the (iteration, persona) pair already
    /// has a scored run; that row wins. A failed row is overwritten.
    pub fn insert(&self, record: &EvaluationRunRecord) -> Result<bool, rusqlite::Error> {
        let rows = self.conn.execute(
            r#"
            INSERT INTO evaluation_runs
                (id, iteration_id, persona_id, transcript, completion, status, scorecard, aggregate_score, error, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(iteration_id, persona_id) DO UPDATE SET
                id = excluded.id,
                transcript = excluded.transcript,
                completion = excluded.completion,
                status = excluded.status,
                scorecard = excluded.scorecard,
                aggregate_score = excluded.aggregate_score,
                error = excluded.error,
                created_at = excluded.created_at
            WHERE evaluation_runs.status = 'failed'
            "#,
            params![
                record.id,
                record.iteration_id,
                record.persona_id,
                record.transcript,
                record.completion,
                record.status,
                record.scorecard,
                record.aggregate_score,
                record.error,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(rows == 1)
    }

    /// All runs for an iteration, ordered by persona id.
    pub fn list_for_iteration(
        &self,
        iteration_id: i64,
    ) -> Result<Vec<EvaluationRunRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, iteration_id, persona_id, transcript, completion, status, scorecard, aggregate_score, error, created_at
            FROM evaluation_runs
            WHERE iteration_id = ?1
            ORDER BY persona_id
            "#,
        )?;
        let rows = stmt.query_map(params![iteration_id], Self::row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }

        Ok(records)
    }

    fn row_to_record(row: &rusqlite::Row) -> Result<EvaluationRunRecord, rusqlite::Error> {
        let created_at_str: String = row.get(9)?;

        Ok(EvaluationRunRecord {
            id: row.get(0)?,
            iteration_id: row.get(1)?,
            persona_id: row.get(2)?,
            transcript: row.get(3)?,
            completion: row.get(4)?,
            status: row.get(5)?,
            scorecard: row.get(6)?,
            aggregate_score: row.get(7)?,
            error: row.get(8)?,
            created_at: parse_timestamp(&created_at_str),
        })
    }
}
