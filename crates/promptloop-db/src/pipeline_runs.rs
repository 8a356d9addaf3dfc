use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::MutexGuard;

use crate::parse_timestamp;

/// One invocation of the pipeline for a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRunRecord {
    pub id: String,
    pub call_id: String,
    pub candidate_id: Option<i64>,
    pub outcome: Option<String>, // JSON of the pipeline outcome
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Pipeline run log with a borrowed connection.
pub struct PipelineRuns<'db> {
    conn: MutexGuard<'db, Connection>,
}

impl<'db> PipelineRuns<'db> {
    pub(crate) fn new(conn: MutexGuard<'db, Connection>) -> Self {
        Self { conn }
    }

    pub fn start(
        &self,
        id: &str,
        call_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO pipeline_runs (id, call_id, started_at) VALUES (?1, ?2, ?3)",
            params![id, call_id, started_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn finish(
        &self,
        id: &str,
        candidate_id: Option<i64>,
        outcome: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, rusqlite::Error> {
        let rows = self.conn.execute(
            "UPDATE pipeline_runs SET candidate_id = ?1, outcome = ?2, finished_at = ?3 WHERE id = ?4",
            params![candidate_id, outcome, finished_at.to_rfc3339(), id],
        )?;
        Ok(rows == 1)
    }

    pub fn get(&self, id: &str) -> Result<Option<PipelineRunRecord>, rusqlite::Error> {
        self.conn
            .query_row(
                "SELECT id, call_id, candidate_id, outcome, started_at, finished_at FROM pipeline_runs WHERE id = ?1",
                params![id],
                Self::row_to_record,
            )
            .optional()
    }

    /// Most recent finished run for a call.
    pub fn latest_for_call(
        &self,
        call_id: &str,
    ) -> Result<Option<PipelineRunRecord>, rusqlite::Error> {
        self.conn
            .query_row(
                r#"
                SELECT id, call_id, candidate_id, outcome, started_at, finished_at
                FROM pipeline_runs
                WHERE call_id = ?1 AND finished_at IS NOT NULL
                ORDER BY finished_at DESC
                LIMIT 1
                "#,
                params![call_id],
                Self::row_to_record,
            )
            .optional()
    }

    fn row_to_record(row: &rusqlite::Row) -> Result<PipelineRunRecord, rusqlite::Error> {
        let started_at_str: String = row.get(4)?;
        let finished_at_str: Option<String> = row.get(5)?;

        Ok(PipelineRunRecord {
            id: row.get(0)?,
            call_id: row.get(1)?,
            candidate_id: row.get(2)?,
            outcome: row.get(3)?,
            started_at: parse_timestamp(&started_at_str),
            finished_at: finished_at_str.as_deref().map(parse_timestamp),
        })
    }
}
