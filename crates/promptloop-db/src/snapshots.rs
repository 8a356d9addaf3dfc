use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::MutexGuard;

use crate::parse_timestamp;

/// Derived performance record for one evaluated iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub iteration_id: i64,
    /// The Active iteration the score was compared against
    pub baseline_id: Option<i64>,
    pub aggregate_score: f64,
    pub baseline_score: Option<f64>,
    /// `aggregate_score - baseline_score`, kept even when the candidate lost
    pub delta: Option<f64>,
    pub report: String, // JSON: per-persona scores, dimension summary, suggestions
    pub created_at: DateTime<Utc>,
}

/// Snapshots store with a borrowed connection.
pub struct Snapshots<'db> {
    conn: MutexGuard<'db, Connection>,
}

const COLUMNS: &str =
    "iteration_id, baseline_id, aggregate_score, baseline_score, delta, report, created_at";

impl<'db> Snapshots<'db> {
    pub(crate) fn new(conn: MutexGuard<'db, Connection>) -> Self {
        Self { conn }
    }

    /// Save a snapshot (insert or replace for the iteration).
    pub fn save(&self, record: &SnapshotRecord) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            r#"
            INSERT INTO performance_snapshots (iteration_id, baseline_id, aggregate_score, baseline_score, delta, report, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(iteration_id) DO UPDATE SET
                baseline_id = excluded.baseline_id,
                aggregate_score = excluded.aggregate_score,
                baseline_score = excluded.baseline_score,
                delta = excluded.delta,
                report = excluded.report
            "#,
            params![
                record.iteration_id,
                record.baseline_id,
                record.aggregate_score,
                record.baseline_score,
                record.delta,
                record.report,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, iteration_id: i64) -> Result<Option<SnapshotRecord>, rusqlite::Error> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM performance_snapshots WHERE iteration_id = ?1",
                    COLUMNS
                ),
                params![iteration_id],
                Self::row_to_record,
            )
            .optional()
    }

    /// All snapshots, oldest iteration first.
    pub fn list(&self) -> Result<Vec<SnapshotRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM performance_snapshots ORDER BY iteration_id",
            COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }

        Ok(records)
    }

    fn row_to_record(row: &rusqlite::Row) -> Result<SnapshotRecord, rusqlite::Error> {
        let created_at_str: String = row.get(6)?;

        Ok(SnapshotRecord {
            iteration_id: row.get(0)?,
            baseline_id: row.get(1)?,
            aggregate_score: row.get(2)?,
            baseline_score: row.get(3)?,
            delta: row.get(4)?,
            report: row.get(5)?,
            created_at: parse_timestamp(&created_at_str),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{Database, IterationStatus, SnapshotRecord};
    use chrono::Utc;

    #[test]
    fn test_snapshot_keeps_negative_delta() {
        let db = Database::open_in_memory().unwrap();
        let seed = db
            .iterations()
            .insert_seed("p", "h", Utc::now())
            .unwrap()
            .unwrap();
        let candidate = db
            .iterations()
            .insert("q", "h2", Some(seed), IterationStatus::RolledBack, Utc::now())
            .unwrap();

        db.snapshots()
            .save(&SnapshotRecord {
                iteration_id: candidate,
                baseline_id: Some(seed),
                aggregate_score: 6.0,
                baseline_score: Some(7.2),
                delta: Some(6.0 - 7.2),
                report: "{}".to_string(),
                created_at: Utc::now(),
            })
            .unwrap();

        let stored = db.snapshots().get(candidate).unwrap().unwrap();
        assert!((stored.delta.unwrap() + 1.2).abs() < 1e-9);
        assert_eq!(db.snapshots().list().unwrap().len(), 1);
    }
}
