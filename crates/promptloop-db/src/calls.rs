//! Calls store. Calls arrive from the transcript feed and are never mutated.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::MutexGuard;

use crate::parse_timestamp;

/// A stored call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub transcript: String, // JSON array of transcript segments
    pub risk_tags: String,  // JSON array of risk tags
    pub timestamp: DateTime<Utc>,
    pub active_iteration_id: Option<i64>,
}

/// Filter options for listing calls.
#[derive(Debug, Default, Clone)]
pub struct CallFilter {
    /// Only calls without a finished pipeline run
    pub unprocessed: bool,
    pub limit: Option<usize>,
}

/// Calls store with a borrowed connection.
pub struct Calls<'db> {
    conn: MutexGuard<'db, Connection>,
}

impl<'db> Calls<'db> {
    pub(crate) fn new(conn: MutexGuard<'db, Connection>) -> Self {
        Self { conn }
    }

    /// Store a call. Returns false if a call with this id already exists,
    /// in which case the stored record is left untouched.
    pub fn insert(&self, record: &CallRecord) -> Result<bool, rusqlite::Error> {
        let rows = self.conn.execute(
            r#"
            INSERT INTO calls (id, transcript, risk_tags, timestamp, active_iteration_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![
                record.id,
                record.transcript,
                record.risk_tags,
                record.timestamp.to_rfc3339(),
                record.active_iteration_id,
            ],
        )?;
        Ok(rows == 1)
    }

    /// Get a call by ID.
    pub fn get(&self, id: &str) -> Result<Option<CallRecord>, rusqlite::Error> {
        self.conn
            .query_row(
                "SELECT id, transcript, risk_tags, timestamp, active_iteration_id FROM calls WHERE id = ?1",
                params![id],
                Self::row_to_record,
            )
            .optional()
    }

    /// List calls, newest first.
    pub fn list(&self, filter: &CallFilter) -> Result<Vec<CallRecord>, rusqlite::Error> {
        let mut sql = String::from(
            "SELECT id, transcript, risk_tags, timestamp, active_iteration_id FROM calls WHERE 1=1",
        );

        if filter.unprocessed {
            sql.push_str(
                " AND NOT EXISTS (SELECT 1 FROM pipeline_runs p WHERE p.call_id = calls.id AND p.finished_at IS NOT NULL)",
            );
        }

        sql.push_str(" ORDER BY timestamp DESC");

        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }

        Ok(records)
    }

    fn row_to_record(row: &rusqlite::Row) -> Result<CallRecord, rusqlite::Error> {
        let timestamp_str: String = row.get(3)?;

        Ok(CallRecord {
            id: row.get(0)?,
            transcript: row.get(1)?,
            risk_tags: row.get(2)?,
            timestamp: parse_timestamp(&timestamp_str),
            active_iteration_id: row.get(4)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{CallFilter, CallRecord, Database};
    use chrono::{Duration, Utc};

    fn call(id: &str, minutes_ago: i64) -> CallRecord {
        CallRecord {
            id: id.to_string(),
            transcript: r#"[{"speaker":"agent","text":"Hello"}]"#.to_string(),
            risk_tags: r#"["financial_hardship"]"#.to_string(),
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
            active_iteration_id: Some(1),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.calls().insert(&call("room-1", 5)).unwrap());

        let stored = db.calls().get("room-1").unwrap().unwrap();
        assert_eq!(stored.risk_tags, r#"["financial_hardship"]"#);
        assert_eq!(stored.active_iteration_id, Some(1));
        assert!(db.calls().get("room-2").unwrap().is_none());
    }

    #[test]
    fn test_calls_are_immutable() {
        let db = Database::open_in_memory().unwrap();
        db.calls().insert(&call("room-1", 5)).unwrap();

        let mut changed = call("room-1", 0);
        changed.risk_tags = "[]".to_string();
        assert!(!db.calls().insert(&changed).unwrap());
        assert_eq!(
            db.calls().get("room-1").unwrap().unwrap().risk_tags,
            r#"["financial_hardship"]"#
        );
    }

    #[test]
    fn test_list_newest_first_with_limit() {
        let db = Database::open_in_memory().unwrap();
        db.calls().insert(&call("old", 30)).unwrap();
        db.calls().insert(&call("new", 1)).unwrap();
        db.calls().insert(&call("mid", 10)).unwrap();

        let listed = db
            .calls()
            .list(&CallFilter {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<_> = listed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);
    }

    #[test]
    fn test_unprocessed_filter() {
        let db = Database::open_in_memory().unwrap();
        db.calls().insert(&call("done", 10)).unwrap();
        db.calls().insert(&call("pending", 5)).unwrap();
        db.calls().insert(&call("crashed", 1)).unwrap();

        let now = Utc::now();
        db.pipeline_runs().start("run-1", "done", now).unwrap();
        db.pipeline_runs()
            .finish("run-1", None, r#"{"status":"promoted"}"#, now)
            .unwrap();
        // Started but never finished; still eligible
        db.pipeline_runs().start("run-2", "crashed", now).unwrap();

        let pending = db
            .calls()
            .list(&CallFilter {
                unprocessed: true,
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<_> = pending.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["crashed", "pending"]);
    }
}
