use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::MutexGuard;

use crate::parse_timestamp;

/// A stored validation result, attached to one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub iteration_id: i64,
    pub passed: bool,
    pub result: String, // JSON of the full validation result
    pub created_at: DateTime<Utc>,
}

/// Validation results store with a borrowed connection. Rows are written
/// together with the status change, see `Iterations::record_validation`.
pub struct Validations<'db> {
    conn: MutexGuard<'db, Connection>,
}

impl<'db> Validations<'db> {
    pub(crate) fn new(conn: MutexGuard<'db, Connection>) -> Self {
        Self { conn }
    }

    pub fn get(&self, iteration_id: i64) -> Result<Option<ValidationRecord>, rusqlite::Error> {
        self.conn
            .query_row(
                "SELECT iteration_id, passed, result, created_at FROM validation_results WHERE iteration_id = ?1",
                params![iteration_id],
                |row| {
                    let created_at_str: String = row.get(3)?;
                    Ok(ValidationRecord {
                        iteration_id: row.get(0)?,
                        passed: row.get(1)?,
                        result: row.get(2)?,
                        created_at: parse_timestamp(&created_at_str),
                    })
                },
            )
            .optional()
    }
}

#[cfg(test)]
mod tests {
    use crate::{Database, IterationStatus, ValidationRecord};
    use chrono::Utc;

    #[test]
    fn test_validation_is_read_back() {
        let db = Database::open_in_memory().unwrap();
        let seed = db
            .iterations()
            .insert_seed("p", "h", Utc::now())
            .unwrap()
            .unwrap();
        let id = db
            .iterations()
            .insert("c", "h1", Some(seed), IterationStatus::Candidate, Utc::now())
            .unwrap();
        assert!(db.validations().get(id).unwrap().is_none());

        let record = ValidationRecord {
            iteration_id: id,
            passed: false,
            result: r#"{"violations":["length"]}"#.to_string(),
            created_at: Utc::now(),
        };
        assert!(db
            .iterations()
            .record_validation(
                IterationStatus::Candidate,
                IterationStatus::RolledBack,
                Some("validation failed: length"),
                &record,
            )
            .unwrap());

        let stored = db.validations().get(id).unwrap().unwrap();
        assert!(!stored.passed);
        assert!(stored.result.contains("length"));
    }
}
