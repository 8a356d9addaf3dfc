//! Storage layer for promptloop.
//!
//! Provides a unified `Database` struct that owns the SQLite connection
//! and hands out domain-specific stores that borrow it.

mod calls;
mod iterations;
mod pipeline_runs;
mod runs;
mod snapshots;
mod validations;

pub use calls::{CallFilter, CallRecord, Calls};
pub use iterations::{IterationRecord, IterationStatus, Iterations, Promotion};
pub use pipeline_runs::{PipelineRunRecord, PipelineRuns};
pub use runs::{EvaluationRunRecord, EvaluationRuns};
pub use snapshots::{SnapshotRecord, Snapshots};
pub use validations::{ValidationRecord, Validations};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// The main database struct that owns the SQLite connection.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the default location.
    ///
    /// The default location is `~/.local/share/promptloop/promptloop.db`.
    pub fn open() -> Result<Self, rusqlite::Error> {
        Self::open_at(&Self::default_path())
    }

    /// Open or create a database at a specific path.
    pub fn open_at(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the default database path.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("promptloop")
            .join("promptloop.db")
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("Database lock poisoned")
    }

    /// Access the calls store.
    pub fn calls(&self) -> Calls<'_> {
        Calls::new(self.lock())
    }

    /// Access the bot iterations store.
    pub fn iterations(&self) -> Iterations<'_> {
        Iterations::new(self.lock())
    }

    /// Access the evaluation runs store.
    pub fn runs(&self) -> EvaluationRuns<'_> {
        EvaluationRuns::new(self.lock())
    }

    /// Access the validation results store.
    pub fn validations(&self) -> Validations<'_> {
        Validations::new(self.lock())
    }

    /// Access the performance snapshots store.
    pub fn snapshots(&self) -> Snapshots<'_> {
        Snapshots::new(self.lock())
    }

    /// Access the pipeline run log.
    pub fn pipeline_runs(&self) -> PipelineRuns<'_> {
        PipelineRuns::new(self.lock())
    }

    /// Initialize the database schema.
    fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS calls (
                id TEXT PRIMARY KEY,
                transcript TEXT NOT NULL,
                risk_tags TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                active_iteration_id INTEGER
            );

            CREATE TABLE IF NOT EXISTS bot_iterations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                prompt_text TEXT NOT NULL,
                prompt_hash TEXT NOT NULL,
                parent_id INTEGER REFERENCES bot_iterations(id),
                status TEXT NOT NULL,
                status_reason TEXT,
                aggregate_score REAL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS evaluation_runs (
                id TEXT PRIMARY KEY,
                iteration_id INTEGER NOT NULL REFERENCES bot_iterations(id),
                persona_id TEXT NOT NULL,
                transcript TEXT NOT NULL,
                completion TEXT NOT NULL,
                status TEXT NOT NULL,
                scorecard TEXT,
                aggregate_score REAL,
                error TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (iteration_id, persona_id)
            );

            CREATE TABLE IF NOT EXISTS validation_results (
                iteration_id INTEGER PRIMARY KEY REFERENCES bot_iterations(id),
                passed INTEGER NOT NULL,
                result TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS performance_snapshots (
                iteration_id INTEGER PRIMARY KEY REFERENCES bot_iterations(id),
                baseline_id INTEGER REFERENCES bot_iterations(id),
                aggregate_score REAL NOT NULL,
                baseline_score REAL,
                delta REAL,
                report TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pipeline_runs (
                id TEXT PRIMARY KEY,
                call_id TEXT NOT NULL,
                candidate_id INTEGER,
                outcome TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_iterations_status ON bot_iterations(status);
            CREATE INDEX IF NOT EXISTS idx_runs_iteration ON evaluation_runs(iteration_id);
            CREATE INDEX IF NOT EXISTS idx_calls_timestamp ON calls(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_pipeline_runs_call ON pipeline_runs(call_id);
            "#,
        )
    }
}

pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_at_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("promptloop.db");
        {
            let db = Database::open_at(&path).unwrap();
            assert_eq!(db.iterations().count().unwrap(), 0);
        }
        assert!(path.exists());

        // Reopening keeps the schema idempotent
        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.iterations().count().unwrap(), 0);
    }

    #[test]
    fn test_default_path() {
        let path = Database::default_path();
        assert!(path.ends_with("promptloop/promptloop.db"));
    }
}
