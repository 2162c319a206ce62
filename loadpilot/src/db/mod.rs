//! Database module for run persistence
//!
//! Uses SQLite to store runs, steps, events, and approval requests in
//! ~/.loadpilot/loadpilot.db

pub mod runs;
pub mod schema;

pub use runs::{
    ApprovalRequest, ApprovalStatus, Run, RunFilter, RunOutcome, RunPhase, RunSummary, StepOutcome,
    StepRecord,
};

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Typed store errors the engine must distinguish
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic version check failed; retry with fresh state
    #[error("version conflict on run {0}")]
    VersionConflict(String),

    /// The run already has a terminal outcome; writes are rejected
    #[error("run {0} is terminal and immutable")]
    TerminalRun(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("approval {0} is already resolved")]
    AlreadyResolved(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the default location
    pub fn open() -> Result<Self> {
        let path = Self::default_path()?;
        Self::open_at(path)
    }

    /// Open or create the database at a specific path
    pub fn open_at(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        tracing::info!("Database opened at {:?}", path);
        Ok(db)
    }

    /// In-memory database for tests and ephemeral runs
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Get the default database path
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".loadpilot").join("loadpilot.db"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        schema::create_tables(&conn)?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_database_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = Database::open_at(path.clone()).unwrap();
        assert!(path.exists());
        drop(db);
    }
}
