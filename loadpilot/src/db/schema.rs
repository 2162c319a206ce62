//! Database schema definitions and migrations

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Create all tables if they don't exist
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Workflow runs
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            workflow TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            input TEXT NOT NULL,
            phase TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            candidate TEXT,
            excluded TEXT NOT NULL DEFAULT '[]',
            outcome TEXT,
            reason TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            completed_at TEXT
        );

        -- Agent invocations within a run; append-only, gapless seq per run
        CREATE TABLE IF NOT EXISTS steps (
            run_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            role TEXT NOT NULL,
            input_summary TEXT NOT NULL,
            output_summary TEXT,
            reasoning TEXT,
            outcome TEXT NOT NULL,
            duration_ms INTEGER,
            tokens_in INTEGER,
            tokens_out INTEGER,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            PRIMARY KEY (run_id, seq),
            FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
        );

        -- Durable per-run event log for the glass door
        CREATE TABLE IF NOT EXISTS run_events (
            run_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            kind TEXT NOT NULL,
            role TEXT,
            message TEXT NOT NULL,
            reasoning TEXT,
            severity TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            PRIMARY KEY (run_id, seq),
            FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
        );

        -- Suspended runs awaiting a human decision; one open request per run
        CREATE TABLE IF NOT EXISTS approvals (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL UNIQUE,
            urgency TEXT NOT NULL,
            recommended_action TEXT NOT NULL,
            amount REAL,
            status TEXT NOT NULL,
            reviewer TEXT,
            reviewed_at TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
        );

        -- Idempotency markers for the terminal write, one per run
        CREATE TABLE IF NOT EXISTS commits (
            run_id TEXT PRIMARY KEY,
            commit_kind TEXT NOT NULL,
            committed_at TEXT NOT NULL,
            FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
        );

        -- Index for listing runs by recency
        CREATE INDEX IF NOT EXISTS idx_runs_created
        ON runs(created_at DESC);

        -- Index for pending approval lookups
        CREATE INDEX IF NOT EXISTS idx_approvals_status
        ON approvals(status);

        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

/// Get the current schema version
#[allow(dead_code)]
pub fn get_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}
