//! SQLite schema.

use std::time::Duration;

use rusqlite::Connection;
use tokio_rusqlite::Error;

/// Initialize connection settings and the database schema.
pub fn init_schema(conn: &Connection) -> Result<(), Error> {
    // In-memory databases answer "memory" here.
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

const SCHEMA: &str = r#"
-- Jobs keyed by id; `state_data` holds the tagged state as JSON
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    payload TEXT NOT NULL,
    queue TEXT NOT NULL,
    state TEXT NOT NULL,
    state_data TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    retry_policy TEXT,
    parameters TEXT NOT NULL DEFAULT '{}',
    parent_id TEXT,
    continuations TEXT NOT NULL DEFAULT '[]',
    lease_expires_at TEXT,
    retry_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Per-queue ordered index of ready job ids
CREATE TABLE IF NOT EXISTS job_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    job_id TEXT NOT NULL UNIQUE,
    FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
);

-- Append-only state history
CREATE TABLE IF NOT EXISTS job_state_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    state TEXT NOT NULL,
    state_data TEXT NOT NULL,
    reason TEXT,
    recorded_at TEXT NOT NULL,
    FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
);

-- Delayed and recurring entries, sorted by next fire time
CREATE TABLE IF NOT EXISTS schedule (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    entry TEXT NOT NULL,
    next_fire TEXT,
    updated_at TEXT NOT NULL
);

-- Queue names ever used, for listings
CREATE TABLE IF NOT EXISTS queues (
    name TEXT PRIMARY KEY
);

CREATE INDEX IF NOT EXISTS idx_jobs_state_queue ON jobs(state, queue, updated_at);
CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs(state, lease_expires_at);
CREATE INDEX IF NOT EXISTS idx_job_queue_queue ON job_queue(queue, seq);
CREATE INDEX IF NOT EXISTS idx_history_job ON job_state_history(job_id, id);
CREATE INDEX IF NOT EXISTS idx_schedule_next_fire ON schedule(next_fire);
"#;
