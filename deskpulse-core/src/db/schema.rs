//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Initial schema
    r#"
    -- ============================================
    -- Per-capture records (keyed by capture_id)
    -- ============================================

    CREATE TABLE IF NOT EXISTS captures (
        capture_id       TEXT PRIMARY KEY,
        batch_id         TEXT NOT NULL,
        captured_at      DATETIME NOT NULL,
        fingerprint      TEXT NOT NULL,
        duplicate        INTEGER NOT NULL DEFAULT 0,

        -- 0 marks a capture whose batch failed analysis
        analyzed         INTEGER NOT NULL,
        activity_label   TEXT,
        focus_state      TEXT,
        detected_context TEXT,
        confidence       REAL,
        focus_score      REAL,
        failure_reason   TEXT,

        recorded_at      DATETIME NOT NULL
    );

    -- ============================================
    -- Time-bucket aggregates (keyed by bucket_start)
    -- ============================================

    CREATE TABLE IF NOT EXISTS buckets (
        bucket_start        DATETIME PRIMARY KEY,
        bucket_end          DATETIME NOT NULL,
        focus_score         REAL NOT NULL,
        scored_captures     INTEGER NOT NULL,
        active_seconds      INTEGER NOT NULL,
        context_switches    INTEGER NOT NULL,
        activity_counts     JSON NOT NULL,
        focus_state_counts  JSON NOT NULL,
        total_captures      INTEGER NOT NULL,
        unanalyzed_captures INTEGER NOT NULL,
        finalized           INTEGER NOT NULL DEFAULT 0,
        updated_at          DATETIME NOT NULL
    );

    -- ============================================
    -- Recovery log: flushed batches not yet committed
    -- ============================================

    CREATE TABLE IF NOT EXISTS pending_batches (
        batch_id         TEXT PRIMARY KEY,
        state            TEXT NOT NULL,
        created_at       DATETIME NOT NULL,
        flushed_at       DATETIME,
        attempts         INTEGER NOT NULL DEFAULT 0,
        last_error       TEXT,
        updated_at       DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS pending_captures (
        batch_id         TEXT NOT NULL REFERENCES pending_batches(batch_id) ON DELETE CASCADE,
        seq              INTEGER NOT NULL,
        capture_id       TEXT NOT NULL,
        captured_at      DATETIME NOT NULL,
        mime_type        TEXT NOT NULL,
        fingerprint      TEXT NOT NULL,
        duplicate        INTEGER NOT NULL DEFAULT 0,
        payload          BLOB NOT NULL,

        PRIMARY KEY (batch_id, seq)
    );

    -- ============================================
    -- Batch outcomes (error events and completions)
    -- ============================================

    CREATE TABLE IF NOT EXISTS batch_events (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        batch_id         TEXT NOT NULL,
        event            TEXT NOT NULL,
        attempts         INTEGER NOT NULL,
        captures         INTEGER NOT NULL,
        reason           TEXT,
        occurred_at      DATETIME NOT NULL
    );

    -- ============================================
    -- Indexes
    -- ============================================

    CREATE INDEX IF NOT EXISTS idx_captures_captured_at ON captures(captured_at);
    CREATE INDEX IF NOT EXISTS idx_captures_unanalyzed ON captures(analyzed) WHERE analyzed = 0;
    CREATE INDEX IF NOT EXISTS idx_pending_batches_created ON pending_batches(created_at);
    CREATE INDEX IF NOT EXISTS idx_batch_events_occurred ON batch_events(occurred_at);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
