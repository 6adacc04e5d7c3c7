//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: event log, live tier, canonical snapshots
    r#"
    -- ============================================
    -- LAYER 1: Durable logs (append-only)
    -- ============================================

    CREATE TABLE events (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        kind             TEXT NOT NULL,      -- 'start', 'maybe_leave', 'complete', 'state_hit', ...
        exploration_id   TEXT NOT NULL,
        version          INTEGER,            -- NULL when the player did not report one
        session_id       TEXT NOT NULL,
        state_name       TEXT,
        created_on       TEXT NOT NULL       -- fixed-width RFC 3339 UTC
    );

    CREATE INDEX idx_events_created_on ON events(created_on);
    CREATE INDEX idx_events_exploration ON events(exploration_id);

    -- Pre-migration aggregate counters, one row per (exploration, state)
    CREATE TABLE legacy_state_counters (
        exploration_id           TEXT NOT NULL,
        state_name               TEXT NOT NULL,
        first_entry_count        INTEGER NOT NULL DEFAULT 0,
        subsequent_entries_count INTEGER NOT NULL DEFAULT 0,
        resolved_answer_count    INTEGER NOT NULL DEFAULT 0,
        active_answer_count      INTEGER NOT NULL DEFAULT 0,
        created_on               TEXT NOT NULL,

        PRIMARY KEY (exploration_id, state_name)
    );

    -- Exploration content, one row per committed version
    CREATE TABLE exploration_versions (
        exploration_id   TEXT NOT NULL,
        version          INTEGER NOT NULL,
        init_state_name  TEXT NOT NULL,
        states           JSON NOT NULL,      -- array of state names
        last_updated     TEXT NOT NULL,

        PRIMARY KEY (exploration_id, version)
    );

    -- ============================================
    -- Live tier (approximate, per generation)
    -- ============================================

    CREATE TABLE live_counters (
        generation       INTEGER NOT NULL,
        exploration_id   TEXT NOT NULL,
        num_starts       INTEGER NOT NULL DEFAULT 0,
        num_completions  INTEGER NOT NULL DEFAULT 0,

        PRIMARY KEY (generation, exploration_id)
    );

    CREATE TABLE computation_state (
        name              TEXT PRIMARY KEY,
        active_generation INTEGER NOT NULL DEFAULT 0,
        last_cutoff       TEXT
    );

    -- ============================================
    -- LAYER 2: Derived (regenerable)
    -- ============================================

    CREATE TABLE canonical_snapshots (
        exploration_id   TEXT NOT NULL,
        version_scope    TEXT NOT NULL,      -- version number, 'all' or 'none'
        num_starts       INTEGER NOT NULL,
        num_completions  INTEGER NOT NULL,
        state_hit_counts JSON NOT NULL,
        last_updated     TEXT NOT NULL,

        PRIMARY KEY (exploration_id, version_scope)
    );

    CREATE TABLE batch_runs (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        job_name         TEXT NOT NULL,
        started_at       TEXT NOT NULL,
        cutoff           TEXT NOT NULL,
        duration_ms      INTEGER NOT NULL,
        status           TEXT NOT NULL,
        error_message    TEXT,
        input_count      INTEGER NOT NULL DEFAULT 0,
        keys_written     INTEGER NOT NULL DEFAULT 0,
        keys_skipped     INTEGER NOT NULL DEFAULT 0,
        keys_failed      INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX idx_batch_runs_job ON batch_runs(job_name, started_at);
    "#,
    // Version 2: answer log and calculation outputs
    r#"
    CREATE TABLE state_answers (
        id                    INTEGER PRIMARY KEY AUTOINCREMENT,
        exploration_id        TEXT NOT NULL,
        version               INTEGER NOT NULL,
        state_name            TEXT NOT NULL,
        interaction_id        TEXT NOT NULL,
        submitted_answer_list JSON NOT NULL,
        created_on            TEXT NOT NULL
    );

    CREATE INDEX idx_state_answers_created_on ON state_answers(created_on);

    CREATE TABLE calculation_outputs (
        exploration_id   TEXT NOT NULL,
        version_scope    TEXT NOT NULL,
        state_name       TEXT NOT NULL,
        calculation_id   TEXT NOT NULL,
        output           JSON NOT NULL,
        computed_at      TEXT NOT NULL,

        PRIMARY KEY (exploration_id, version_scope, state_name, calculation_id)
    );
    "#,
    // Version 3: live generation window and event-log watermark
    r#"
    -- Oldest generation readers still count; older rows are leftovers
    ALTER TABLE computation_state ADD COLUMN oldest_live_generation INTEGER NOT NULL DEFAULT 0;
    -- Last events.id that existed when the active generation was opened
    ALTER TABLE computation_state ADD COLUMN opened_after_event INTEGER NOT NULL DEFAULT 0;
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
