//! Database schema definitions

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Create all tables if they don't exist
pub fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Session metadata, cheap to scan
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            query TEXT NOT NULL,
            language TEXT NOT NULL,
            phase TEXT NOT NULL,
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        );

        -- Bulky per-session state as JSON
        CREATE TABLE IF NOT EXISTS session_state (
            session_id TEXT PRIMARY KEY,
            plan TEXT,
            agent_progress TEXT NOT NULL,
            results TEXT NOT NULL,
            final_report TEXT,
            FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
        );

        -- Latest checkpoint per session
        CREATE TABLE IF NOT EXISTS checkpoints (
            session_id TEXT PRIMARY KEY,
            phase TEXT NOT NULL,
            data TEXT NOT NULL,
            checkpoint_time TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_updated
        ON sessions(updated_at DESC);

        CREATE INDEX IF NOT EXISTS idx_sessions_phase
        ON sessions(phase);

        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);
        "#,
    )?;
    migrate(conn)
}

/// Bring a database created by an older build up to `SCHEMA_VERSION`
fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    if get_version(conn)? < 2 {
        conn.execute_batch(
            r#"
            BEGIN;
            -- Feedback of a plan revision that has not produced a new plan yet
            ALTER TABLE session_state ADD COLUMN revision_feedback TEXT;
            INSERT OR IGNORE INTO schema_version (version) VALUES (2);
            COMMIT;
            "#,
        )?;
        tracing::info!("Migrated database schema to version 2");
    }
    Ok(())
}

/// Get the current schema version
pub fn get_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    )
}
