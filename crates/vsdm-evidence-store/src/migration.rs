//! Database schema migrations for SQLite.
//!
//! Each migration is a SQL batch that transforms the schema from version
//! N to N+1.

use chrono::Utc;
use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 2;

/// Initialize or migrate the database schema. Idempotent.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, Utc::now().timestamp_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Rolling failure counter per caller
        CREATE TABLE access_failures (
            caller TEXT PRIMARY KEY,          -- Telematik-ID
            failure_count INTEGER NOT NULL,
            window_start INTEGER NOT NULL,    -- Unix seconds of the first failure in the window
            updated_at INTEGER NOT NULL       -- Unix seconds of the last failure
        );

        -- Append-only audit trail
        CREATE TABLE audit_entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id BLOB NOT NULL UNIQUE,    -- 32 bytes
            actor TEXT NOT NULL,              -- Telematik-ID
            subject TEXT,                     -- KVNR, NULL when unattributed
            representation TEXT NOT NULL,
            recorded_at INTEGER NOT NULL,     -- Unix ms
            evidence TEXT                     -- encoded check digit
        );

        CREATE INDEX idx_audit_subject ON audit_entries(subject, recorded_at);
        "#,
    )?;

    Ok(())
}

/// Migration v2: per-caller request windows for the throttle. Both window
/// tables share one column layout.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        ALTER TABLE access_failures RENAME COLUMN failure_count TO event_count;

        -- Rolling request counter per caller
        CREATE TABLE access_requests (
            caller TEXT PRIMARY KEY,          -- Telematik-ID
            event_count INTEGER NOT NULL,
            window_start INTEGER NOT NULL,    -- Unix seconds of the first request in the window
            updated_at INTEGER NOT NULL       -- Unix seconds of the last request
        );
        "#,
    )?;

    Ok(())
}
