//! SQLite implementation of the store traits.
//!
//! This is the primary storage backend. It uses rusqlite with bundled SQLite,
//! wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use vsdm_evidence_core::{AuditEntry, AuditEntryId, AuditRepresentation, Kvnr, TelematikId};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{AccessAttemptTracker, Admission, AuditLog, CountWindow};

/// Table of failure windows.
const FAILURES: &str = "access_failures";

/// Table of request windows.
const REQUESTS: &str = "access_requests";

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation on the connection off the async runtime.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn load_window(conn: &Connection, table: &str, caller: &str) -> Result<Option<CountWindow>> {
    let row: Option<(u32, i64)> = conn
        .query_row(
            &format!("SELECT event_count, window_start FROM {} WHERE caller = ?1", table),
            params![caller],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    row.map(|(count, start)| {
        let window_start = DateTime::from_timestamp(start, 0)
            .ok_or_else(|| StoreError::InvalidData(format!("window start out of range: {}", start)))?;
        Ok(CountWindow {
            count,
            window_start,
        })
    })
    .transpose()
}

fn store_window(conn: &Connection, table: &str, caller: &str, window: CountWindow, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {} (caller, event_count, window_start, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(caller) DO UPDATE SET
                event_count = excluded.event_count,
                window_start = excluded.window_start,
                updated_at = excluded.updated_at",
            table
        ),
        params![caller, window.count, window.window_start.timestamp(), now.timestamp()],
    )?;
    Ok(())
}

fn delete_window(conn: &Connection, table: &str, caller: &str) -> Result<()> {
    conn.execute(&format!("DELETE FROM {} WHERE caller = ?1", table), params![caller])?;
    Ok(())
}

/// Raw audit row, as read from SQLite.
type AuditRow = (Vec<u8>, String, Option<String>, String, i64, Option<String>);

fn row_to_entry(row: AuditRow) -> Result<AuditEntry> {
    let (entry_id, actor, subject, representation, recorded_at, evidence) = row;

    let id = AuditEntryId::try_from(entry_id.as_slice())
        .map_err(|_| StoreError::InvalidData("audit entry id is not 32 bytes".into()))?;
    let actor = TelematikId::parse(&actor).map_err(|e| StoreError::InvalidData(e.to_string()))?;
    let subject = subject
        .map(|s| Kvnr::parse(&s))
        .transpose()
        .map_err(|e| StoreError::InvalidData(e.to_string()))?;
    let representation = representation
        .parse::<AuditRepresentation>()
        .map_err(|e| StoreError::InvalidData(e.to_string()))?;
    let recorded_at = DateTime::from_timestamp_millis(recorded_at)
        .ok_or_else(|| StoreError::InvalidData(format!("timestamp out of range: {}", recorded_at)))?;

    Ok(AuditEntry {
        id,
        actor,
        subject,
        representation,
        recorded_at,
        evidence,
    })
}

#[async_trait]
impl AccessAttemptTracker for SqliteStore {
    async fn failure_count(&self, caller: &TelematikId, now: DateTime<Utc>, window: Duration) -> Result<u32> {
        let caller = caller.clone();
        self.run(move |conn| {
            let current = load_window(conn, FAILURES, caller.as_str())?;
            Ok(CountWindow::live_count(current.as_ref(), now, window))
        })
        .await
    }

    async fn record_failure(&self, caller: &TelematikId, now: DateTime<Utc>, window: Duration) -> Result<u32> {
        let caller = caller.clone();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current = load_window(&tx, FAILURES, caller.as_str())?;
            let next = CountWindow::record(current, now, window);
            store_window(&tx, FAILURES, caller.as_str(), next, now)?;
            tx.commit()?;

            debug!(caller = %caller, failures = next.count, "recorded access failure");
            Ok(next.count)
        })
        .await
    }

    async fn reset(&self, caller: &TelematikId) -> Result<()> {
        let caller = caller.clone();
        self.run(move |conn| {
            delete_window(conn, FAILURES, caller.as_str())?;
            debug!(caller = %caller, "reset access failures");
            Ok(())
        })
        .await
    }

    async fn admit(&self, caller: &TelematikId, now: DateTime<Utc>, window: Duration, threshold: u32) -> Result<Admission> {
        let caller = caller.clone();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current = load_window(&tx, FAILURES, caller.as_str())?;
            let (admission, next) = CountWindow::admit(current, now, window, threshold);
            if let (Admission::Admitted { .. }, Some(next)) = (admission, next) {
                store_window(&tx, FAILURES, caller.as_str(), next, now)?;
            }
            tx.commit()?;

            debug!(caller = %caller, ?admission, "admission decided");
            Ok(admission)
        })
        .await
    }

    async fn release(&self, caller: &TelematikId, now: DateTime<Utc>, window: Duration) -> Result<()> {
        let caller = caller.clone();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current = load_window(&tx, FAILURES, caller.as_str())?;
            match CountWindow::release(current, now, window) {
                Some(next) => store_window(&tx, FAILURES, caller.as_str(), next, now)?,
                None => delete_window(&tx, FAILURES, caller.as_str())?,
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn record_request(&self, caller: &TelematikId, now: DateTime<Utc>, window: Duration) -> Result<u32> {
        let caller = caller.clone();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current = load_window(&tx, REQUESTS, caller.as_str())?;
            let next = CountWindow::record(current, now, window);
            store_window(&tx, REQUESTS, caller.as_str(), next, now)?;
            tx.commit()?;

            Ok(next.count)
        })
        .await
    }
}

#[async_trait]
impl AuditLog for SqliteStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let entry = entry.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO audit_entries
                    (entry_id, actor, subject, representation, recorded_at, evidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.id.as_bytes().as_slice(),
                    entry.actor.as_str(),
                    entry.subject.as_ref().map(Kvnr::as_str),
                    entry.representation.as_str(),
                    entry.recorded_at.timestamp_millis(),
                    entry.evidence,
                ],
            )?;
            debug!(entry = %entry.id, representation = %entry.representation, "appended audit entry");
            Ok(())
        })
        .await
    }

    async fn entries_for(&self, subject: &Kvnr) -> Result<Vec<AuditEntry>> {
        let subject = *subject;
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT entry_id, actor, subject, representation, recorded_at, evidence
                 FROM audit_entries
                 WHERE subject = ?1
                 ORDER BY recorded_at DESC, seq DESC",
            )?;
            let rows = stmt
                .query_map(params![subject.as_str()], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<AuditRow>, _>>()?;

            rows.into_iter().map(row_to_entry).collect()
        })
        .await
    }
}
