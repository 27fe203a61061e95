//! In-memory implementation of the store traits.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use vsdm_evidence_core::{AuditEntry, Kvnr, TelematikId};

use crate::error::{Result, StoreError};
use crate::traits::{AccessAttemptTracker, Admission, AuditLog, CountWindow};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Failure windows by caller.
    failures: HashMap<TelematikId, CountWindow>,

    /// Request windows by caller.
    requests: HashMap<TelematikId, CountWindow>,

    /// Audit entries in append order.
    audit: Vec<AuditEntry>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    /// Number of audit entries, across all subjects.
    pub fn audit_len(&self) -> Result<usize> {
        Ok(self.read()?.audit.len())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccessAttemptTracker for MemoryStore {
    async fn failure_count(&self, caller: &TelematikId, now: DateTime<Utc>, window: Duration) -> Result<u32> {
        let inner = self.read()?;
        Ok(CountWindow::live_count(inner.failures.get(caller), now, window))
    }

    async fn record_failure(&self, caller: &TelematikId, now: DateTime<Utc>, window: Duration) -> Result<u32> {
        let mut inner = self.write()?;
        let next = CountWindow::record(inner.failures.get(caller).copied(), now, window);
        inner.failures.insert(caller.clone(), next);
        Ok(next.count)
    }

    async fn reset(&self, caller: &TelematikId) -> Result<()> {
        self.write()?.failures.remove(caller);
        Ok(())
    }

    async fn admit(&self, caller: &TelematikId, now: DateTime<Utc>, window: Duration, threshold: u32) -> Result<Admission> {
        let mut inner = self.write()?;
        let current = inner.failures.get(caller).copied();
        let (admission, next) = CountWindow::admit(current, now, window, threshold);
        if let Some(next) = next {
            inner.failures.insert(caller.clone(), next);
        }
        Ok(admission)
    }

    async fn release(&self, caller: &TelematikId, now: DateTime<Utc>, window: Duration) -> Result<()> {
        let mut inner = self.write()?;
        let current = inner.failures.get(caller).copied();
        match CountWindow::release(current, now, window) {
            Some(next) => inner.failures.insert(caller.clone(), next),
            None => inner.failures.remove(caller),
        };
        Ok(())
    }

    async fn record_request(&self, caller: &TelematikId, now: DateTime<Utc>, window: Duration) -> Result<u32> {
        let mut inner = self.write()?;
        let next = CountWindow::record(inner.requests.get(caller).copied(), now, window);
        inner.requests.insert(caller.clone(), next);
        Ok(next.count)
    }
}

#[async_trait]
impl AuditLog for MemoryStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.write()?.audit.push(entry.clone());
        Ok(())
    }

    async fn entries_for(&self, subject: &Kvnr) -> Result<Vec<AuditEntry>> {
        let inner = self.read()?;
        // Latest appended first among equal timestamps.
        let mut entries: Vec<AuditEntry> = inner
            .audit
            .iter()
            .rev()
            .filter(|e| e.subject.as_ref() == Some(subject))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(entries)
    }
}
