//! Store traits: the abstract interface for access attempt counters and
//! audit trail persistence.
//!
//! Implementations include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use vsdm_evidence_core::{AuditEntry, Kvnr, TelematikId};

use crate::error::Result;

/// A fixed-window counter of one caller: failures for the lockout, or
/// requests for the throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountWindow {
    /// Events counted since `window_start`.
    pub count: u32,
    /// Time of the first event in the window.
    pub window_start: DateTime<Utc>,
}

impl CountWindow {
    /// Whether the window has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.window_start >= window
    }

    /// The events still counting at `now`.
    pub fn live_count(current: Option<&CountWindow>, now: DateTime<Utc>, window: Duration) -> u32 {
        match current {
            Some(w) if !w.is_expired(now, window) => w.count,
            _ => 0,
        }
    }

    /// The window after recording one more event at `now`.
    ///
    /// An expired window restarts at `now`.
    pub fn record(current: Option<CountWindow>, now: DateTime<Utc>, window: Duration) -> CountWindow {
        match current {
            Some(w) if !w.is_expired(now, window) => CountWindow {
                count: w.count.saturating_add(1),
                window_start: w.window_start,
            },
            _ => CountWindow {
                count: 1,
                window_start: now,
            },
        }
    }

    /// Admit an attempt below `threshold` by reserving one failure.
    ///
    /// Returns the admission and the window to store. A locked-out caller
    /// keeps its window unchanged.
    pub fn admit(
        current: Option<CountWindow>,
        now: DateTime<Utc>,
        window: Duration,
        threshold: u32,
    ) -> (Admission, Option<CountWindow>) {
        let failures = CountWindow::live_count(current.as_ref(), now, window);
        if failures >= threshold {
            return (Admission::LockedOut { failures }, current);
        }
        let next = CountWindow::record(current, now, window);
        (Admission::Admitted { reserved: next.count }, Some(next))
    }

    /// The window after giving back one reserved failure. `None` once
    /// nothing is left to count.
    pub fn release(current: Option<CountWindow>, now: DateTime<Utc>, window: Duration) -> Option<CountWindow> {
        match current {
            Some(w) if !w.is_expired(now, window) && w.count > 1 => Some(CountWindow {
                count: w.count - 1,
                window_start: w.window_start,
            }),
            Some(w) if w.is_expired(now, window) => Some(w),
            _ => None,
        }
    }
}

/// Decision of [`AccessAttemptTracker::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The attempt may be evaluated. One failure is reserved for it and
    /// `reserved` counts it.
    Admitted { reserved: u32 },
    /// The caller has reached the threshold. Nothing was reserved.
    LockedOut { failures: u32 },
}

/// Per-caller counters behind the access rate limiter.
///
/// `admit`, `release`, `record_failure` and `record_request` are each one
/// critical section: concurrent attempts from the same caller are never
/// lost, and no more than `threshold` of them are admitted.
#[async_trait]
pub trait AccessAttemptTracker: Send + Sync {
    /// Failures counted for `caller` in the window live at `now`.
    async fn failure_count(&self, caller: &TelematikId, now: DateTime<Utc>, window: Duration) -> Result<u32>;

    /// Count one failure and return the new count.
    ///
    /// Restarts the window if it has elapsed.
    async fn record_failure(&self, caller: &TelematikId, now: DateTime<Utc>, window: Duration) -> Result<u32>;

    /// Forget all failures of `caller`.
    async fn reset(&self, caller: &TelematikId) -> Result<()>;

    /// Lock out `caller` if it has `threshold` failures, else reserve one
    /// failure for the attempt about to be evaluated.
    async fn admit(&self, caller: &TelematikId, now: DateTime<Utc>, window: Duration, threshold: u32) -> Result<Admission>;

    /// Give back a failure reserved by [`admit`](Self::admit) for an attempt
    /// that did not count.
    async fn release(&self, caller: &TelematikId, now: DateTime<Utc>, window: Duration) -> Result<()>;

    /// Count one request of `caller` and return the count in the window.
    async fn record_request(&self, caller: &TelematikId, now: DateTime<Utc>, window: Duration) -> Result<u32>;
}

/// Append-only audit trail.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append an entry.
    async fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Entries attributed to `subject`, newest first.
    async fn entries_for(&self, subject: &Kvnr) -> Result<Vec<AuditEntry>>;
}
