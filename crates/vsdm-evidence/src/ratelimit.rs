//! Per-caller rate limiting.
//!
//! Two limits apply. A throttle caps the requests a caller makes per minute.
//! The lockout counts only outcomes that look like a pharmacy guessing
//! patient identities (identity mismatch, hash check value mismatch); once a
//! caller reaches the threshold, every attempt is refused until its window
//! elapses.
//!
//! [`AccessRateLimiter::admit`] reserves a failure before an attempt is
//! evaluated and [`AccessRateLimiter::settle`] gives it back if the outcome
//! did not count, so concurrent attempts never get past the threshold.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use vsdm_evidence_core::{TelematikId, ValidationError, Verdict};
use vsdm_evidence_store::{AccessAttemptTracker, Admission};

use crate::config::RateLimitConfig;
use crate::error::{GateError, Result};

/// Rate limit state of a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStatus {
    /// Attempts are evaluated. After [`AccessRateLimiter::admit`],
    /// `failures` includes the reservation of the admitted attempt.
    Open { failures: u32 },
    /// Attempts are refused until the failure window elapses.
    LockedOut { failures: u32 },
    /// Too many requests in the current minute.
    Throttled { requests: u32 },
}

impl RateLimitStatus {
    pub fn is_locked_out(&self) -> bool {
        matches!(self, RateLimitStatus::LockedOut { .. })
    }

    /// Whether the attempt may be evaluated.
    pub fn is_open(&self) -> bool {
        matches!(self, RateLimitStatus::Open { .. })
    }
}

/// Rate limiter over an injected [`AccessAttemptTracker`].
pub struct AccessRateLimiter<T: AccessAttemptTracker> {
    tracker: Arc<T>,
    config: RateLimitConfig,
}

impl<T: AccessAttemptTracker> AccessRateLimiter<T> {
    pub fn new(tracker: Arc<T>, config: RateLimitConfig) -> Self {
        Self { tracker, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count a request of `caller` and decide whether it may be evaluated.
    ///
    /// An open status holds a reserved failure that the caller must hand to
    /// [`settle`](Self::settle) once the outcome is known.
    pub async fn admit(&self, caller: &TelematikId, now: DateTime<Utc>) -> Result<RateLimitStatus> {
        let requests = self
            .tracker
            .record_request(caller, now, self.config.request_window())
            .await?;
        if requests > self.config.requests_per_minute {
            warn!(caller = %caller, requests, "caller throttled");
            return Ok(RateLimitStatus::Throttled { requests });
        }

        match self
            .tracker
            .admit(caller, now, self.window()?, self.config.threshold)
            .await?
        {
            Admission::Admitted { reserved } => Ok(RateLimitStatus::Open { failures: reserved }),
            Admission::LockedOut { failures } => {
                warn!(caller = %caller, failures, "caller locked out");
                Ok(RateLimitStatus::LockedOut { failures })
            }
        }
    }

    /// Settle the failure reserved by [`admit`](Self::admit). It stays
    /// counted if the outcome counts and is given back otherwise. Returns
    /// whether it stayed.
    pub async fn settle(
        &self,
        caller: &TelematikId,
        outcome: &std::result::Result<Verdict, ValidationError>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if counts(outcome) {
            debug!(caller = %caller, "counted probing failure");
            return Ok(true);
        }
        self.tracker.release(caller, now, self.window()?).await?;
        Ok(false)
    }

    /// Whether `caller` may attempt access at `now`. Reserves nothing.
    pub async fn check(&self, caller: &TelematikId, now: DateTime<Utc>) -> Result<RateLimitStatus> {
        let failures = self.failures(caller, now).await?;
        if failures >= self.config.threshold {
            warn!(caller = %caller, failures, "caller locked out");
            return Ok(RateLimitStatus::LockedOut { failures });
        }
        Ok(RateLimitStatus::Open { failures })
    }

    /// Feed a validation outcome back. Returns the new failure count if the
    /// outcome counted.
    pub async fn record_outcome(
        &self,
        caller: &TelematikId,
        outcome: &std::result::Result<Verdict, ValidationError>,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        if !counts(outcome) {
            return Ok(None);
        }

        let failures = self.tracker.record_failure(caller, now, self.window()?).await?;
        debug!(caller = %caller, failures, "counted probing failure");
        if failures == self.config.threshold {
            warn!(caller = %caller, failures, "lockout threshold reached");
        }
        Ok(Some(failures))
    }

    /// Failures counted for `caller` at `now`.
    pub async fn failures(&self, caller: &TelematikId, now: DateTime<Utc>) -> Result<u32> {
        Ok(self.tracker.failure_count(caller, now, self.window()?).await?)
    }

    /// Clear a caller's failures, e.g. after manual review.
    pub async fn reset(&self, caller: &TelematikId) -> Result<()> {
        Ok(self.tracker.reset(caller).await?)
    }

    fn window(&self) -> Result<Duration> {
        self.config
            .window()
            .ok_or_else(|| GateError::Config(format!("window of {} seconds is out of range", self.config.window_secs)))
    }
}

fn counts(outcome: &std::result::Result<Verdict, ValidationError>) -> bool {
    matches!(outcome, Err(e) if e.counts_against_rate_limit())
}
