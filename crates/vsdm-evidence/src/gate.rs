//! The access gate: decides whether a pharmacy may fetch a patient's ready
//! prescription tasks on the strength of exam evidence.
//!
//! Per attempt: admission (throttle, then lockout reservation), validation,
//! settling the reservation, audit entry. If any store operation fails the
//! attempt is denied.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use vsdm_evidence_core::{
    AccessRequest, Assurance, AuditEntry, AuditRepresentation, CheckDigitValidator, Kvnr,
    TelematikId, ValidationError, Verdict,
};
use vsdm_evidence_store::{AccessAttemptTracker, AuditLog};

use crate::audit::{attribute, AuditTrailEmitter};
use crate::config::{GateConfig, RateLimitConfig};
use crate::error::Result;
use crate::ratelimit::{AccessRateLimiter, RateLimitStatus};

/// Outcome of an access attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessOutcome {
    /// Access granted.
    Granted(Verdict),
    /// The evidence failed validation.
    Rejected(ValidationError),
    /// The caller is locked out.
    RateLimitExceeded,
    /// The caller sent too many requests this minute.
    TooManyRequests,
    /// A store operation failed; the attempt is denied.
    Unavailable,
}

impl AccessOutcome {
    fn from_validation(outcome: std::result::Result<Verdict, ValidationError>) -> Self {
        match outcome {
            Ok(verdict) => AccessOutcome::Granted(verdict),
            Err(e) => AccessOutcome::Rejected(e),
        }
    }

    /// Whether access was granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, AccessOutcome::Granted(_))
    }

    /// The patient access was granted for.
    pub fn subject(&self) -> Option<&Kvnr> {
        match self {
            AccessOutcome::Granted(verdict) => Some(&verdict.subject),
            _ => None,
        }
    }

    /// HTTP status code returned to the caller.
    pub fn status_code(&self) -> u16 {
        match self {
            AccessOutcome::Granted(verdict) => match verdict.assurance {
                Assurance::Full => 200,
                Assurance::Pn3Reduced => 202,
            },
            AccessOutcome::Rejected(e) => match e {
                ValidationError::ChecksumMissing { pn3_result: true } => 454,
                ValidationError::MissingIdentityParameter => 455,
                ValidationError::IdentityMismatch => 456,
                ValidationError::HashCheckValueMissing => 457,
                ValidationError::HashCheckValueMismatch => 458,
                ValidationError::NoEvidenceSupplied
                | ValidationError::MalformedEvidence(_)
                | ValidationError::ChecksumMissing { pn3_result: false }
                | ValidationError::EvidenceResultRejected(_)
                | ValidationError::SignatureInvalid
                | ValidationError::CardRevoked
                | ValidationError::EvidenceExpired => 403,
            },
            AccessOutcome::RateLimitExceeded => 423,
            AccessOutcome::TooManyRequests => 429,
            AccessOutcome::Unavailable => 500,
        }
    }

    /// The message shown to the caller. Fixed per status code, so it reveals
    /// nothing beyond the code itself.
    pub fn public_message(&self) -> &'static str {
        public_message(self.status_code())
    }
}

/// The public message for a status code.
pub fn public_message(status: u16) -> &'static str {
    match status {
        200 => "Access granted",
        202 => "Access granted on offline exam evidence",
        403 => "Exam evidence invalid",
        423 => "Too many failed attempts, try again later",
        429 => "Too many requests, try again later",
        454 => "Offline exam evidence not accepted",
        455 => "Parameter kvnr required",
        456 => "Parameter kvnr does not match exam evidence",
        457 => "Parameter hcv required",
        458 => "Parameter hcv does not match exam evidence",
        _ => "Service temporarily unavailable",
    }
}

/// Decides access for card-based task retrieval.
pub struct AccessGate<T: AccessAttemptTracker, A: AuditLog> {
    validator: CheckDigitValidator,
    limiter: AccessRateLimiter<T>,
    audit: AuditTrailEmitter<A>,
}

impl<T: AccessAttemptTracker, A: AuditLog> AccessGate<T, A> {
    /// Create a gate from its parts.
    pub fn new(
        validator: CheckDigitValidator,
        rate_limit: RateLimitConfig,
        tracker: Arc<T>,
        audit: Arc<A>,
    ) -> Self {
        Self {
            validator,
            limiter: AccessRateLimiter::new(tracker, rate_limit),
            audit: AuditTrailEmitter::new(audit),
        }
    }

    /// Create a gate from configuration.
    pub fn from_config(config: &GateConfig, tracker: Arc<T>, audit: Arc<A>) -> Result<Self> {
        config.check()?;
        Ok(Self::new(
            config.validator()?,
            config.rate_limit.clone(),
            tracker,
            audit,
        ))
    }

    pub fn validator(&self) -> &CheckDigitValidator {
        &self.validator
    }

    pub fn rate_limiter(&self) -> &AccessRateLimiter<T> {
        &self.limiter
    }

    /// Decide whether `caller` may fetch the ready tasks of the patient
    /// named by `request`. Never fails: store errors deny access.
    pub async fn fetch_ready_tasks_by_card(
        &self,
        caller: &TelematikId,
        request: &AccessRequest,
        now: DateTime<Utc>,
    ) -> AccessOutcome {
        match self.decide(caller, request, now).await {
            Ok(outcome) => {
                let status = outcome.status_code();
                match &outcome {
                    AccessOutcome::Granted(verdict) => {
                        info!(caller = %caller, status, assurance = ?verdict.assurance, "access granted")
                    }
                    _ => warn!(caller = %caller, status, "access denied"),
                }
                outcome
            }
            Err(e) => {
                error!(caller = %caller, error = %e, "access attempt failed closed");
                AccessOutcome::Unavailable
            }
        }
    }

    /// The audit trail of a patient, newest first.
    pub async fn audit_history(&self, subject: &Kvnr) -> Result<Vec<AuditEntry>> {
        self.audit.history(subject).await
    }

    async fn decide(&self, caller: &TelematikId, request: &AccessRequest, now: DateTime<Utc>) -> Result<AccessOutcome> {
        let refused = match self.limiter.admit(caller, now).await? {
            RateLimitStatus::Open { .. } => None,
            RateLimitStatus::LockedOut { .. } => Some(AccessOutcome::RateLimitExceeded),
            RateLimitStatus::Throttled { .. } => Some(AccessOutcome::TooManyRequests),
        };
        if let Some(outcome) = refused {
            self.audit
                .emit(
                    caller,
                    attribute(request, None),
                    AuditRepresentation::PharmacyGetTaskUnsuccessful,
                    now,
                    None,
                )
                .await?;
            return Ok(outcome);
        }

        let evaluation = self.validator.evaluate(request, now);

        self.limiter.settle(caller, &evaluation.outcome, now).await?;
        self.audit
            .emit_outcome(caller, request, evaluation.record.as_ref(), &evaluation.outcome, now)
            .await?;

        Ok(AccessOutcome::from_validation(evaluation.outcome))
    }
}

impl<S: AccessAttemptTracker + AuditLog> AccessGate<S, S> {
    /// Create a gate backed by a single store.
    pub fn with_store(validator: CheckDigitValidator, rate_limit: RateLimitConfig, store: S) -> Self {
        let store = Arc::new(store);
        Self::new(validator, rate_limit, store.clone(), store)
    }
}
