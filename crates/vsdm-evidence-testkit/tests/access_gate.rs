//! End-to-end scenarios for the access gate.
//!
//! These drive the full attempt pipeline: admission, validation, settling the
//! reserved failure and the audit trail.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use vsdm_evidence::store::{AccessAttemptTracker, Admission, MemoryStore, SqliteStore, StoreError};
use vsdm_evidence::{
    AccessGate, AccessOutcome, AccessRequest, Assurance, AuditRepresentation, GateConfig, Kvnr,
    RateLimitConfig, TelematikId, ValidationError, ValidatorConfig,
};
use vsdm_evidence_core::EvidenceResult;
use vsdm_evidence_testkit::{pharmacies, t0, TestFixture};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn minutes(m: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(m)
}

fn strict_limit(threshold: u32) -> RateLimitConfig {
    RateLimitConfig {
        threshold,
        ..RateLimitConfig::default()
    }
}

#[tokio::test]
async fn test_valid_evidence_then_wrong_kvnr() {
    init_tracing();
    let fixture = TestFixture::new();
    let gate = fixture.gate(ValidatorConfig::default(), RateLimitConfig::default());
    let token = fixture.token();

    let outcome = gate
        .fetch_ready_tasks_by_card(&fixture.caller, &fixture.request(token.clone()), minutes(10))
        .await;
    assert_eq!(outcome.status_code(), 200);
    assert_eq!(outcome.subject(), Some(&fixture.card.subject));

    let guess = AccessRequest::new(token).with_kvnr("X999999999");
    let outcome = gate
        .fetch_ready_tasks_by_card(&fixture.caller, &guess, minutes(11))
        .await;
    assert_eq!(outcome, AccessOutcome::Rejected(ValidationError::IdentityMismatch));
    assert_eq!(outcome.status_code(), 456);

    let failures = gate
        .rate_limiter()
        .failures(&fixture.caller, minutes(11))
        .await
        .unwrap();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn test_lockout_and_recovery() {
    init_tracing();
    let fixture = TestFixture::new();
    let gate = fixture.gate(ValidatorConfig::default(), strict_limit(3));
    let token = fixture.token();
    let guess = AccessRequest::new(token.clone()).with_kvnr("X999999999");

    for m in 1..=3 {
        let outcome = gate
            .fetch_ready_tasks_by_card(&fixture.caller, &guess, minutes(m))
            .await;
        assert_eq!(outcome.status_code(), 456);
    }

    // Even a fully valid request is refused while locked out.
    let outcome = gate
        .fetch_ready_tasks_by_card(&fixture.caller, &fixture.request(token), minutes(4))
        .await;
    assert_eq!(outcome, AccessOutcome::RateLimitExceeded);
    assert_eq!(outcome.status_code(), 423);

    // Other pharmacies are unaffected.
    let other = &pharmacies(1)[0];
    let outcome = gate
        .fetch_ready_tasks_by_card(other, &fixture.request(fixture.token()), minutes(5))
        .await;
    assert_eq!(outcome.status_code(), 200);

    // After the window, fresh evidence is accepted again.
    let later = t0() + Duration::hours(25);
    let fresh = fixture.encode(&fixture.record(EvidenceResult::NoUpdatesNeeded, later));
    let outcome = gate
        .fetch_ready_tasks_by_card(&fixture.caller, &fixture.request(fresh), later)
        .await;
    assert_eq!(outcome.status_code(), 200);
}

#[tokio::test]
async fn test_lockout_attempt_is_audited() {
    let fixture = TestFixture::new();
    let gate = fixture.gate(ValidatorConfig::default(), strict_limit(1));
    let token = fixture.token();

    let guess = AccessRequest::new(token.clone()).with_kvnr("X999999999");
    gate.fetch_ready_tasks_by_card(&fixture.caller, &guess, minutes(1))
        .await;

    let outcome = gate
        .fetch_ready_tasks_by_card(&fixture.caller, &fixture.request(token), minutes(2))
        .await;
    assert_eq!(outcome.status_code(), 423);

    let history = gate.audit_history(&fixture.card.subject).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(
        history[0].representation,
        AuditRepresentation::PharmacyGetTaskUnsuccessful
    );
    assert_eq!(history[0].actor, fixture.caller);
}

#[tokio::test]
async fn test_offline_evidence_depends_on_configuration() {
    let fixture = TestFixture::new();
    let request = AccessRequest::new(fixture.offline_token()).with_kvnr(fixture.card.subject.as_str());

    let strict = fixture.gate(ValidatorConfig::default(), RateLimitConfig::default());
    let outcome = strict
        .fetch_ready_tasks_by_card(&fixture.caller, &request, minutes(1))
        .await;
    assert_eq!(
        outcome,
        AccessOutcome::Rejected(ValidationError::ChecksumMissing { pn3_result: true })
    );
    assert_eq!(outcome.status_code(), 454);

    let lenient = fixture.gate(
        ValidatorConfig {
            accept_pn3: true,
            ..ValidatorConfig::default()
        },
        RateLimitConfig::default(),
    );
    let outcome = lenient
        .fetch_ready_tasks_by_card(&fixture.caller, &request, minutes(1))
        .await;
    assert_eq!(outcome.status_code(), 202);
    match outcome {
        AccessOutcome::Granted(verdict) => {
            assert_eq!(verdict.assurance, Assurance::Pn3Reduced);
            assert_eq!(verdict.subject, fixture.card.subject);
        }
        other => panic!("expected grant, got {:?}", other),
    }

    let anonymous = AccessRequest::new(fixture.offline_token());
    let outcome = lenient
        .fetch_ready_tasks_by_card(&fixture.caller, &anonymous, minutes(1))
        .await;
    assert_eq!(outcome.status_code(), 455);
}

#[tokio::test]
async fn test_audit_history_newest_first() {
    let fixture = TestFixture::new();
    let gate = fixture.gate(
        ValidatorConfig {
            accept_pn3: true,
            ..ValidatorConfig::default()
        },
        RateLimitConfig::default(),
    );
    let subject = fixture.card.subject;

    gate.fetch_ready_tasks_by_card(&fixture.caller, &fixture.request(fixture.token()), minutes(1))
        .await;
    gate.fetch_ready_tasks_by_card(
        &fixture.caller,
        &AccessRequest::new(fixture.offline_token()).with_kvnr(subject.as_str()),
        minutes(2),
    )
    .await;
    let wrong_hcv = AccessRequest::new(fixture.token())
        .with_kvnr(subject.as_str())
        .with_hcv("AAAAAAA");
    let outcome = gate
        .fetch_ready_tasks_by_card(&fixture.caller, &wrong_hcv, minutes(3))
        .await;
    assert_eq!(outcome.status_code(), 458);

    let history = gate.audit_history(&subject).await.unwrap();
    let representations: Vec<_> = history.iter().map(|e| e.representation).collect();
    assert_eq!(
        representations,
        vec![
            AuditRepresentation::PharmacyGetTaskUnsuccessful,
            AuditRepresentation::PharmacyGetTaskSuccessfulPn3,
            AuditRepresentation::PharmacyGetTaskSuccessful,
        ]
    );
    assert!(history[2].evidence.is_some());
    assert!(history[1].evidence.is_none());
    assert!(history.iter().all(|e| e.subject == Some(subject)));
}

#[tokio::test]
async fn test_shared_store_counts_across_gates() {
    let fixture = TestFixture::new();
    let store = Arc::new(MemoryStore::new());
    let a = fixture.gate_with_store(ValidatorConfig::default(), strict_limit(2), store.clone());
    let b = fixture.gate_with_store(ValidatorConfig::default(), strict_limit(2), store.clone());
    let guess = AccessRequest::new(fixture.token()).with_kvnr("X999999999");

    a.fetch_ready_tasks_by_card(&fixture.caller, &guess, minutes(1)).await;
    b.fetch_ready_tasks_by_card(&fixture.caller, &guess, minutes(2)).await;

    let outcome = a
        .fetch_ready_tasks_by_card(&fixture.caller, &fixture.request(fixture.token()), minutes(3))
        .await;
    assert_eq!(outcome.status_code(), 423);
    assert_eq!(store.audit_len().unwrap(), 3);
}

#[tokio::test]
async fn test_sqlite_backed_gate_persists() {
    init_tracing();
    let fixture = TestFixture::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("evidence.db");
    let guess = AccessRequest::new(fixture.token()).with_kvnr("X999999999");

    {
        let gate = AccessGate::with_store(
            fixture.validator(ValidatorConfig::default()),
            strict_limit(2),
            SqliteStore::open(&path).unwrap(),
        );
        let outcome = gate
            .fetch_ready_tasks_by_card(&fixture.caller, &fixture.request(fixture.token()), minutes(1))
            .await;
        assert_eq!(outcome.status_code(), 200);
        gate.fetch_ready_tasks_by_card(&fixture.caller, &guess, minutes(2)).await;
        gate.fetch_ready_tasks_by_card(&fixture.caller, &guess, minutes(3)).await;
    }

    let gate = AccessGate::with_store(
        fixture.validator(ValidatorConfig::default()),
        strict_limit(2),
        SqliteStore::open(&path).unwrap(),
    );
    let outcome = gate
        .fetch_ready_tasks_by_card(&fixture.caller, &fixture.request(fixture.token()), minutes(4))
        .await;
    assert_eq!(outcome.status_code(), 423);

    let history = gate.audit_history(&fixture.card.subject).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(
        history[1].representation,
        AuditRepresentation::PharmacyGetTaskSuccessful
    );
}

/// Admits every attempt but cannot give a reservation back.
struct UnavailableTracker;

#[async_trait]
impl AccessAttemptTracker for UnavailableTracker {
    async fn failure_count(
        &self,
        _: &TelematikId,
        _: DateTime<Utc>,
        _: Duration,
    ) -> vsdm_evidence::store::Result<u32> {
        Ok(0)
    }

    async fn record_failure(
        &self,
        _: &TelematikId,
        _: DateTime<Utc>,
        _: Duration,
    ) -> vsdm_evidence::store::Result<u32> {
        Ok(1)
    }

    async fn admit(
        &self,
        _: &TelematikId,
        _: DateTime<Utc>,
        _: Duration,
        _: u32,
    ) -> vsdm_evidence::store::Result<Admission> {
        Ok(Admission::Admitted { reserved: 1 })
    }

    async fn release(
        &self,
        _: &TelematikId,
        _: DateTime<Utc>,
        _: Duration,
    ) -> vsdm_evidence::store::Result<()> {
        Err(StoreError::InvalidData("tracker offline".into()))
    }

    async fn record_request(
        &self,
        _: &TelematikId,
        _: DateTime<Utc>,
        _: Duration,
    ) -> vsdm_evidence::store::Result<u32> {
        Ok(1)
    }

    async fn reset(&self, _: &TelematikId) -> vsdm_evidence::store::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_failed_release_denies_access() {
    init_tracing();
    let fixture = TestFixture::new();
    let audit = Arc::new(MemoryStore::new());
    let gate = AccessGate::new(
        fixture.validator(ValidatorConfig::default()),
        RateLimitConfig::default(),
        Arc::new(UnavailableTracker),
        audit.clone(),
    );

    // Valid evidence must give its reservation back, which fails.
    let outcome = gate
        .fetch_ready_tasks_by_card(&fixture.caller, &fixture.request(fixture.token()), minutes(1))
        .await;
    assert_eq!(outcome, AccessOutcome::Unavailable);
    assert_eq!(outcome.status_code(), 500);

    // A counted failure keeps its reservation and never releases.
    let guess = AccessRequest::new(fixture.token()).with_kvnr("X999999999");
    let outcome = gate
        .fetch_ready_tasks_by_card(&fixture.caller, &guess, minutes(2))
        .await;
    assert_eq!(outcome.status_code(), 456);
    assert_eq!(audit.audit_len().unwrap(), 1);
}

/// Yields to the scheduler before every store call, so concurrent attempts
/// interleave between their store operations.
struct YieldingTracker(Arc<MemoryStore>);

#[async_trait]
impl AccessAttemptTracker for YieldingTracker {
    async fn failure_count(
        &self,
        caller: &TelematikId,
        now: DateTime<Utc>,
        window: Duration,
    ) -> vsdm_evidence::store::Result<u32> {
        tokio::task::yield_now().await;
        self.0.failure_count(caller, now, window).await
    }

    async fn record_failure(
        &self,
        caller: &TelematikId,
        now: DateTime<Utc>,
        window: Duration,
    ) -> vsdm_evidence::store::Result<u32> {
        tokio::task::yield_now().await;
        self.0.record_failure(caller, now, window).await
    }

    async fn admit(
        &self,
        caller: &TelematikId,
        now: DateTime<Utc>,
        window: Duration,
        threshold: u32,
    ) -> vsdm_evidence::store::Result<Admission> {
        tokio::task::yield_now().await;
        self.0.admit(caller, now, window, threshold).await
    }

    async fn release(
        &self,
        caller: &TelematikId,
        now: DateTime<Utc>,
        window: Duration,
    ) -> vsdm_evidence::store::Result<()> {
        tokio::task::yield_now().await;
        self.0.release(caller, now, window).await
    }

    async fn record_request(
        &self,
        caller: &TelematikId,
        now: DateTime<Utc>,
        window: Duration,
    ) -> vsdm_evidence::store::Result<u32> {
        tokio::task::yield_now().await;
        self.0.record_request(caller, now, window).await
    }

    async fn reset(&self, caller: &TelematikId) -> vsdm_evidence::store::Result<()> {
        tokio::task::yield_now().await;
        self.0.reset(caller).await
    }
}

#[tokio::test]
async fn test_concurrent_attempts_cannot_pass_lockout() {
    init_tracing();
    let fixture = TestFixture::new();
    let gate = AccessGate::new(
        fixture.validator(ValidatorConfig::default()),
        RateLimitConfig {
            threshold: 1,
            requests_per_minute: 100,
            ..RateLimitConfig::default()
        },
        Arc::new(YieldingTracker(Arc::new(MemoryStore::new()))),
        Arc::new(MemoryStore::new()),
    );
    let guess = AccessRequest::new(fixture.token()).with_kvnr("X999999999");
    let attempt = || gate.fetch_ready_tasks_by_card(&fixture.caller, &guess, minutes(1));

    let (a, b, c, d, e) = tokio::join!(attempt(), attempt(), attempt(), attempt(), attempt());
    let mut codes: Vec<u16> = [a, b, c, d, e].iter().map(AccessOutcome::status_code).collect();
    codes.sort_unstable();
    assert_eq!(codes, vec![423, 423, 423, 423, 456]);

    let failures = gate
        .rate_limiter()
        .failures(&fixture.caller, minutes(1))
        .await
        .unwrap();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn test_requests_per_minute_throttled() {
    init_tracing();
    let fixture = TestFixture::new();
    let gate = fixture.gate(ValidatorConfig::default(), RateLimitConfig::default());
    let start = minutes(1);

    for s in 0..5 {
        let outcome = gate
            .fetch_ready_tasks_by_card(
                &fixture.caller,
                &fixture.request(fixture.token()),
                start + Duration::seconds(s),
            )
            .await;
        assert_eq!(outcome.status_code(), 200);
    }

    let outcome = gate
        .fetch_ready_tasks_by_card(
            &fixture.caller,
            &fixture.request(fixture.token()),
            start + Duration::seconds(30),
        )
        .await;
    assert_eq!(outcome, AccessOutcome::TooManyRequests);
    assert_eq!(outcome.status_code(), 429);

    // Throttling is per caller and does not count as a failure.
    let other = &pharmacies(1)[0];
    let outcome = gate
        .fetch_ready_tasks_by_card(other, &fixture.request(fixture.token()), start + Duration::seconds(31))
        .await;
    assert_eq!(outcome.status_code(), 200);
    assert_eq!(gate.rate_limiter().failures(&fixture.caller, start).await.unwrap(), 0);

    let outcome = gate
        .fetch_ready_tasks_by_card(&fixture.caller, &fixture.request(fixture.token()), start + Duration::seconds(60))
        .await;
    assert_eq!(outcome.status_code(), 200);
}

#[tokio::test]
async fn test_stale_offline_evidence_rejected() {
    let fixture = TestFixture::new();
    let gate = fixture.gate(
        ValidatorConfig {
            accept_pn3: true,
            ..ValidatorConfig::default()
        },
        RateLimitConfig::default(),
    );
    let subject = fixture.card.subject;
    let later = t0() + Duration::days(365);

    let stale = AccessRequest::new(fixture.offline_token()).with_kvnr(subject.as_str());
    let outcome = gate
        .fetch_ready_tasks_by_card(&fixture.caller, &stale, later)
        .await;
    assert_eq!(outcome, AccessOutcome::Rejected(ValidationError::EvidenceExpired));
    assert_eq!(outcome.status_code(), 403);

    let fresh = AccessRequest::new(fixture.offline_token_at(later)).with_kvnr(subject.as_str());
    let outcome = gate
        .fetch_ready_tasks_by_card(&fixture.caller, &fresh, later + Duration::minutes(1))
        .await;
    assert_eq!(outcome.status_code(), 202);
}

#[test]
fn test_out_of_range_config_rejected() {
    let build = |config: &GateConfig| {
        AccessGate::from_config(config, Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    };
    assert!(build(&GateConfig::default()).is_ok());

    let mut config = GateConfig::default();
    config.rate_limit.window_secs = i64::MAX;
    assert!(build(&config).is_err());

    let mut config = GateConfig::default();
    config.validator.max_age_secs = i64::MAX;
    assert!(build(&config).is_err());

    let mut config = GateConfig::default();
    config.rate_limit.requests_per_minute = 0;
    assert!(build(&config).is_err());
}

#[tokio::test]
async fn test_query_string_request() {
    let fixture = TestFixture::new();
    let gate = fixture.gate(ValidatorConfig::default(), RateLimitConfig::default());

    let token = fixture.token().replace('+', "%2B").replace('/', "%2F").replace('=', "%3D");
    let query = format!("pnw={}&kvnr={}&hcv={}", token, fixture.card.subject, fixture.hcv_param());
    let request = AccessRequest::from_query(&query);

    let outcome = gate
        .fetch_ready_tasks_by_card(&fixture.caller, &request, minutes(1))
        .await;
    assert_eq!(outcome.status_code(), 200);

    let unknown = Kvnr::parse("A000000000").unwrap();
    assert!(gate.audit_history(&unknown).await.unwrap().is_empty());
}
