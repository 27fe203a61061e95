//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: one trust service key, one card,
//! one pharmacy, and a fixed reference time.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use vsdm_evidence::{AccessGate, RateLimitConfig};
use vsdm_evidence_core::{
    codec, AccessRequest, CardContext, CheckDigitGenerator, CheckDigitValidator, EvidenceRecord,
    EvidenceResult, HmacKey, IssuerKey, KeyRing, KeyVersion, Kvnr, ManufacturerId, TelematikId,
    ValidatorConfig,
};
use vsdm_evidence_store::MemoryStore;

/// Reference issuance time: 2025-01-14T16:00:00Z.
pub const T0: i64 = 1_736_870_400;

/// The reference time as a `DateTime`.
pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(T0, 0).unwrap_or_default()
}

/// A trust service key, a card and a pharmacy.
pub struct TestFixture {
    pub issuer: IssuerKey,
    pub card: CardContext,
    pub caller: TelematikId,
}

impl TestFixture {
    /// The reference scenario: KVNR `X110498565`, manufacturer `M1`, key version `K1`.
    pub fn new() -> Self {
        Self::with_seed([0x42; 32])
    }

    /// Same scenario with a deterministic key from seed.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            issuer: IssuerKey {
                manufacturer: ManufacturerId::parse("M1").expect("valid manufacturer"),
                key_version: KeyVersion::parse("K1").expect("valid key version"),
                key: HmacKey::from_bytes(seed),
            },
            card: CardContext {
                subject: Kvnr::parse("X110498565").expect("valid KVNR"),
                insurance_start: NaiveDate::from_ymd_opt(2020, 1, 1).expect("valid date"),
                street: "Musterstr.".into(),
            },
            caller: TelematikId::parse("3-SMC-B-Testkarte-883110000116873").expect("valid Telematik-ID"),
        }
    }

    /// A key ring accepting the fixture's issuer.
    pub fn key_ring(&self) -> KeyRing {
        KeyRing::new().with_key(
            self.issuer.manufacturer,
            self.issuer.key_version,
            self.issuer.key.clone(),
        )
    }

    /// A validator accepting the fixture's issuer.
    pub fn validator(&self, config: ValidatorConfig) -> CheckDigitValidator {
        CheckDigitValidator::new(self.key_ring(), config)
    }

    /// A V2 generator for the fixture's issuer.
    pub fn generator(&self) -> CheckDigitGenerator {
        CheckDigitGenerator::new(self.issuer.clone())
    }

    /// Evidence issued for the fixture's card at `now`.
    pub fn record(&self, result: EvidenceResult, now: DateTime<Utc>) -> EvidenceRecord {
        self.generator()
            .issue(&self.card, result, now)
            .expect("fixture time fits the check digit")
    }

    /// A valid V2 token issued at [`t0`].
    pub fn token(&self) -> String {
        self.encode(&self.record(EvidenceResult::NoUpdatesNeeded, t0()))
    }

    /// An offline PN3 token issued at [`t0`].
    pub fn offline_token(&self) -> String {
        self.offline_token_at(t0())
    }

    /// An offline PN3 token issued at `now`.
    pub fn offline_token_at(&self, now: DateTime<Utc>) -> String {
        self.encode(&EvidenceRecord::offline(
            EvidenceResult::UpdatesTechnicallyImpossible,
            now,
        ))
    }

    /// The wire token of `record`.
    pub fn encode(&self, record: &EvidenceRecord) -> String {
        codec::encode(record).expect("fixture record encodes")
    }

    /// The `hcv` parameter matching the fixture's card.
    pub fn hcv_param(&self) -> String {
        self.card.hash_check_value().to_param()
    }

    /// A fully matching request for `token`.
    pub fn request(&self, token: impl Into<String>) -> AccessRequest {
        AccessRequest::new(token)
            .with_kvnr(self.card.subject.as_str())
            .with_hcv(self.hcv_param())
    }

    /// A gate over a fresh in-memory store.
    pub fn gate(&self, config: ValidatorConfig, rate_limit: RateLimitConfig) -> AccessGate<MemoryStore, MemoryStore> {
        AccessGate::with_store(self.validator(config), rate_limit, MemoryStore::new())
    }

    /// A gate over the given shared store.
    pub fn gate_with_store(
        &self,
        config: ValidatorConfig,
        rate_limit: RateLimitConfig,
        store: Arc<MemoryStore>,
    ) -> AccessGate<MemoryStore, MemoryStore> {
        AccessGate::new(self.validator(config), rate_limit, store.clone(), store)
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Distinct pharmacies for multi-caller tests.
pub fn pharmacies(count: usize) -> Vec<TelematikId> {
    (0..count)
        .filter_map(|i| TelematikId::parse(&format!("3-SMC-B-Testkarte-{:015}", i)).ok())
        .collect()
}
