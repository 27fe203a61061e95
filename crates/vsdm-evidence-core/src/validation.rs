//! Exam evidence validation.
//!
//! The validator is pure: it decodes the token, re-derives the expected MAC
//! from the configured key ring and evaluates an ordered chain of predicates.
//! The first failing predicate decides the outcome. Rate limiting and audit
//! are the caller's business.

use chrono::{DateTime, Duration, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::crypto::{HashCheckValue, KeyRing};
use crate::error::ValidationError;
use crate::evidence::{CardStatus, CheckDigit, CheckDigitVersion, EvidenceRecord};
use crate::layout::signed_message;
use crate::types::Kvnr;

/// Validator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Accept offline (PN3) evidence without a check digit.
    pub accept_pn3: bool,
    /// Require the `hcv` parameter.
    pub enforce_hcv_check: bool,
    /// Require the `kvnr` parameter for evidence with a check digit.
    pub require_identity_parameter: bool,
    /// Oldest accepted issuance, in seconds before now. Inclusive.
    pub max_age_secs: i64,
    /// Furthest accepted issuance, in seconds after now. Inclusive.
    pub max_future_skew_secs: i64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            accept_pn3: false,
            enforce_hcv_check: false,
            require_identity_parameter: true,
            max_age_secs: 30 * 60,
            max_future_skew_secs: 5 * 60,
        }
    }
}

/// The query parameters of an access attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    /// Exam evidence token.
    pub pnw: Option<String>,
    /// Identity parameter.
    pub kvnr: Option<String>,
    /// Hash check value parameter.
    pub hcv: Option<String>,
}

impl AccessRequest {
    /// A request carrying only a token.
    pub fn new(pnw: impl Into<String>) -> Self {
        Self {
            pnw: Some(pnw.into()),
            ..Self::default()
        }
    }

    /// Set the identity parameter.
    pub fn with_kvnr(mut self, kvnr: impl Into<String>) -> Self {
        self.kvnr = Some(kvnr.into());
        self
    }

    /// Set the hash check value parameter.
    pub fn with_hcv(mut self, hcv: impl Into<String>) -> Self {
        self.hcv = Some(hcv.into());
        self
    }

    /// Parse from a URL query string such as `pnw=...&kvnr=X110498565`.
    ///
    /// Percent escapes are decoded. `+` is kept literally, since it is a
    /// base64 symbol and never encodes a space in these parameters. Unknown
    /// parameters are ignored; for repeated ones the first occurrence wins.
    /// Empty values count as absent.
    pub fn from_query(query: &str) -> Self {
        let mut request = Self::default();
        for pair in query.trim_start_matches('?').split('&') {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let slot = match name {
                "pnw" => &mut request.pnw,
                "kvnr" => &mut request.kvnr,
                "hcv" => &mut request.hcv,
                _ => continue,
            };
            let value = percent_decode_str(value).decode_utf8_lossy();
            if slot.is_none() && !value.is_empty() {
                *slot = Some(value.into_owned());
            }
        }
        request
    }

    /// The identity parameter, if present and well-formed.
    pub fn identity(&self) -> Option<Kvnr> {
        self.kvnr.as_deref().and_then(|k| Kvnr::parse(k.trim()).ok())
    }
}

/// Assurance level of a granted access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Assurance {
    /// A verified check digit.
    Full,
    /// Offline evidence without a check digit.
    Pn3Reduced,
}

/// A successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// The patient access is granted for.
    pub subject: Kvnr,
    pub assurance: Assurance,
    /// The decoded evidence.
    pub record: EvidenceRecord,
}

impl Verdict {
    /// Check digit generation, `None` for PN3 access.
    pub fn version(&self) -> Option<CheckDigitVersion> {
        self.record.check_digit.as_ref().map(CheckDigit::version)
    }
}

/// Validation outcome together with whatever evidence could be decoded.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub record: Option<EvidenceRecord>,
    pub outcome: Result<Verdict, ValidationError>,
}

/// Validates exam evidence against a key ring.
#[derive(Debug, Clone)]
pub struct CheckDigitValidator {
    keys: KeyRing,
    config: ValidatorConfig,
}

impl CheckDigitValidator {
    pub fn new(keys: KeyRing, config: ValidatorConfig) -> Self {
        Self { keys, config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate an access request at `now`.
    pub fn validate(&self, request: &AccessRequest, now: DateTime<Utc>) -> Result<Verdict, ValidationError> {
        self.evaluate(request, now).outcome
    }

    /// Validate an access request, keeping the decoded record for attribution.
    pub fn evaluate(&self, request: &AccessRequest, now: DateTime<Utc>) -> Evaluation {
        let token = match request.pnw.as_deref().map(str::trim) {
            None | Some("") => {
                return Evaluation {
                    record: None,
                    outcome: Err(ValidationError::NoEvidenceSupplied),
                }
            }
            Some(token) => token,
        };

        let record = match codec::decode(token) {
            Ok(record) => record,
            Err(e) => {
                return Evaluation {
                    record: None,
                    outcome: Err(e.into()),
                }
            }
        };

        let outcome = self.check(record.clone(), request, now);
        Evaluation {
            record: Some(record),
            outcome,
        }
    }

    fn check(
        &self,
        record: EvidenceRecord,
        request: &AccessRequest,
        now: DateTime<Utc>,
    ) -> Result<Verdict, ValidationError> {
        let digit = match record.check_digit {
            Some(digit) => digit,
            None => {
                let subject = self.check_offline(&record, request)?;
                self.check_freshness(record.timestamp, now)?;
                return Ok(Verdict {
                    subject,
                    assurance: Assurance::Pn3Reduced,
                    record,
                });
            }
        };

        if !record.result.permits_full_access() {
            return Err(ValidationError::EvidenceResultRejected(record.result.code()));
        }

        self.check_signature(&digit)?;

        if digit.card_status() == CardStatus::Revoked {
            return Err(ValidationError::CardRevoked);
        }

        self.check_freshness(digit.claims().issued_at, now)?;
        self.check_freshness(record.timestamp, now)?;

        self.check_identity(&digit, request)?;
        self.check_hash_value(&digit, request)?;

        Ok(Verdict {
            subject: *digit.subject(),
            assurance: Assurance::Full,
            record,
        })
    }

    fn check_offline(&self, record: &EvidenceRecord, request: &AccessRequest) -> Result<Kvnr, ValidationError> {
        let pn3_result = record.result.is_pn3();
        if !pn3_result || !self.config.accept_pn3 {
            return Err(ValidationError::ChecksumMissing { pn3_result });
        }
        request.identity().ok_or(ValidationError::MissingIdentityParameter)
    }

    fn check_signature(&self, digit: &CheckDigit) -> Result<(), ValidationError> {
        let claims = digit.claims();
        let key = self
            .keys
            .resolve(&claims.manufacturer, &claims.key_version)
            .ok_or(ValidationError::SignatureInvalid)?;

        let expected = key.compute_mac(&signed_message(digit));
        if !digit.mac().verify(&expected) {
            return Err(ValidationError::SignatureInvalid);
        }
        Ok(())
    }

    /// Tolerances that overflow the time range reject everything.
    fn check_freshness(&self, issued_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let oldest = Duration::try_seconds(self.config.max_age_secs).and_then(|d| now.checked_sub_signed(d));
        let newest =
            Duration::try_seconds(self.config.max_future_skew_secs).and_then(|d| now.checked_add_signed(d));
        match (oldest, newest) {
            (Some(oldest), Some(newest)) if oldest <= issued_at && issued_at <= newest => Ok(()),
            _ => Err(ValidationError::EvidenceExpired),
        }
    }

    fn check_identity(&self, digit: &CheckDigit, request: &AccessRequest) -> Result<(), ValidationError> {
        let kvnr = match request.kvnr.as_deref().map(str::trim) {
            None | Some("") if self.config.require_identity_parameter => {
                return Err(ValidationError::MissingIdentityParameter)
            }
            None | Some("") => return Ok(()),
            Some(kvnr) => kvnr,
        };

        if kvnr.as_bytes() != digit.subject().as_bytes() {
            return Err(ValidationError::IdentityMismatch);
        }
        Ok(())
    }

    fn check_hash_value(&self, digit: &CheckDigit, request: &AccessRequest) -> Result<(), ValidationError> {
        let param = match request.hcv.as_deref() {
            Some(param) => param,
            None if self.config.enforce_hcv_check => return Err(ValidationError::HashCheckValueMissing),
            None => return Ok(()),
        };

        let Some(embedded) = digit.hash_check_value() else {
            return Ok(());
        };

        match HashCheckValue::from_param(param) {
            Some(supplied) if supplied.matches(embedded) => Ok(()),
            _ => Err(ValidationError::HashCheckValueMismatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HmacKey;
    use crate::evidence::EvidenceResult;
    use crate::generator::{CardContext, CheckDigitFault, CheckDigitGenerator, IssuerKey};
    use crate::types::{KeyVersion, ManufacturerId};
    use chrono::NaiveDate;

    fn issuer() -> IssuerKey {
        IssuerKey {
            manufacturer: ManufacturerId::parse("M1").unwrap(),
            key_version: KeyVersion::parse("K1").unwrap(),
            key: HmacKey::from_bytes([0x42; 32]),
        }
    }

    fn card() -> CardContext {
        CardContext {
            subject: Kvnr::parse("X110498565").unwrap(),
            insurance_start: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            street: "Musterstr.".into(),
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_736_870_400, 0).unwrap()
    }

    fn validator(config: ValidatorConfig) -> CheckDigitValidator {
        let issuer = issuer();
        let keys = KeyRing::new().with_key(issuer.manufacturer, issuer.key_version, issuer.key);
        CheckDigitValidator::new(keys, config)
    }

    fn token(gen: &CheckDigitGenerator, result: EvidenceResult) -> String {
        codec::encode(&gen.issue(&card(), result, t0()).unwrap()).unwrap()
    }

    fn valid_request() -> AccessRequest {
        AccessRequest::new(token(&CheckDigitGenerator::new(issuer()), EvidenceResult::NoUpdatesNeeded))
            .with_kvnr("X110498565")
            .with_hcv(card().hash_check_value().to_param())
    }

    #[test]
    fn test_full_success() {
        let verdict = validator(ValidatorConfig::default())
            .validate(&valid_request(), t0() + Duration::minutes(10))
            .unwrap();
        assert_eq!(verdict.subject, card().subject);
        assert_eq!(verdict.assurance, Assurance::Full);
        assert_eq!(verdict.version(), Some(CheckDigitVersion::V2));
    }

    #[test]
    fn test_no_evidence() {
        let v = validator(ValidatorConfig::default());
        assert_eq!(
            v.validate(&AccessRequest::default(), t0()),
            Err(ValidationError::NoEvidenceSupplied)
        );
        assert_eq!(
            v.validate(&AccessRequest::new(""), t0()),
            Err(ValidationError::NoEvidenceSupplied)
        );
    }

    #[test]
    fn test_malformed() {
        let err = validator(ValidatorConfig::default())
            .validate(&AccessRequest::new("bm90IGd6aXA=").with_kvnr("X110498565"), t0())
            .unwrap_err();
        assert!(matches!(err, ValidationError::MalformedEvidence(_)));
    }

    #[test]
    fn test_identity_mismatch() {
        let request = valid_request().with_kvnr("X999999999");
        let err = validator(ValidatorConfig::default())
            .validate(&request, t0() + Duration::minutes(10))
            .unwrap_err();
        assert_eq!(err, ValidationError::IdentityMismatch);
        assert!(err.counts_against_rate_limit());
    }

    #[test]
    fn test_missing_identity_parameter() {
        let request = AccessRequest {
            kvnr: None,
            ..valid_request()
        };
        assert_eq!(
            validator(ValidatorConfig::default()).validate(&request, t0()),
            Err(ValidationError::MissingIdentityParameter)
        );

        let lenient = ValidatorConfig {
            require_identity_parameter: false,
            ..ValidatorConfig::default()
        };
        assert!(validator(lenient).validate(&request, t0()).is_ok());
    }

    #[test]
    fn test_freshness_boundaries() {
        let v = validator(ValidatorConfig::default());
        let request = valid_request();

        assert!(v.validate(&request, t0() + Duration::seconds(1800)).is_ok());
        assert_eq!(
            v.validate(&request, t0() + Duration::seconds(1801)),
            Err(ValidationError::EvidenceExpired)
        );

        assert!(v.validate(&request, t0() - Duration::seconds(300)).is_ok());
        assert_eq!(
            v.validate(&request, t0() - Duration::seconds(301)),
            Err(ValidationError::EvidenceExpired)
        );
    }

    #[test]
    fn test_fault_hooks() {
        let v = validator(ValidatorConfig::default());
        let expectations = [
            (CheckDigitFault::InvalidManufacturer, ValidationError::SignatureInvalid),
            (CheckDigitFault::InvalidKeyVersion, ValidationError::SignatureInvalid),
            (CheckDigitFault::InvalidSubject, ValidationError::SignatureInvalid),
            (CheckDigitFault::InvalidKey, ValidationError::SignatureInvalid),
            (CheckDigitFault::ExpiredIssuedAt, ValidationError::EvidenceExpired),
            (CheckDigitFault::FutureIssuedAt, ValidationError::EvidenceExpired),
            (CheckDigitFault::RevokedCard, ValidationError::CardRevoked),
        ];
        for (fault, expected) in expectations {
            let gen = CheckDigitGenerator::new(issuer()).with_fault(fault);
            let request = AccessRequest {
                pnw: Some(token(&gen, EvidenceResult::NoUpdatesNeeded)),
                ..valid_request()
            };
            assert_eq!(v.validate(&request, t0()), Err(expected), "{:?}", fault);
        }
    }

    #[test]
    fn test_unknown_key_is_signature_invalid() {
        let v = CheckDigitValidator::new(KeyRing::new(), ValidatorConfig::default());
        assert_eq!(
            v.validate(&valid_request(), t0()),
            Err(ValidationError::SignatureInvalid)
        );
    }

    #[test]
    fn test_result_rejected() {
        let request = AccessRequest {
            pnw: Some(token(
                &CheckDigitGenerator::new(issuer()),
                EvidenceResult::OfflinePeriodExceeded,
            )),
            ..valid_request()
        };
        assert_eq!(
            validator(ValidatorConfig::default()).validate(&request, t0()),
            Err(ValidationError::EvidenceResultRejected(6))
        );
    }

    #[test]
    fn test_pn3_gating() {
        let offline = codec::encode(&EvidenceRecord::offline(
            EvidenceResult::UpdatesTechnicallyImpossible,
            t0(),
        ))
        .unwrap();
        let request = AccessRequest::new(offline.clone()).with_kvnr("X110498565");

        assert_eq!(
            validator(ValidatorConfig::default()).validate(&request, t0()),
            Err(ValidationError::ChecksumMissing { pn3_result: true })
        );

        let pn3 = ValidatorConfig {
            accept_pn3: true,
            ..ValidatorConfig::default()
        };
        let verdict = validator(pn3.clone()).validate(&request, t0()).unwrap();
        assert_eq!(verdict.assurance, Assurance::Pn3Reduced);
        assert_eq!(verdict.subject, card().subject);
        assert_eq!(verdict.version(), None);

        assert_eq!(
            validator(pn3).validate(&AccessRequest::new(offline), t0()),
            Err(ValidationError::MissingIdentityParameter)
        );
    }

    #[test]
    fn test_pn3_timestamp_freshness() {
        let pn3 = validator(ValidatorConfig {
            accept_pn3: true,
            ..ValidatorConfig::default()
        });
        let offline = codec::encode(&EvidenceRecord::offline(
            EvidenceResult::UpdatesTechnicallyImpossible,
            t0(),
        ))
        .unwrap();
        let request = AccessRequest::new(offline).with_kvnr("X110498565");

        assert!(pn3.validate(&request, t0() + Duration::seconds(1800)).is_ok());
        assert_eq!(
            pn3.validate(&request, t0() + Duration::seconds(1801)),
            Err(ValidationError::EvidenceExpired)
        );
        assert_eq!(
            pn3.validate(&request, t0() + Duration::days(365)),
            Err(ValidationError::EvidenceExpired)
        );
        assert_eq!(
            pn3.validate(&request, t0() - Duration::seconds(301)),
            Err(ValidationError::EvidenceExpired)
        );
    }

    #[test]
    fn test_out_of_range_tolerances_reject() {
        for config in [
            ValidatorConfig {
                max_age_secs: i64::MAX,
                ..ValidatorConfig::default()
            },
            ValidatorConfig {
                max_future_skew_secs: i64::MAX,
                ..ValidatorConfig::default()
            },
            ValidatorConfig {
                max_age_secs: i64::MAX / 1000,
                max_future_skew_secs: i64::MAX / 1000,
                ..ValidatorConfig::default()
            },
        ] {
            assert_eq!(
                validator(config).validate(&valid_request(), t0()),
                Err(ValidationError::EvidenceExpired)
            );
        }
    }

    #[test]
    fn test_offline_non_pn3_result() {
        let offline = codec::encode(&EvidenceRecord::offline(EvidenceResult::NoUpdatesNeeded, t0())).unwrap();
        let pn3 = ValidatorConfig {
            accept_pn3: true,
            ..ValidatorConfig::default()
        };
        assert_eq!(
            validator(pn3).validate(&AccessRequest::new(offline).with_kvnr("X110498565"), t0()),
            Err(ValidationError::ChecksumMissing { pn3_result: false })
        );
    }

    #[test]
    fn test_hash_check_value() {
        let enforced = ValidatorConfig {
            enforce_hcv_check: true,
            ..ValidatorConfig::default()
        };
        let without_hcv = AccessRequest {
            hcv: None,
            ..valid_request()
        };
        assert_eq!(
            validator(enforced.clone()).validate(&without_hcv, t0()),
            Err(ValidationError::HashCheckValueMissing)
        );
        assert!(validator(ValidatorConfig::default()).validate(&without_hcv, t0()).is_ok());

        let wrong = CardContext {
            street: "Musterweg".into(),
            ..card()
        };
        for hcv in [wrong.hash_check_value().to_param(), "garbage!".to_string()] {
            let request = AccessRequest {
                hcv: Some(hcv),
                ..valid_request()
            };
            let err = validator(ValidatorConfig::default()).validate(&request, t0()).unwrap_err();
            assert_eq!(err, ValidationError::HashCheckValueMismatch);
            assert!(err.counts_against_rate_limit());
        }
    }

    #[test]
    fn test_v1_ignores_hcv_parameter() {
        let gen = CheckDigitGenerator::new(issuer()).version(CheckDigitVersion::V1);
        let request = AccessRequest::new(token(&gen, EvidenceResult::UpdatesApplied))
            .with_kvnr("X110498565")
            .with_hcv("AAAAAAA");
        let verdict = validator(ValidatorConfig::default()).validate(&request, t0()).unwrap();
        assert_eq!(verdict.version(), Some(CheckDigitVersion::V1));

        let enforced = ValidatorConfig {
            enforce_hcv_check: true,
            ..ValidatorConfig::default()
        };
        let without_hcv = AccessRequest { hcv: None, ..request };
        assert_eq!(
            validator(enforced).validate(&without_hcv, t0()),
            Err(ValidationError::HashCheckValueMissing)
        );
    }

    #[test]
    fn test_evaluate_keeps_record() {
        let request = AccessRequest {
            kvnr: Some("X999999999".into()),
            ..valid_request()
        };
        let evaluation = validator(ValidatorConfig::default()).evaluate(&request, t0());
        assert!(evaluation.outcome.is_err());
        assert_eq!(
            evaluation.record.unwrap().check_digit.unwrap().subject(),
            &card().subject
        );
    }

    #[test]
    fn test_from_query() {
        let request = AccessRequest::from_query("?pnw=H4sI%2Bab%2F%3D%3D&kvnr=X110498565&foo=1&kvnr=Y000000000&hcv=");
        assert_eq!(request.pnw.as_deref(), Some("H4sI+ab/=="));
        assert_eq!(request.kvnr.as_deref(), Some("X110498565"));
        assert_eq!(request.hcv, None);
        assert_eq!(request.identity(), Kvnr::parse("X110498565").ok());

        let plus = AccessRequest::from_query("pnw=a+b");
        assert_eq!(plus.pnw.as_deref(), Some("a+b"));

        let stray = AccessRequest::from_query("pnw=ab%2&kvnr=%zz1");
        assert_eq!(stray.pnw.as_deref(), Some("ab%2"));
        assert_eq!(stray.kvnr.as_deref(), Some("%zz1"));
        assert_eq!(AccessRequest::from_query(""), AccessRequest::default());
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: ValidatorConfig = serde_json::from_str(r#"{"accept_pn3":true}"#).unwrap();
        assert!(config.accept_pn3);
        assert_eq!(config.max_age_secs, 1800);
        assert!(config.require_identity_parameter);
    }
}
