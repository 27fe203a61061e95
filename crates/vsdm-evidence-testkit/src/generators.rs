//! Proptest generators for property-based testing.

use chrono::{DateTime, NaiveDate, Utc};
use proptest::prelude::*;

use vsdm_evidence_core::{
    CardContext, CheckDigitGenerator, CheckDigitVersion, EvidenceRecord, EvidenceResult, HmacKey,
    IssuerKey, KeyVersion, Kvnr, ManufacturerId,
};

/// Generate a well-formed KVNR.
pub fn kvnr() -> impl Strategy<Value = Kvnr> {
    "[A-Z][0-9]{9}".prop_filter_map("valid KVNR", |s| Kvnr::parse(&s).ok())
}

/// Generate a manufacturer id.
pub fn manufacturer() -> impl Strategy<Value = ManufacturerId> {
    "[A-Z0-9]{2}".prop_filter_map("valid manufacturer", |s| ManufacturerId::parse(&s).ok())
}

/// Generate a key version.
pub fn key_version() -> impl Strategy<Value = KeyVersion> {
    "[A-Z0-9]{2}".prop_filter_map("valid key version", |s| KeyVersion::parse(&s).ok())
}

/// Generate a random HMAC key.
pub fn hmac_key() -> impl Strategy<Value = HmacKey> {
    any::<[u8; 32]>().prop_map(HmacKey::from_bytes)
}

/// Generate an evidence result code.
pub fn evidence_result() -> impl Strategy<Value = EvidenceResult> {
    prop::sample::select(EvidenceResult::ALL.to_vec())
}

/// Generate a check digit generation.
pub fn version() -> impl Strategy<Value = CheckDigitVersion> {
    prop_oneof![Just(CheckDigitVersion::V1), Just(CheckDigitVersion::V2)]
}

/// Generate an issuance time whose Unix seconds fit the ten digit issued-at field.
pub fn timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..=9_999_999_999i64).prop_filter_map("representable time", |secs| {
        DateTime::from_timestamp(secs, 0)
    })
}

/// Generate a street, including non-ASCII letters.
pub fn street() -> impl Strategy<Value = String> {
    "[A-Za-zäöüßÄÖÜ. -]{1,30}[0-9]{0,3}".prop_map(String::from)
}

/// Generate an insurance start date.
pub fn insurance_start() -> impl Strategy<Value = NaiveDate> {
    (1990i32..=2030, 1u32..=12, 1u32..=28)
        .prop_filter_map("valid date", |(y, m, d)| NaiveDate::from_ymd_opt(y, m, d))
}

/// Generate the card data a check digit is issued for.
pub fn card_context() -> impl Strategy<Value = CardContext> {
    (kvnr(), insurance_start(), street()).prop_map(|(subject, insurance_start, street)| {
        CardContext {
            subject,
            insurance_start,
            street,
        }
    })
}

/// Generate arbitrary token text, printable or not.
pub fn token_text(max_len: usize) -> impl Strategy<Value = String> {
    prop_oneof![
        "[A-Za-z0-9+/=_-]{0,200}".prop_map(String::from),
        prop::collection::vec(any::<char>(), 0..=max_len).prop_map(|c| c.into_iter().collect()),
    ]
}

/// Parameters for issuing an evidence record.
#[derive(Debug, Clone)]
pub struct EvidenceParams {
    pub issuer: IssuerKey,
    pub card: CardContext,
    pub version: CheckDigitVersion,
    pub result: EvidenceResult,
    pub issued_at: DateTime<Utc>,
}

impl Arbitrary for EvidenceParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            manufacturer(),
            key_version(),
            any::<[u8; 32]>(), // key
            card_context(),
            version(),
            evidence_result(),
            timestamp(),
        )
            .prop_map(
                |(manufacturer, key_version, key, card, version, result, issued_at)| EvidenceParams {
                    issuer: IssuerKey {
                        manufacturer,
                        key_version,
                        key: HmacKey::from_bytes(key),
                    },
                    card,
                    version,
                    result,
                    issued_at,
                },
            )
            .boxed()
    }
}

/// Issue an evidence record from parameters.
pub fn record_from_params(params: &EvidenceParams) -> EvidenceRecord {
    CheckDigitGenerator::new(params.issuer.clone())
        .version(params.version)
        .issue(&params.card, params.result, params.issued_at)
        .expect("generated issued-at fits the check digit")
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsdm_evidence_core::layout::check_digit_bytes;

    proptest! {
        #[test]
        fn test_issuance_deterministic(params: EvidenceParams) {
            let r1 = record_from_params(&params);
            let r2 = record_from_params(&params);

            prop_assert_eq!(r1, r2);
        }

        #[test]
        fn test_digit_binds_subject(params: EvidenceParams) {
            let record = record_from_params(&params);
            let digit = record.check_digit.unwrap();

            prop_assert_eq!(digit.subject(), &params.card.subject);
            prop_assert_eq!(digit.version(), params.version);
        }

        #[test]
        fn test_mac_differs_across_keys(
            params in any::<EvidenceParams>(),
            seed_a in any::<[u8; 32]>(),
            seed_b in any::<[u8; 32]>(),
        ) {
            prop_assume!(seed_a != seed_b);

            let mut a = params.clone();
            a.issuer.key = HmacKey::from_bytes(seed_a);
            let mut b = params;
            b.issuer.key = HmacKey::from_bytes(seed_b);

            let a = record_from_params(&a).check_digit.unwrap();
            let b = record_from_params(&b).check_digit.unwrap();

            prop_assert_eq!(a.claims(), b.claims());
            prop_assert_ne!(check_digit_bytes(&a), check_digit_bytes(&b));
        }
    }
}
