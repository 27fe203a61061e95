//! Check digit issuance, as performed by a trust service after a card read.
//!
//! The fault hooks produce deliberately defective evidence for negative tests.
//! Each one changes exactly one field relative to a correct digit.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{HashCheckValue, HmacKey};
use crate::error::CoreError;
use crate::evidence::{
    truncate_to_seconds, CardStatus, CheckDigit, CheckDigitClaims, CheckDigitV1, CheckDigitV2,
    CheckDigitVersion, EvidenceRecord, EvidenceResult,
};
use crate::layout::{issued_at_in_range, signed_message_v1, signed_message_v2};
use crate::types::{KeyVersion, Kvnr, ManufacturerId};

/// How far in the past [`CheckDigitFault::ExpiredIssuedAt`] places issued-at.
pub const EXPIRED_OFFSET_SECS: i64 = 31 * 60;

/// How far in the future [`CheckDigitFault::FutureIssuedAt`] places issued-at.
pub const FUTURE_OFFSET_SECS: i64 = 40 * 60;

/// Key configuration of an issuing trust service.
#[derive(Debug, Clone)]
pub struct IssuerKey {
    pub manufacturer: ManufacturerId,
    pub key_version: KeyVersion,
    pub key: HmacKey,
}

/// The card data a check digit is issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardContext {
    /// The patient the card belongs to.
    pub subject: Kvnr,
    /// Start of the insurance relationship.
    pub insurance_start: NaiveDate,
    /// Street of the patient's address, as stored on the card.
    pub street: String,
}

impl CardContext {
    /// The hash check value a pharmacy derives from this card.
    pub fn hash_check_value(&self) -> HashCheckValue {
        HashCheckValue::derive(self.insurance_start, &self.street)
    }
}

/// Defects a generator can inject into an issued check digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckDigitFault {
    /// Manufacturer id replaced after the MAC was computed.
    InvalidManufacturer,
    /// Key version replaced after the MAC was computed.
    InvalidKeyVersion,
    /// Subject replaced after the MAC was computed.
    InvalidSubject,
    /// MAC computed with a key other than the configured one.
    InvalidKey,
    /// Correctly signed, with issued-at too far in the past.
    ExpiredIssuedAt,
    /// Correctly signed, with issued-at too far in the future.
    FutureIssuedAt,
    /// Correctly signed, with a revoked card status. V2 only.
    RevokedCard,
}

impl CheckDigitFault {
    /// Every fault hook.
    pub const ALL: [CheckDigitFault; 7] = [
        Self::InvalidManufacturer,
        Self::InvalidKeyVersion,
        Self::InvalidSubject,
        Self::InvalidKey,
        Self::ExpiredIssuedAt,
        Self::FutureIssuedAt,
        Self::RevokedCard,
    ];
}

/// Issues evidence records with keyed check digits.
#[derive(Debug, Clone)]
pub struct CheckDigitGenerator {
    issuer: IssuerKey,
    version: CheckDigitVersion,
    fault: Option<CheckDigitFault>,
}

impl CheckDigitGenerator {
    /// Create a generator issuing V2 digits.
    pub fn new(issuer: IssuerKey) -> Self {
        Self {
            issuer,
            version: CheckDigitVersion::V2,
            fault: None,
        }
    }

    /// Set the wire generation.
    pub fn version(mut self, version: CheckDigitVersion) -> Self {
        self.version = version;
        self
    }

    /// Inject a defect into every issued digit.
    pub fn with_fault(mut self, fault: CheckDigitFault) -> Self {
        self.fault = Some(fault);
        self
    }

    /// Issue an evidence record for a card read at `now`.
    ///
    /// `RevokedCard` has no V1 representation and is ignored for V1 digits.
    /// Fails if issued-at does not fit the ten-digit field of the digit.
    pub fn issue(
        &self,
        card: &CardContext,
        result: EvidenceResult,
        now: DateTime<Utc>,
    ) -> Result<EvidenceRecord, CoreError> {
        let timestamp = truncate_to_seconds(now);
        let out_of_range = || CoreError::IssuedAtOutOfRange(timestamp.timestamp());

        let issued_at = match self.fault {
            Some(CheckDigitFault::ExpiredIssuedAt) => timestamp
                .checked_sub_signed(Duration::seconds(EXPIRED_OFFSET_SECS))
                .ok_or_else(out_of_range)?,
            Some(CheckDigitFault::FutureIssuedAt) => timestamp
                .checked_add_signed(Duration::seconds(FUTURE_OFFSET_SECS))
                .ok_or_else(out_of_range)?,
            _ => timestamp,
        };
        if !issued_at_in_range(issued_at) {
            return Err(CoreError::IssuedAtOutOfRange(issued_at.timestamp()));
        }

        let mut claims = CheckDigitClaims {
            subject: card.subject,
            issued_at,
            manufacturer: self.issuer.manufacturer,
            key_version: self.issuer.key_version,
        };

        let signing_key = match self.fault {
            Some(CheckDigitFault::InvalidKey) => other_key(&self.issuer.key),
            _ => self.issuer.key.clone(),
        };

        let mut digit = match self.version {
            CheckDigitVersion::V1 => {
                let mac = signing_key.compute_mac(&signed_message_v1(&claims));
                CheckDigit::V1(CheckDigitV1 { claims, mac })
            }
            CheckDigitVersion::V2 => {
                let card_status = match self.fault {
                    Some(CheckDigitFault::RevokedCard) => CardStatus::Revoked,
                    _ => CardStatus::Valid,
                };
                let hash_check_value = card.hash_check_value();
                let mac = signing_key.compute_mac(&signed_message_v2(&claims, card_status, &hash_check_value));
                CheckDigit::V2(CheckDigitV2 {
                    claims,
                    card_status,
                    hash_check_value,
                    mac,
                })
            }
        };

        // Post-signature mutations.
        match self.fault {
            Some(CheckDigitFault::InvalidManufacturer) => {
                claims.manufacturer = other_manufacturer(claims.manufacturer);
            }
            Some(CheckDigitFault::InvalidKeyVersion) => {
                claims.key_version = other_key_version(claims.key_version);
            }
            Some(CheckDigitFault::InvalidSubject) => {
                claims.subject = other_subject(claims.subject);
            }
            _ => {}
        }
        match &mut digit {
            CheckDigit::V1(d) => d.claims = claims,
            CheckDigit::V2(d) => d.claims = claims,
        }

        Ok(EvidenceRecord {
            result,
            timestamp,
            check_digit: Some(digit),
        })
    }
}

fn other_key(key: &HmacKey) -> HmacKey {
    let mut candidate = HmacKey::generate();
    while candidate.compute_mac(b"sample") == key.compute_mac(b"sample") {
        candidate = HmacKey::generate();
    }
    candidate
}

fn other_manufacturer(current: ManufacturerId) -> ManufacturerId {
    let replacement = if current.as_bytes() == b"XX" { *b"YY" } else { *b"XX" };
    ManufacturerId::from_bytes(&replacement).unwrap_or(current)
}

fn other_key_version(current: KeyVersion) -> KeyVersion {
    let replacement = if current.as_bytes() == b"99" { *b"98" } else { *b"99" };
    KeyVersion::from_bytes(&replacement).unwrap_or(current)
}

fn other_subject(current: Kvnr) -> Kvnr {
    let replacement = if current.as_bytes() == b"Z999999999" {
        *b"Z999999998"
    } else {
        *b"Z999999999"
    };
    Kvnr::from_bytes(&replacement).unwrap_or(current)
}
