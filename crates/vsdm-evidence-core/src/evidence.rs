//! Exam evidence: the record a trust service issues for one card read.
//!
//! An [`EvidenceRecord`] is immutable once issued. Its check digit comes in two
//! incompatible wire generations, modeled as the variants of [`CheckDigit`] so
//! that the V2-only hash check value cannot be read from a V1 digit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{CheckDigitMac, HashCheckValue};
use crate::types::{KeyVersion, Kvnr, ManufacturerId};

/// Outcome of the card-presence check performed by the issuing trust service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EvidenceResult {
    /// Updates were applied to the card.
    UpdatesApplied = 1,
    /// The card was checked; no updates were needed.
    NoUpdatesNeeded = 2,
    /// Updates were technically impossible (card error). This is the PN3 result.
    UpdatesTechnicallyImpossible = 3,
    /// The card's authentication certificate is invalid.
    AuthCertificateInvalid = 4,
    /// The online check was technically impossible.
    OnlineCheckImpossible = 5,
    /// The card's maximum offline period was exceeded.
    OfflinePeriodExceeded = 6,
}

impl EvidenceResult {
    /// Convert to the wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Try to parse from the wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::UpdatesApplied),
            2 => Some(Self::NoUpdatesNeeded),
            3 => Some(Self::UpdatesTechnicallyImpossible),
            4 => Some(Self::AuthCertificateInvalid),
            5 => Some(Self::OnlineCheckImpossible),
            6 => Some(Self::OfflinePeriodExceeded),
            _ => None,
        }
    }

    /// Whether this is the offline fallback result that may be accepted
    /// without a check digit.
    pub fn is_pn3(self) -> bool {
        self == Self::UpdatesTechnicallyImpossible
    }

    /// Whether a checked record with this result grants full access.
    pub fn permits_full_access(self) -> bool {
        matches!(self, Self::UpdatesApplied | Self::NoUpdatesNeeded)
    }

    /// All result codes, in wire order.
    pub const ALL: [EvidenceResult; 6] = [
        Self::UpdatesApplied,
        Self::NoUpdatesNeeded,
        Self::UpdatesTechnicallyImpossible,
        Self::AuthCertificateInvalid,
        Self::OnlineCheckImpossible,
        Self::OfflinePeriodExceeded,
    ];
}

/// Check digit wire generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckDigitVersion {
    /// Legacy layout without hash check value.
    V1,
    /// Extended layout with hash check value and card status.
    V2,
}

/// Card status carried by a check digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CardStatus {
    Valid,
    Revoked,
}

impl CardStatus {
    /// Convert to the wire byte.
    pub fn to_byte(self) -> u8 {
        match self {
            CardStatus::Valid => b'U',
            CardStatus::Revoked => b'R',
        }
    }

    /// Try to parse from the wire byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'U' => Some(CardStatus::Valid),
            b'R' => Some(CardStatus::Revoked),
            _ => None,
        }
    }
}

/// The fields every check digit generation binds under its MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckDigitClaims {
    /// The patient the card read was bound to.
    pub subject: Kvnr,
    /// Freshness anchor (second precision).
    pub issued_at: DateTime<Utc>,
    /// Operator of the issuing trust service.
    pub manufacturer: ManufacturerId,
    /// Version of the shared key the MAC was computed with.
    pub key_version: KeyVersion,
}

/// A legacy (V1) check digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckDigitV1 {
    pub claims: CheckDigitClaims,
    pub mac: CheckDigitMac,
}

/// An extended (V2) check digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckDigitV2 {
    pub claims: CheckDigitClaims,
    pub card_status: CardStatus,
    pub hash_check_value: HashCheckValue,
    pub mac: CheckDigitMac,
}

/// A keyed check digit ("Prüfziffer") in one of its wire generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckDigit {
    V1(CheckDigitV1),
    V2(CheckDigitV2),
}

impl CheckDigit {
    /// The wire generation.
    pub fn version(&self) -> CheckDigitVersion {
        match self {
            CheckDigit::V1(_) => CheckDigitVersion::V1,
            CheckDigit::V2(_) => CheckDigitVersion::V2,
        }
    }

    /// The MAC-bound claims.
    pub fn claims(&self) -> &CheckDigitClaims {
        match self {
            CheckDigit::V1(d) => &d.claims,
            CheckDigit::V2(d) => &d.claims,
        }
    }

    /// The embedded MAC.
    pub fn mac(&self) -> &CheckDigitMac {
        match self {
            CheckDigit::V1(d) => &d.mac,
            CheckDigit::V2(d) => &d.mac,
        }
    }

    /// The patient the digit is bound to.
    pub fn subject(&self) -> &Kvnr {
        &self.claims().subject
    }

    /// The hash check value (V2 only).
    pub fn hash_check_value(&self) -> Option<&HashCheckValue> {
        match self {
            CheckDigit::V1(_) => None,
            CheckDigit::V2(d) => Some(&d.hash_check_value),
        }
    }

    /// The card status. V1 digits are only ever issued for valid cards.
    pub fn card_status(&self) -> CardStatus {
        match self {
            CheckDigit::V1(_) => CardStatus::Valid,
            CheckDigit::V2(d) => d.card_status,
        }
    }
}

/// Exam evidence ("Prüfungsnachweis") for one card read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Outcome of the card-presence check.
    pub result: EvidenceResult,
    /// Issuance time, second precision.
    pub timestamp: DateTime<Utc>,
    /// Absent only for offline evidence.
    pub check_digit: Option<CheckDigit>,
}

impl EvidenceRecord {
    /// Create offline evidence, which carries no check digit.
    pub fn offline(result: EvidenceResult, now: DateTime<Utc>) -> Self {
        Self {
            result,
            timestamp: truncate_to_seconds(now),
            check_digit: None,
        }
    }

    /// Whether this record carries a check digit.
    pub fn is_online(&self) -> bool {
        self.check_digit.is_some()
    }
}

/// Drop sub-second precision, which the wire formats cannot carry.
pub fn truncate_to_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}
