//! Audit trail entries.
//!
//! One entry is written per access attempt. Entries record the class of the
//! outcome only, never the predicate that failed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ValidationError};
use crate::types::{Kvnr, TelematikId};
use crate::validation::{Assurance, Verdict};

/// A 32-byte audit entry identifier: Blake3 over the entry contents and a
/// random nonce, so two identical attempts still get distinct ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AuditEntryId(pub [u8; 32]);

impl AuditEntryId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for AuditEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuditEntryId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for AuditEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl TryFrom<&[u8]> for AuditEntryId {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; 32] = slice.try_into()?;
        Ok(Self(arr))
    }
}

/// How an access attempt is shown to the patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditRepresentation {
    /// Access granted on a verified check digit.
    PharmacyGetTaskSuccessful,
    /// Access granted on offline evidence.
    PharmacyGetTaskSuccessfulPn3,
    /// Access denied.
    PharmacyGetTaskUnsuccessful,
    /// Offline evidence refused because offline acceptance is disabled.
    PharmacyGetTaskUnsuccessfulPn3,
}

impl AuditRepresentation {
    /// Classify a validation outcome.
    pub fn for_outcome(outcome: &Result<Verdict, ValidationError>) -> Self {
        match outcome {
            Ok(verdict) => match verdict.assurance {
                Assurance::Full => Self::PharmacyGetTaskSuccessful,
                Assurance::Pn3Reduced => Self::PharmacyGetTaskSuccessfulPn3,
            },
            Err(ValidationError::ChecksumMissing { pn3_result: true }) => {
                Self::PharmacyGetTaskUnsuccessfulPn3
            }
            Err(_) => Self::PharmacyGetTaskUnsuccessful,
        }
    }

    /// Whether access was granted.
    pub fn is_successful(self) -> bool {
        matches!(
            self,
            Self::PharmacyGetTaskSuccessful | Self::PharmacyGetTaskSuccessfulPn3
        )
    }

    /// Stable textual form, used for persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PharmacyGetTaskSuccessful => "PharmacyGetTaskSuccessful",
            Self::PharmacyGetTaskSuccessfulPn3 => "PharmacyGetTaskSuccessfulPn3",
            Self::PharmacyGetTaskUnsuccessful => "PharmacyGetTaskUnsuccessful",
            Self::PharmacyGetTaskUnsuccessfulPn3 => "PharmacyGetTaskUnsuccessfulPn3",
        }
    }

    /// All representations.
    pub const ALL: [AuditRepresentation; 4] = [
        Self::PharmacyGetTaskSuccessful,
        Self::PharmacyGetTaskSuccessfulPn3,
        Self::PharmacyGetTaskUnsuccessful,
        Self::PharmacyGetTaskUnsuccessfulPn3,
    ];
}

impl fmt::Display for AuditRepresentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditRepresentation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| CoreError::InvalidAuditRepresentation(s.to_owned()))
    }
}

/// One access attempt, as recorded in the patient's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    /// The accessing institution.
    pub actor: TelematikId,
    /// The patient, when the attempt could be attributed.
    pub subject: Option<Kvnr>,
    pub representation: AuditRepresentation,
    pub recorded_at: DateTime<Utc>,
    /// Encoded check digit, for successful full-assurance access.
    pub evidence: Option<String>,
}

impl AuditEntry {
    /// Create an entry with a fresh id.
    pub fn new(
        actor: TelematikId,
        subject: Option<Kvnr>,
        representation: AuditRepresentation,
        recorded_at: DateTime<Utc>,
        evidence: Option<String>,
    ) -> Self {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut hasher = blake3::Hasher::new();
        hash_field(&mut hasher, actor.as_str().as_bytes());
        hash_field(&mut hasher, subject.as_ref().map_or(&[][..], |s| &s.as_bytes()[..]));
        hash_field(&mut hasher, representation.as_str().as_bytes());
        hash_field(&mut hasher, &recorded_at.timestamp_millis().to_be_bytes());
        hash_field(&mut hasher, evidence.as_deref().unwrap_or("").as_bytes());
        hasher.update(&nonce);

        Self {
            id: AuditEntryId(*hasher.finalize().as_bytes()),
            actor,
            subject,
            representation,
            recorded_at,
            evidence,
        }
    }
}

fn hash_field(hasher: &mut blake3::Hasher, field: &[u8]) {
    hasher.update(&(field.len() as u32).to_be_bytes());
    hasher.update(field);
}
