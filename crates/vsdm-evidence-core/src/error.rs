//! Error types for the exam evidence core.

use std::fmt;

use thiserror::Error;

/// Errors from constructing identifiers and key material.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid KVNR: {0:?}")]
    InvalidKvnr(String),

    #[error("invalid manufacturer id: {0:?}")]
    InvalidManufacturerId(String),

    #[error("invalid key version: {0:?}")]
    InvalidKeyVersion(String),

    #[error("invalid Telematik-ID: {0:?}")]
    InvalidTelematikId(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid audit representation: {0:?}")]
    InvalidAuditRepresentation(String),

    #[error("duplicate key for manufacturer {manufacturer} version {key_version}")]
    DuplicateKey {
        manufacturer: String,
        key_version: String,
    },

    #[error("issued-at {0} does not fit the check digit")]
    IssuedAtOutOfRange(i64),
}

/// Errors from encoding a record to its wire token.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

/// The stage of the wire pipeline at which decoding failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireStage {
    Base64,
    Compression,
    Document,
    CheckDigit,
}

impl fmt::Display for WireStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WireStage::Base64 => "base64",
            WireStage::Compression => "compression",
            WireStage::Document => "document",
            WireStage::CheckDigit => "check digit",
        };
        f.write_str(name)
    }
}

/// Errors from decoding a wire token.
///
/// Every failure is a malformed wire format; the stage is kept for
/// server-side diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed wire format at {stage} stage: {detail}")]
    MalformedWireFormat { stage: WireStage, detail: String },
}

impl DecodeError {
    pub(crate) fn at(stage: WireStage, detail: impl Into<String>) -> Self {
        DecodeError::MalformedWireFormat {
            stage,
            detail: detail.into(),
        }
    }

    /// The stage at which decoding failed.
    pub fn stage(&self) -> WireStage {
        match self {
            DecodeError::MalformedWireFormat { stage, .. } => *stage,
        }
    }
}

/// Outcomes of the validation predicate chain, in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no exam evidence supplied")]
    NoEvidenceSupplied,

    #[error("malformed exam evidence: {0}")]
    MalformedEvidence(DecodeError),

    /// The record carries no check digit and offline acceptance does not apply.
    /// `pn3_result` is set when the record's result is the PN3 result.
    #[error("exam evidence carries no check digit")]
    ChecksumMissing { pn3_result: bool },

    #[error("identity parameter missing")]
    MissingIdentityParameter,

    #[error("exam evidence result {0} does not permit access")]
    EvidenceResultRejected(u8),

    #[error("check digit signature invalid")]
    SignatureInvalid,

    #[error("health card is revoked")]
    CardRevoked,

    #[error("exam evidence expired or not yet valid")]
    EvidenceExpired,

    #[error("identity parameter does not match check digit subject")]
    IdentityMismatch,

    #[error("hash check value missing")]
    HashCheckValueMissing,

    #[error("hash check value mismatch")]
    HashCheckValueMismatch,
}

impl ValidationError {
    /// Whether this outcome looks like identity probing and counts
    /// against the caller's rate limit.
    pub fn counts_against_rate_limit(&self) -> bool {
        matches!(
            self,
            ValidationError::IdentityMismatch | ValidationError::HashCheckValueMismatch
        )
    }
}

impl From<DecodeError> for ValidationError {
    fn from(e: DecodeError) -> Self {
        ValidationError::MalformedEvidence(e)
    }
}
