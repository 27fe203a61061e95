//! # VSDM Evidence Core
//!
//! Pure primitives for VSDM exam evidence ("Prüfungsnachweis"): the keyed
//! check digit a trust service issues after reading a patient's health card,
//! its wire codec, and the validator a prescription service runs before
//! releasing that patient's open tasks to a pharmacy.
//!
//! This crate contains no I/O, no storage and no logging. The caller supplies
//! the current time.
//!
//! ## Key Types
//!
//! - [`EvidenceRecord`] - Result code, timestamp and optional check digit
//! - [`CheckDigit`] - Keyed check digit, V1 (legacy) or V2 (with hash check value)
//! - [`CheckDigitGenerator`] - Issues records, with fault hooks for testing
//! - [`CheckDigitValidator`] - Ordered predicate chain over an [`AccessRequest`]
//! - [`AuditEntry`] - One access attempt in the patient's audit trail
//!
//! ## Wire format
//!
//! Records travel as base64 of a gzip-compressed fixed-tag document. See [`codec`].

pub mod audit;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod evidence;
pub mod generator;
pub mod layout;
pub mod types;
pub mod validation;

pub use audit::{AuditEntry, AuditEntryId, AuditRepresentation};
pub use codec::{decode, decode_check_digit_str, encode, encode_check_digit};
pub use crypto::{CheckDigitMac, HashCheckValue, HmacKey, KeyEntry, KeyRing};
pub use error::{CoreError, DecodeError, EncodeError, ValidationError, WireStage};
pub use evidence::{
    CardStatus, CheckDigit, CheckDigitClaims, CheckDigitV1, CheckDigitV2, CheckDigitVersion,
    EvidenceRecord, EvidenceResult,
};
pub use generator::{CardContext, CheckDigitFault, CheckDigitGenerator, IssuerKey};
pub use layout::decode_check_digit;
pub use types::{KeyVersion, Kvnr, ManufacturerId, TelematikId};
pub use validation::{
    AccessRequest, Assurance, CheckDigitValidator, Evaluation, ValidatorConfig, Verdict,
};
