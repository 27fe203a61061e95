//! # VSDM Evidence
//!
//! The unified API for card-based prescription access: a pharmacy presents
//! exam evidence issued after reading a patient's health card, and the
//! [`AccessGate`] decides whether it may fetch that patient's ready tasks.
//!
//! ## Overview
//!
//! - **Validation**: ordered predicate chain over the decoded evidence
//! - **Rate limiting**: identity probing locks a pharmacy out for a rolling window
//! - **Audit**: every attempt lands in the patient's audit trail
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use vsdm_evidence::{AccessGate, GateConfig};
//! use vsdm_evidence::core::{AccessRequest, TelematikId};
//! use vsdm_evidence::store::SqliteStore;
//!
//! async fn example() {
//!     let config = GateConfig::from_json(r#"{"validator":{"accept_pn3":true}}"#).unwrap();
//!     let store = SqliteStore::open("evidence.db").unwrap();
//!     let gate = AccessGate::with_store(config.validator().unwrap(), config.rate_limit.clone(), store);
//!
//!     let caller = TelematikId::parse("3-SMC-B-Testkarte-883110000116873").unwrap();
//!     let request = AccessRequest::from_query("pnw=H4sIAAAA...&kvnr=X110498565");
//!     let outcome = gate.fetch_ready_tasks_by_card(&caller, &request, Utc::now()).await;
//!     println!("{} {}", outcome.status_code(), outcome.public_message());
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `vsdm_evidence::core` - Evidence primitives, codec, validator
//! - `vsdm_evidence::store` - Storage abstraction and SQLite

pub mod audit;
pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;

// Re-export component crates
pub use vsdm_evidence_core as core;
pub use vsdm_evidence_store as store;

// Re-export main types for convenience
pub use audit::AuditTrailEmitter;
pub use config::{GateConfig, RateLimitConfig};
pub use error::{GateError, Result};
pub use gate::{public_message, AccessGate, AccessOutcome};
pub use ratelimit::{AccessRateLimiter, RateLimitStatus};

// Re-export commonly used core types
pub use vsdm_evidence_core::{
    AccessRequest, Assurance, AuditEntry, AuditRepresentation, CheckDigitValidator, EvidenceRecord,
    EvidenceResult, KeyRing, Kvnr, TelematikId, ValidationError, ValidatorConfig, Verdict,
};
