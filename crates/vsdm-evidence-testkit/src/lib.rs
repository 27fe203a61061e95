//! # VSDM Evidence Testkit
//!
//! Testing utilities for VSDM exam evidence.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: Known check digits with expected bytes for cross-implementation verification
//! - **Generators**: Proptest strategies for property-based testing
//! - **Fixtures**: A reference key, card and pharmacy for scenario tests
//!
//! ## Golden Vectors
//!
//! ```rust
//! use vsdm_evidence_testkit::vectors::{all_vectors, check_digit_from_vector};
//!
//! for vector in all_vectors() {
//!     let digit = check_digit_from_vector(&vector);
//!     println!("{}: {}", vector.name, digit.mac().to_hex());
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use vsdm_evidence_testkit::generators::{record_from_params, EvidenceParams};
//!
//! proptest! {
//!     #[test]
//!     fn issuance_is_deterministic(params: EvidenceParams) {
//!         prop_assert_eq!(record_from_params(&params), record_from_params(&params));
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust
//! use vsdm_evidence_testkit::fixtures::{t0, TestFixture};
//! use vsdm_evidence_core::ValidatorConfig;
//!
//! let fixture = TestFixture::new();
//! let verdict = fixture
//!     .validator(ValidatorConfig::default())
//!     .validate(&fixture.request(fixture.token()), t0());
//! assert!(verdict.is_ok());
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{pharmacies, t0, TestFixture, T0};
pub use generators::{record_from_params, EvidenceParams};
pub use vectors::{all_vectors, check_digit_from_vector, verify_all_vectors, GoldenVector};
