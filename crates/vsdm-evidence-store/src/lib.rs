//! # VSDM Evidence Store
//!
//! Storage abstraction for the access gate: per-caller failure counters for
//! the rate limiter and the patient-readable audit trail.
//!
//! ## Key Types
//!
//! - [`AccessAttemptTracker`] - Failure and request counters keyed by Telematik-ID
//! - [`AuditLog`] - Append-only audit trail, queried per patient
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chrono::{Duration, Utc};
//! use vsdm_evidence_core::TelematikId;
//! use vsdm_evidence_store::{AccessAttemptTracker, SqliteStore};
//!
//! async fn example() {
//!     let store = SqliteStore::open("evidence.db").unwrap();
//!     let caller = TelematikId::parse("3-SMC-B-Testkarte-883110000116873").unwrap();
//!
//!     let failures = store
//!         .record_failure(&caller, Utc::now(), Duration::hours(24))
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{AccessAttemptTracker, Admission, AuditLog, CountWindow};
