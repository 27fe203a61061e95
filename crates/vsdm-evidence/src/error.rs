//! Error types for the access gate.
//!
//! Every error here means the attempt is denied.

use thiserror::Error;
use vsdm_evidence_core::CoreError;
use vsdm_evidence_store::StoreError;

/// Errors that can occur during gate operations.
#[derive(Debug, Error)]
pub enum GateError {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid key material or identifier.
    #[error("invalid key material: {0}")]
    Key(#[from] CoreError),
}

impl From<serde_json::Error> for GateError {
    fn from(e: serde_json::Error) -> Self {
        GateError::Config(e.to_string())
    }
}

/// Result type for gate operations.
pub type Result<T> = std::result::Result<T, GateError>;
