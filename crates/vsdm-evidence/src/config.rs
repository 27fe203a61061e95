//! Gate configuration.
//!
//! All sections default sensibly, so a deployment only states what it
//! changes:
//!
//! ```json
//! {
//!   "validator": { "accept_pn3": true },
//!   "rate_limit": { "threshold": 50, "requests_per_minute": 10 },
//!   "keys": [{ "manufacturer": "M1", "key_version": "K1", "key": "<64 hex chars>" }]
//! }
//! ```

use chrono::Duration;
use serde::{Deserialize, Serialize};
use vsdm_evidence_core::{CheckDigitValidator, KeyEntry, KeyRing, ValidatorConfig};

use crate::error::{GateError, Result};

/// Longest accepted failure window.
pub const MAX_WINDOW_SECS: i64 = 366 * 24 * 60 * 60;

/// Longest accepted freshness tolerance, past or future.
pub const MAX_TOLERANCE_SECS: i64 = 7 * 24 * 60 * 60;

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Failures after which a caller is locked out.
    pub threshold: u32,
    /// Length of the failure window, starting at the first failure.
    pub window_secs: i64,
    /// Requests a caller may make per minute, whatever their outcome.
    pub requests_per_minute: u32,
}

impl RateLimitConfig {
    /// The failure window, `None` if it does not fit a duration.
    pub fn window(&self) -> Option<Duration> {
        Duration::try_seconds(self.window_secs)
    }

    /// The request window of the throttle.
    pub fn request_window(&self) -> Duration {
        Duration::minutes(1)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            threshold: 100,
            window_secs: 24 * 60 * 60,
            requests_per_minute: 5,
        }
    }
}

/// Configuration for the [`AccessGate`](crate::AccessGate).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub validator: ValidatorConfig,
    pub rate_limit: RateLimitConfig,
    /// HMAC keys of the accepted trust services.
    pub keys: Vec<KeyEntry>,
}

impl GateConfig {
    /// Parse from JSON and check the values.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: GateConfig = serde_json::from_str(json)?;
        config.check()?;
        Ok(config)
    }

    /// Reject values that cannot work.
    pub fn check(&self) -> Result<()> {
        if self.rate_limit.threshold == 0 {
            return Err(GateError::Config("rate_limit.threshold must be positive".into()));
        }
        if !(1..=MAX_WINDOW_SECS).contains(&self.rate_limit.window_secs) {
            return Err(GateError::Config(format!(
                "rate_limit.window_secs must be between 1 and {}",
                MAX_WINDOW_SECS
            )));
        }
        if self.rate_limit.requests_per_minute == 0 {
            return Err(GateError::Config("rate_limit.requests_per_minute must be positive".into()));
        }
        for (name, secs) in [
            ("validator.max_age_secs", self.validator.max_age_secs),
            ("validator.max_future_skew_secs", self.validator.max_future_skew_secs),
        ] {
            if !(0..=MAX_TOLERANCE_SECS).contains(&secs) {
                return Err(GateError::Config(format!(
                    "{} must be between 0 and {}",
                    name, MAX_TOLERANCE_SECS
                )));
            }
        }
        Ok(())
    }

    /// Build the key ring from the configured entries.
    pub fn key_ring(&self) -> Result<KeyRing> {
        Ok(KeyRing::from_entries(&self.keys)?)
    }

    /// Build a validator from the configured keys and settings.
    pub fn validator(&self) -> Result<CheckDigitValidator> {
        Ok(CheckDigitValidator::new(self.key_ring()?, self.validator.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GateConfig::default();
        assert_eq!(config.rate_limit.threshold, 100);
        assert_eq!(config.rate_limit.window(), Some(Duration::hours(24)));
        assert_eq!(config.rate_limit.requests_per_minute, 5);
        assert!(config.check().is_ok());
        assert!(!config.validator.accept_pn3);
        assert!(config.keys.is_empty());
    }

    #[test]
    fn test_from_json_partial() {
        let json = format!(
            r#"{{
                "validator": {{ "accept_pn3": true, "max_age_secs": 600 }},
                "rate_limit": {{ "threshold": 5 }},
                "keys": [{{ "manufacturer": "M1", "key_version": "K1", "key": "{}" }}]
            }}"#,
            "42".repeat(32)
        );
        let config = GateConfig::from_json(&json).unwrap();
        assert!(config.validator.accept_pn3);
        assert_eq!(config.validator.max_age_secs, 600);
        assert_eq!(config.validator.max_future_skew_secs, 300);
        assert_eq!(config.rate_limit.threshold, 5);
        assert_eq!(config.rate_limit.window_secs, 86_400);
        assert_eq!(config.rate_limit.requests_per_minute, 5);
        assert_eq!(config.key_ring().unwrap().len(), 1);
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(matches!(GateConfig::from_json("not json"), Err(GateError::Config(_))));
        assert!(matches!(
            GateConfig::from_json(r#"{"rate_limit":{"threshold":0}}"#),
            Err(GateError::Config(_))
        ));
        assert!(GateConfig::from_json(r#"{"keys":[{"manufacturer":"m1","key_version":"K1","key":"00"}]}"#).is_err());

        for json in [
            r#"{"rate_limit":{"window_secs":0}}"#,
            r#"{"rate_limit":{"window_secs":9223372036854775807}}"#,
            r#"{"rate_limit":{"requests_per_minute":0}}"#,
            r#"{"validator":{"max_age_secs":-1}}"#,
            r#"{"validator":{"max_age_secs":9223372036854775807}}"#,
            r#"{"validator":{"max_future_skew_secs":9223372036854775807}}"#,
        ] {
            assert!(matches!(GateConfig::from_json(json), Err(GateError::Config(_))), "accepted {}", json);
        }
        assert_eq!(RateLimitConfig { window_secs: i64::MAX, ..RateLimitConfig::default() }.window(), None);

        let bad_key = GateConfig::from_json(r#"{"keys":[{"manufacturer":"M1","key_version":"K1","key":"00"}]}"#).unwrap();
        assert!(matches!(bad_key.key_ring(), Err(GateError::Key(_))));
    }
}
