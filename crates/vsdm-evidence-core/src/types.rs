//! Strong type definitions for exam evidence.
//!
//! All identifiers are newtypes validated at construction, so a value that
//! exists is always well-formed and has a fixed wire width.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// A patient insurance number (KVNR): one uppercase letter followed by nine digits.
///
/// The KVNR's own check digit is not verified here; only the shape is.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Kvnr([u8; Kvnr::LEN]);

impl Kvnr {
    /// Width of a KVNR in bytes.
    pub const LEN: usize = 10;

    /// Parse a KVNR from its textual form.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Self::from_bytes(s.as_bytes())
    }

    /// Parse a KVNR from raw ASCII bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        let arr: [u8; Self::LEN] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidKvnr(String::from_utf8_lossy(bytes).into_owned()))?;

        if !arr[0].is_ascii_uppercase() || !arr[1..].iter().all(u8::is_ascii_digit) {
            return Err(CoreError::InvalidKvnr(
                String::from_utf8_lossy(bytes).into_owned(),
            ));
        }

        Ok(Self(arr))
    }

    /// Get the raw ASCII bytes.
    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Get the textual form.
    pub fn as_str(&self) -> &str {
        // Construction guarantees ASCII.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

/// Implements the shared text conversions for an ASCII identifier newtype.
macro_rules! ascii_identifier {
    ($name:ident) => {
        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.as_str())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = CoreError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse(&s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.as_str().to_owned()
            }
        }
    };
}

ascii_identifier!(Kvnr);

/// Identifier of the trust-service operator that issued a check digit
/// (the "Betreiberkennung"). Two uppercase ASCII alphanumerics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ManufacturerId([u8; 2]);

/// Version of the shared HMAC key a check digit was computed with.
/// Two uppercase ASCII alphanumerics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyVersion([u8; 2]);

/// Implements parsing for the two-byte key-selector identifiers.
macro_rules! key_selector {
    ($name:ident, $err:ident) => {
        impl $name {
            /// Width in bytes.
            pub const LEN: usize = 2;

            /// Parse from the textual form.
            pub fn parse(s: &str) -> Result<Self, CoreError> {
                Self::from_bytes(s.as_bytes())
            }

            /// Parse from raw ASCII bytes.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
                let arr: [u8; 2] = bytes.try_into().map_err(|_| {
                    CoreError::$err(String::from_utf8_lossy(bytes).into_owned())
                })?;
                if !arr
                    .iter()
                    .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
                {
                    return Err(CoreError::$err(
                        String::from_utf8_lossy(bytes).into_owned(),
                    ));
                }
                Ok(Self(arr))
            }

            /// Get the raw ASCII bytes.
            pub const fn as_bytes(&self) -> &[u8; 2] {
                &self.0
            }

            /// Get the textual form.
            pub fn as_str(&self) -> &str {
                std::str::from_utf8(&self.0).unwrap_or_default()
            }
        }

        ascii_identifier!($name);
    };
}

key_selector!(ManufacturerId, InvalidManufacturerId);
key_selector!(KeyVersion, InvalidKeyVersion);

/// Stable identity of an accessing institution (pharmacy), e.g. `3-SMC-B-Testkarte-883110000116873`.
///
/// Used as the rate-limiter key and as the actor of audit entries.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TelematikId(String);

impl TelematikId {
    /// Upper bound on the identifier length.
    pub const MAX_LEN: usize = 128;

    /// Parse a Telematik-ID: non-empty, at most 128 visible ASCII characters.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if s.is_empty() || s.len() > Self::MAX_LEN || !s.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(CoreError::InvalidTelematikId(s.to_owned()));
        }
        Ok(Self(s.to_owned()))
    }

    /// Get the textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

ascii_identifier!(TelematikId);
