//! Cryptographic primitives for check digits.
//!
//! Wraps HMAC-SHA256 (the check digit MAC) and SHA-256 (the hash check
//! value) with strong types.

use std::collections::HashMap;
use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::NaiveDate;
use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::CoreError;
use crate::types::{KeyVersion, ManufacturerId};

type HmacSha256 = Hmac<Sha256>;

/// A 256-bit shared HMAC key.
#[derive(Clone)]
pub struct HmacKey([u8; 32]);

impl HmacKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s).map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidKey("expected 32 bytes".into()))?;
        Ok(Self(arr))
    }

    /// Compute the truncated check digit MAC over `message`.
    pub fn compute_mac(&self, message: &[u8]) -> CheckDigitMac {
        // A key shorter than the SHA-256 block is zero-padded to a full block.
        let mut block = Key::<HmacSha256>::default();
        block[..self.0.len()].copy_from_slice(&self.0);

        let mut mac = <HmacSha256 as KeyInit>::new(&block);
        mac.update(message);
        let full = mac.finalize().into_bytes();

        let mut out = [0u8; CheckDigitMac::LEN];
        out.copy_from_slice(&full[..CheckDigitMac::LEN]);
        CheckDigitMac(out)
    }
}

impl fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HmacKey(<redacted>)")
    }
}

/// HMAC-SHA256 truncated to 24 bytes, as carried in a check digit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckDigitMac(pub [u8; 24]);

impl CheckDigitMac {
    /// Width in bytes.
    pub const LEN: usize = 24;

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 24]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 24] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Constant-time comparison against a recomputed MAC.
    pub fn verify(&self, expected: &CheckDigitMac) -> bool {
        self.0.ct_eq(&expected.0).into()
    }
}

impl fmt::Debug for CheckDigitMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CheckDigitMac({}...)", &self.to_hex()[..16])
    }
}

/// The V2 hash check value: 5 bytes of SHA-256 over the insurance start
/// date and street, top bit cleared.
///
/// A pharmacy can derive it from the card's personal data without any key,
/// so it binds a token to the card that was read.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashCheckValue(pub [u8; 5]);

impl HashCheckValue {
    /// Width in bytes.
    pub const LEN: usize = 5;

    /// Derive from the card's insurance start date and street name.
    pub fn derive(insurance_start: NaiveDate, street: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(insurance_start.format("%Y%m%d").to_string().as_bytes());
        hasher.update(street.trim().as_bytes());
        let digest = hasher.finalize();

        let mut out = [0u8; Self::LEN];
        out.copy_from_slice(&digest[..Self::LEN]);
        out[0] &= 0x7f;
        Self(out)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 5]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 5] {
        &self.0
    }

    /// Encode as the `hcv` query parameter (unpadded base64url).
    pub fn to_param(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Parse the `hcv` query parameter. `None` if it is not 5 bytes of base64url.
    pub fn from_param(param: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(param.trim()).ok()?;
        let arr: [u8; Self::LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Constant-time comparison.
    pub fn matches(&self, other: &HashCheckValue) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Debug for HashCheckValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashCheckValue({})", hex::encode(self.0))
    }
}

/// A configured key, as loaded from deployment configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub manufacturer: ManufacturerId,
    pub key_version: KeyVersion,
    /// Hex-encoded 32-byte key.
    pub key: String,
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEntry")
            .field("manufacturer", &self.manufacturer)
            .field("key_version", &self.key_version)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// The set of HMAC keys a validator accepts, selected by the
/// (manufacturer, key version) pair embedded in a check digit.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: HashMap<(ManufacturerId, KeyVersion), HmacKey>,
}

impl KeyRing {
    /// Create an empty key ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a key ring from configuration entries.
    pub fn from_entries(entries: &[KeyEntry]) -> Result<Self, CoreError> {
        let mut ring = Self::new();
        for entry in entries {
            let key = HmacKey::from_hex(&entry.key)?;
            if ring
                .keys
                .insert((entry.manufacturer, entry.key_version), key)
                .is_some()
            {
                return Err(CoreError::DuplicateKey {
                    manufacturer: entry.manufacturer.to_string(),
                    key_version: entry.key_version.to_string(),
                });
            }
        }
        Ok(ring)
    }

    /// Add or replace a key.
    pub fn insert(&mut self, manufacturer: ManufacturerId, key_version: KeyVersion, key: HmacKey) {
        self.keys.insert((manufacturer, key_version), key);
    }

    /// Builder-style [`KeyRing::insert`].
    pub fn with_key(
        mut self,
        manufacturer: ManufacturerId,
        key_version: KeyVersion,
        key: HmacKey,
    ) -> Self {
        self.insert(manufacturer, key_version, key);
        self
    }

    /// Look up the key for a check digit's selectors.
    pub fn resolve(&self, manufacturer: &ManufacturerId, key_version: &KeyVersion) -> Option<&HmacKey> {
        self.keys.get(&(*manufacturer, *key_version))
    }

    /// Number of configured keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no key is configured.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_mac_deterministic() {
        let key = HmacKey::from_bytes([0x42; 32]);
        assert_eq!(key.compute_mac(b"message"), key.compute_mac(b"message"));
        assert_ne!(key.compute_mac(b"message"), key.compute_mac(b"messagE"));
    }

    #[test]
    fn test_mac_is_truncated_hmac_sha256() {
        let key = HmacKey::from_bytes([0x42; 32]);
        let mut reference = <HmacSha256 as KeyInit>::new_from_slice(&[0x42; 32]).unwrap();
        reference.update(b"message");
        let full = reference.finalize().into_bytes();

        assert_eq!(key.compute_mac(b"message").as_bytes()[..], full[..CheckDigitMac::LEN]);
    }

    #[test]
    fn test_mac_depends_on_key() {
        let a = HmacKey::from_bytes([0x01; 32]);
        let b = HmacKey::from_bytes([0x02; 32]);
        assert!(!a.compute_mac(b"m").verify(&b.compute_mac(b"m")));
        assert!(a.compute_mac(b"m").verify(&a.compute_mac(b"m")));
    }

    #[test]
    fn test_hmac_key_hex() {
        let hex = "42".repeat(32);
        let key = HmacKey::from_hex(&hex).unwrap();
        assert_eq!(
            key.compute_mac(b"x"),
            HmacKey::from_bytes([0x42; 32]).compute_mac(b"x")
        );
        assert!(HmacKey::from_hex("abcd").is_err());
        assert!(HmacKey::from_hex("zz").is_err());
        assert_eq!(format!("{:?}", key), "HmacKey(<redacted>)");
    }

    #[test]
    fn test_hcv_top_bit_cleared() {
        for street in ["Musterstr.", "Hauptstraße", "", "Am Flughafen"] {
            let hcv = HashCheckValue::derive(date(2020, 1, 1), street);
            assert_eq!(hcv.as_bytes()[0] & 0x80, 0);
        }
    }

    #[test]
    fn test_hcv_binds_inputs() {
        let a = HashCheckValue::derive(date(2020, 1, 1), "Musterstr.");
        let b = HashCheckValue::derive(date(2020, 1, 2), "Musterstr.");
        let c = HashCheckValue::derive(date(2020, 1, 1), "Musterweg");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, HashCheckValue::derive(date(2020, 1, 1), "Musterstr."));
    }

    #[test]
    fn test_hcv_param() {
        let hcv = HashCheckValue::derive(date(2020, 1, 1), "Musterstr.");
        let param = hcv.to_param();
        assert_eq!(param.len(), 7);
        assert_eq!(HashCheckValue::from_param(&param), Some(hcv));
        assert_eq!(HashCheckValue::from_param("ABC"), None);
        assert_eq!(HashCheckValue::from_param("!!!!!!!"), None);
    }

    #[test]
    fn test_key_ring_resolve() {
        let m = ManufacturerId::parse("M1").unwrap();
        let k1 = KeyVersion::parse("K1").unwrap();
        let k2 = KeyVersion::parse("K2").unwrap();
        let ring = KeyRing::new().with_key(m, k1, HmacKey::generate());
        assert!(ring.resolve(&m, &k1).is_some());
        assert!(ring.resolve(&m, &k2).is_none());
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_key_ring_from_entries() {
        let json = format!(
            r#"[{{"manufacturer":"M1","key_version":"K1","key":"{}"}}]"#,
            "ab".repeat(32)
        );
        let entries: Vec<KeyEntry> = serde_json::from_str(&json).unwrap();
        let ring = KeyRing::from_entries(&entries).unwrap();
        assert_eq!(ring.len(), 1);

        let duplicated = vec![entries[0].clone(), entries[0].clone()];
        assert!(matches!(
            KeyRing::from_entries(&duplicated),
            Err(CoreError::DuplicateKey { .. })
        ));
    }
}
