//! Fixed binary layout of a check digit.
//!
//! ```text
//!          V1   V2
//! KVNR     10   10   ASCII
//! iat      10   10   Unix seconds, ASCII decimal, zero padded
//! status    1    1   'U' valid / 'R' revoked (V1: 'U' only)
//! manuf.    2    2   ASCII
//! key ver.  2    2   ASCII
//! hcv       -    5   SHA-256 prefix
//! mac      24   24   HMAC-SHA256 over every preceding byte, truncated
//! total    49   54
//! ```
//!
//! The generation is determined by length. The layout is what the MAC is
//! computed over, so it must be byte-for-byte deterministic.

use chrono::{DateTime, Utc};

use crate::crypto::{CheckDigitMac, HashCheckValue};
use crate::error::{DecodeError, WireStage};
use crate::evidence::{
    CardStatus, CheckDigit, CheckDigitClaims, CheckDigitV1, CheckDigitV2, CheckDigitVersion,
};
use crate::types::{KeyVersion, Kvnr, ManufacturerId};

/// Width of the ASCII issued-at field.
const IAT_LEN: usize = 10;

/// Largest issued-at that fits the field.
const MAX_IAT: i64 = 9_999_999_999;

/// Length of the MAC-covered prefix of a V1 digit.
pub const V1_SIGNED_LEN: usize = Kvnr::LEN + IAT_LEN + 1 + ManufacturerId::LEN + KeyVersion::LEN;

/// Length of the MAC-covered prefix of a V2 digit.
pub const V2_SIGNED_LEN: usize = V1_SIGNED_LEN + HashCheckValue::LEN;

/// Total length of a V1 digit.
pub const V1_LEN: usize = V1_SIGNED_LEN + CheckDigitMac::LEN;

/// Total length of a V2 digit.
pub const V2_LEN: usize = V2_SIGNED_LEN + CheckDigitMac::LEN;

/// The bytes a V1 MAC is computed over.
pub fn signed_message_v1(claims: &CheckDigitClaims) -> Vec<u8> {
    let mut buf = Vec::with_capacity(V1_SIGNED_LEN);
    push_claims(&mut buf, claims, CardStatus::Valid);
    buf
}

/// The bytes a V2 MAC is computed over.
pub fn signed_message_v2(
    claims: &CheckDigitClaims,
    card_status: CardStatus,
    hash_check_value: &HashCheckValue,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(V2_SIGNED_LEN);
    push_claims(&mut buf, claims, card_status);
    buf.extend_from_slice(hash_check_value.as_bytes());
    buf
}

/// The bytes the MAC of an already-built digit must cover.
pub fn signed_message(digit: &CheckDigit) -> Vec<u8> {
    match digit {
        CheckDigit::V1(d) => signed_message_v1(&d.claims),
        CheckDigit::V2(d) => signed_message_v2(&d.claims, d.card_status, &d.hash_check_value),
    }
}

/// Encode a check digit to its binary layout.
pub fn check_digit_bytes(digit: &CheckDigit) -> Vec<u8> {
    let mut buf = signed_message(digit);
    buf.extend_from_slice(digit.mac().as_bytes());
    buf
}

/// Decode a check digit from its binary layout.
pub fn decode_check_digit(bytes: &[u8]) -> Result<CheckDigit, DecodeError> {
    let version = match bytes.len() {
        V1_LEN => CheckDigitVersion::V1,
        V2_LEN => CheckDigitVersion::V2,
        n => {
            return Err(DecodeError::at(
                WireStage::CheckDigit,
                format!("unexpected length {}", n),
            ))
        }
    };

    let mut cursor = Cursor { bytes, pos: 0 };

    let subject = Kvnr::from_bytes(cursor.take(Kvnr::LEN))
        .map_err(|e| DecodeError::at(WireStage::CheckDigit, e.to_string()))?;
    let issued_at = parse_iat(cursor.take(IAT_LEN))?;
    let status_byte = cursor.take(1)[0];
    let card_status = CardStatus::from_byte(status_byte).ok_or_else(|| {
        DecodeError::at(WireStage::CheckDigit, format!("unknown card status {:#04x}", status_byte))
    })?;
    let manufacturer = ManufacturerId::from_bytes(cursor.take(ManufacturerId::LEN))
        .map_err(|e| DecodeError::at(WireStage::CheckDigit, e.to_string()))?;
    let key_version = KeyVersion::from_bytes(cursor.take(KeyVersion::LEN))
        .map_err(|e| DecodeError::at(WireStage::CheckDigit, e.to_string()))?;

    let claims = CheckDigitClaims {
        subject,
        issued_at,
        manufacturer,
        key_version,
    };

    match version {
        CheckDigitVersion::V1 => {
            if card_status != CardStatus::Valid {
                return Err(DecodeError::at(
                    WireStage::CheckDigit,
                    "V1 digits carry no revocation status",
                ));
            }
            let mac = cursor.take_mac();
            Ok(CheckDigit::V1(CheckDigitV1 { claims, mac }))
        }
        CheckDigitVersion::V2 => {
            let mut hcv = [0u8; HashCheckValue::LEN];
            hcv.copy_from_slice(cursor.take(HashCheckValue::LEN));
            let mac = cursor.take_mac();
            Ok(CheckDigit::V2(CheckDigitV2 {
                claims,
                card_status,
                hash_check_value: HashCheckValue::from_bytes(hcv),
                mac,
            }))
        }
    }
}

fn push_claims(buf: &mut Vec<u8>, claims: &CheckDigitClaims, card_status: CardStatus) {
    buf.extend_from_slice(claims.subject.as_bytes());
    buf.extend_from_slice(format_iat(claims.issued_at).as_bytes());
    buf.push(card_status.to_byte());
    buf.extend_from_slice(claims.manufacturer.as_bytes());
    buf.extend_from_slice(claims.key_version.as_bytes());
}

/// Whether `t` fits the ten-digit issued-at field.
///
/// The generator refuses to issue outside this range and the decoder cannot
/// produce such a value, so [`format_iat`] never loses information for them.
pub fn issued_at_in_range(t: DateTime<Utc>) -> bool {
    (0..=MAX_IAT).contains(&t.timestamp())
}

/// Format issued-at as 10 ASCII digits. Hand-built claims outside
/// [`issued_at_in_range`] saturate at the field bounds.
fn format_iat(t: DateTime<Utc>) -> String {
    format!("{:010}", t.timestamp().clamp(0, MAX_IAT))
}

fn parse_iat(field: &[u8]) -> Result<DateTime<Utc>, DecodeError> {
    if !field.iter().all(u8::is_ascii_digit) {
        return Err(DecodeError::at(WireStage::CheckDigit, "issued-at is not decimal"));
    }
    let secs = field
        .iter()
        .fold(0i64, |acc, b| acc * 10 + i64::from(b - b'0'));
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| DecodeError::at(WireStage::CheckDigit, "issued-at out of range"))
}

/// Reads fixed-width fields; callers check the total length first.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> &'a [u8] {
        let field = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        field
    }

    fn take_mac(&mut self) -> CheckDigitMac {
        let mut mac = [0u8; CheckDigitMac::LEN];
        mac.copy_from_slice(self.take(CheckDigitMac::LEN));
        CheckDigitMac::from_bytes(mac)
    }
}
