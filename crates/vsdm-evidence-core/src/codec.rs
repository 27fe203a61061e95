//! Wire codec for exam evidence (the `pnw` query parameter).
//!
//! Pipeline: fixed-tag XML document, UTF-8, gzip, base64. The decoder is fed
//! hostile input on purpose (truncated, bit-flipped, oversized tokens), so every
//! failure is returned as a [`DecodeError`] and all reads are bounded.
//!
//! Document shape:
//!
//! ```text
//! <?xml version="1.0" encoding="UTF-8" standalone="yes"?>
//! <PN xmlns="http://ws.gematik.de/fa/vsdm/pnw/v1.0">
//!   <TS>20250114160000</TS>   issuance time, UTC
//!   <E>2</E>                  evidence result code
//!   <PZ>...</PZ>              base64 check digit, omitted offline
//! </PN>
//! ```

use std::io::{Read, Write};

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{DecodeError, EncodeError, WireStage};
use crate::evidence::{CheckDigit, EvidenceRecord, EvidenceResult};
use crate::layout::{check_digit_bytes, decode_check_digit};

/// Namespace of the evidence document.
pub const NAMESPACE: &str = "http://ws.gematik.de/fa/vsdm/pnw/v1.0";

/// Longest token accepted, in characters.
pub const MAX_TOKEN_LEN: usize = 4096;

/// Largest decompressed document accepted, in bytes.
pub const MAX_DOCUMENT_LEN: usize = 4096;

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Encode a record to its wire token.
///
/// Byte-stable: the gzip header carries no timestamp or file name.
pub fn encode(record: &EvidenceRecord) -> Result<String, EncodeError> {
    let document = encode_document(record);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(document.as_bytes())?;
    let compressed = encoder.finish()?;

    Ok(STANDARD.encode(compressed))
}

/// Decode a wire token.
pub fn decode(token: &str) -> Result<EvidenceRecord, DecodeError> {
    let token = token.trim();
    if token.len() > MAX_TOKEN_LEN {
        return Err(DecodeError::at(
            WireStage::Base64,
            format!("token exceeds {} characters", MAX_TOKEN_LEN),
        ));
    }

    let compressed = decode_base64(token)
        .ok_or_else(|| DecodeError::at(WireStage::Base64, "not base64"))?;

    let document = decompress(&compressed)?;
    let document = String::from_utf8(document)
        .map_err(|_| DecodeError::at(WireStage::Document, "not UTF-8"))?;

    decode_document(&document)
}

/// Encode a check digit as it appears inside the `PZ` element.
pub fn encode_check_digit(digit: &CheckDigit) -> String {
    STANDARD.encode(check_digit_bytes(digit))
}

/// Decode the content of a `PZ` element.
pub fn decode_check_digit_str(pz: &str) -> Result<CheckDigit, DecodeError> {
    let bytes = decode_base64(pz.trim())
        .ok_or_else(|| DecodeError::at(WireStage::CheckDigit, "check digit is not base64"))?;
    decode_check_digit(&bytes)
}

/// Render the evidence document.
pub fn encode_document(record: &EvidenceRecord) -> String {
    let mut doc = String::with_capacity(256);
    doc.push_str(XML_DECLARATION);
    doc.push_str(&format!(r#"<PN xmlns="{}">"#, NAMESPACE));
    doc.push_str(&format!("<TS>{}</TS>", record.timestamp.format(TIMESTAMP_FORMAT)));
    doc.push_str(&format!("<E>{}</E>", record.result.code()));
    if let Some(digit) = &record.check_digit {
        doc.push_str(&format!("<PZ>{}</PZ>", encode_check_digit(digit)));
    }
    doc.push_str("</PN>");
    doc
}

/// Parse the evidence document.
pub fn decode_document(doc: &str) -> Result<EvidenceRecord, DecodeError> {
    let fields = parse_fields(doc)?;

    let ts = fields
        .ts
        .ok_or_else(|| DecodeError::at(WireStage::Document, "missing TS element"))?;
    let e = fields
        .e
        .ok_or_else(|| DecodeError::at(WireStage::Document, "missing E element"))?;

    let timestamp = parse_timestamp(ts)?;
    let result = e
        .trim()
        .parse::<u8>()
        .ok()
        .and_then(EvidenceResult::from_code)
        .ok_or_else(|| DecodeError::at(WireStage::Document, format!("invalid result code {:?}", e)))?;

    let check_digit = match fields.pz.map(str::trim) {
        None | Some("") => None,
        Some(pz) => Some(decode_check_digit_str(pz)?),
    };

    Ok(EvidenceRecord {
        result,
        timestamp,
        check_digit,
    })
}

fn decode_base64(s: &str) -> Option<Vec<u8>> {
    STANDARD
        .decode(s)
        .or_else(|_| STANDARD_NO_PAD.decode(s))
        .or_else(|_| URL_SAFE.decode(s))
        .or_else(|_| URL_SAFE_NO_PAD.decode(s))
        .ok()
}

fn decompress(compressed: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    GzDecoder::new(compressed)
        .take(MAX_DOCUMENT_LEN as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::at(WireStage::Compression, e.to_string()))?;

    if out.len() > MAX_DOCUMENT_LEN {
        return Err(DecodeError::at(
            WireStage::Compression,
            format!("document exceeds {} bytes", MAX_DOCUMENT_LEN),
        ));
    }
    if out.is_empty() {
        return Err(DecodeError::at(WireStage::Compression, "empty stream"));
    }
    Ok(out)
}

fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>, DecodeError> {
    let ts = ts.trim();
    if ts.len() != 14 || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecodeError::at(WireStage::Document, format!("invalid TS {:?}", ts)));
    }
    NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| DecodeError::at(WireStage::Document, format!("invalid TS {:?}", ts)))
}

/// Raw element contents of the document.
#[derive(Default)]
struct Fields<'a> {
    ts: Option<&'a str>,
    e: Option<&'a str>,
    pz: Option<&'a str>,
}

/// Scan `<PN ...> (<TS>|<E>|<PZ>)* </PN>`, optionally preceded by an XML declaration.
fn parse_fields(doc: &str) -> Result<Fields<'_>, DecodeError> {
    let malformed = |detail: &str| DecodeError::at(WireStage::Document, detail);

    let mut rest = doc.trim_start_matches('\u{feff}').trim_start();
    if rest.starts_with("<?xml") {
        let end = rest.find("?>").ok_or_else(|| malformed("unterminated XML declaration"))?;
        rest = rest[end + 2..].trim_start();
    }

    rest = rest
        .strip_prefix("<PN")
        .ok_or_else(|| malformed("missing PN root element"))?;
    if !rest.starts_with('>') && !rest.starts_with(char::is_whitespace) {
        return Err(malformed("missing PN root element"));
    }
    let open_end = rest.find('>').ok_or_else(|| malformed("unterminated PN tag"))?;
    if rest[..open_end].contains('<') || rest[..open_end].ends_with('/') {
        return Err(malformed("malformed PN tag"));
    }
    rest = &rest[open_end + 1..];

    let mut fields = Fields::default();
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("</PN>") {
            if !after.trim().is_empty() {
                return Err(malformed("content after PN root element"));
            }
            return Ok(fields);
        }

        let tag_end = rest
            .strip_prefix('<')
            .and_then(|r| r.find('>'))
            .ok_or_else(|| malformed("expected element"))?;
        let name = &rest[1..tag_end + 1];
        let body_start = tag_end + 2;

        let slot = match name {
            "TS" => &mut fields.ts,
            "E" => &mut fields.e,
            "PZ" => &mut fields.pz,
            _ => return Err(malformed("unexpected element")),
        };

        let close = format!("</{}>", name);
        let body_len = rest[body_start..]
            .find(&close)
            .ok_or_else(|| malformed("unterminated element"))?;
        let body = &rest[body_start..body_start + body_len];
        if body.contains('<') {
            return Err(malformed("nested markup"));
        }
        if slot.replace(body).is_some() {
            return Err(malformed("duplicate element"));
        }

        rest = &rest[body_start + body_len + close.len()..];
    }
}
