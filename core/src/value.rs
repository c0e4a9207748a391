//! Characteristic value codec
//!
//! Converts between the text a web client types into a URL and the raw bytes
//! a GATT characteristic carries.
//!
//! Request values (web → BLE) take exactly one of three forms:
//!
//! - `~hello`: tilde followed by printable ASCII (0x20-0x7F); the bytes of
//!   the text after the tilde.
//! - `.2.-1`: dot, width (1, 2 or 4), dot, signed decimal; written
//!   little-endian in exactly `width` bytes. Out-of-range values wrap modulo
//!   2^(8·width).
//! - `0100`: an even number of hex digits, either case.
//!
//! Response values (BLE → web) are rendered as [`DecodedValue`]:
//! `{len, hex, num?, str?}`.
//!
//! Two boundary behaviors of the response side are kept as named policies in
//! [`DecodePolicy`] rather than silently changed:
//!
//! - a numeric value of exactly zero omits `num`;
//! - `str` only appears when the payload itself starts with `~`.
//!
//! [`DecodePolicy::legacy`] is the default and reproduces both.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Integer widths accepted by the `.<len>.<value>` form
pub const INTEGER_WIDTHS: [usize; 3] = [1, 2, 4];

/// Why a request value was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("empty value")]
    Empty,
    #[error("invalid string: {0}")]
    InvalidAscii(String),
    #[error("invalid integer: {0}")]
    InvalidInteger(String),
    #[error("invalid hex string: {0}")]
    InvalidHex(String),
}

// ============================================================================
// WEB → BLE
// ============================================================================

/// Parse a request value into the bytes to write.
pub fn parse(text: &str) -> Result<Vec<u8>, ValueError> {
    if text.is_empty() {
        return Err(ValueError::Empty);
    }

    if let Some(ascii) = text.strip_prefix('~') {
        return parse_ascii(ascii).ok_or_else(|| ValueError::InvalidAscii(text.to_string()));
    }

    if text.starts_with('.') {
        return parse_integer(text).ok_or_else(|| ValueError::InvalidInteger(text.to_string()));
    }

    parse_hex(text).ok_or_else(|| ValueError::InvalidHex(text.to_string()))
}

/// Encode an optional request value, `None` meaning a validation failure.
pub fn encode(text: Option<&str>) -> Option<Vec<u8>> {
    text.and_then(|t| parse(t).ok())
}

fn is_printable(byte: u8) -> bool {
    (0x20..=0x7F).contains(&byte)
}

fn parse_ascii(body: &str) -> Option<Vec<u8>> {
    if body.is_empty() || !body.bytes().all(is_printable) {
        return None;
    }
    Some(body.as_bytes().to_vec())
}

fn parse_integer(text: &str) -> Option<Vec<u8>> {
    let bytes = text.as_bytes();
    if bytes.len() < 4 || bytes[0] != b'.' || bytes[2] != b'.' {
        return None;
    }
    let width = match bytes[1] {
        b'1' => 1,
        b'2' => 2,
        b'4' => 4,
        _ => return None,
    };

    let number = &text[3..];
    let (negative, digits) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    // Accumulating modulo 2^32 keeps the low `width` bytes exact for any
    // number of digits.
    let magnitude = digits.bytes().fold(0u32, |acc, d| {
        acc.wrapping_mul(10).wrapping_add(u32::from(d - b'0'))
    });
    let value = if negative {
        magnitude.wrapping_neg()
    } else {
        magnitude
    };

    Some(value.to_le_bytes()[..width].to_vec())
}

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    hex::decode(text).ok()
}

// ============================================================================
// BLE → WEB
// ============================================================================

/// Which payloads get a `str` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrDetection {
    /// Only payloads whose first byte is `~` followed by printable ASCII.
    TildePrefixed,
    /// Any non-empty payload made entirely of printable ASCII.
    Printable,
}

/// Boundary behaviors of [`decode_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodePolicy {
    /// Drop `num` when the decoded integer is zero.
    pub omit_zero_num: bool,
    /// Rule deciding when `str` is present.
    pub str_detection: StrDetection,
}

impl DecodePolicy {
    /// Field presence existing web clients were written against.
    pub const fn legacy() -> Self {
        Self {
            omit_zero_num: true,
            str_detection: StrDetection::TildePrefixed,
        }
    }

    /// `num` whenever the width allows, `str` for any printable payload.
    pub const fn corrected() -> Self {
        Self {
            omit_zero_num: false,
            str_detection: StrDetection::Printable,
        }
    }
}

impl Default for DecodePolicy {
    fn default() -> Self {
        Self::legacy()
    }
}

/// A characteristic value as returned to web clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedValue {
    /// Payload length in bytes
    pub len: usize,
    /// Lowercase hex of the payload
    pub hex: String,
    /// Little-endian integer for 1, 2 and 4 byte payloads (u8, i16, i32)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num: Option<i64>,
    /// Payload as text, see [`StrDetection`]
    #[serde(rename = "str", default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Decode with the default (legacy) policy.
pub fn decode(data: &[u8]) -> DecodedValue {
    decode_with(data, DecodePolicy::default())
}

/// Decode a payload under an explicit policy.
pub fn decode_with(data: &[u8], policy: DecodePolicy) -> DecodedValue {
    let num = integer_value(data).filter(|n| !(policy.omit_zero_num && *n == 0));

    let text = match policy.str_detection {
        StrDetection::TildePrefixed => data.first() == Some(&b'~') && data.len() > 1,
        StrDetection::Printable => !data.is_empty(),
    }
    .then_some(data)
    .filter(|d| d.iter().copied().all(is_printable))
    .map(|d| String::from_utf8_lossy(d).into_owned());

    DecodedValue {
        len: data.len(),
        hex: hex::encode(data),
        num,
        text,
    }
}

/// Little-endian integer view: one byte unsigned, two and four bytes signed.
fn integer_value(data: &[u8]) -> Option<i64> {
    match data.len() {
        1 => Some(i64::from(data[0])),
        2 => Some(i64::from(i16::from_le_bytes([data[0], data[1]]))),
        4 => Some(i64::from(i32::from_le_bytes([
            data[0], data[1], data[2], data[3],
        ]))),
        _ => None,
    }
}
