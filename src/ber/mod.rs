// BER (Basic Encoding Rules) codec used by the LDAP protocol layer.
// Writer, element and streaming reader live in their own modules.

mod buffer;
mod element;
mod reader;

pub use buffer::{Asn1Buffer, Asn1BufferSequence};
pub use element::Asn1Element;
pub use reader::{Asn1StreamReader, Asn1StreamReaderSequence};

use std::io;
use thiserror::Error;

pub const UNIVERSAL_BOOLEAN_TYPE: u8 = 0x01;
pub const UNIVERSAL_INTEGER_TYPE: u8 = 0x02;
pub const UNIVERSAL_OCTET_STRING_TYPE: u8 = 0x04;
pub const UNIVERSAL_NULL_TYPE: u8 = 0x05;
pub const UNIVERSAL_ENUMERATED_TYPE: u8 = 0x0A;
pub const UNIVERSAL_SEQUENCE_TYPE: u8 = 0x30;
pub const UNIVERSAL_SET_TYPE: u8 = 0x31;

/// Largest length a BER element may declare (lengths are carried as a signed 32-bit value).
pub const MAX_ELEMENT_LENGTH: usize = i32::MAX as usize;

/// Errors raised while encoding or decoding BER data.
#[derive(Debug, Error)]
pub enum Asn1Error {
    #[error("invalid number of length bytes: {0} (expected 1 to 4)")]
    InvalidLengthByteCount(u8),

    #[error("element length {length} exceeds the maximum allowed size of {max} bytes")]
    LengthExceedsMaximum { length: usize, max: usize },

    #[error("invalid {kind} value length: {length} bytes")]
    InvalidValueLength { kind: &'static str, length: usize },

    #[error("unexpected end of input while reading {0}")]
    Truncated(&'static str),

    #[error("element of type 0x{found:02X} found where 0x{expected:02X} was expected")]
    UnexpectedType { expected: u8, found: u8 },

    #[error("read past the end of a sequence declaring {length} bytes")]
    SequenceOverrun { length: usize },

    #[error("value is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0}")]
    Malformed(String),

    #[error("timed out waiting for element data (first byte: {initial})")]
    Timeout { initial: bool },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Asn1Error {
    /// True when the failure came from the transport rather than the bytes.
    pub fn is_io(&self) -> bool {
        matches!(self, Asn1Error::Io(_) | Asn1Error::Timeout { .. })
    }
}

/// Appends the BER length header for `length` to `out`.
///
/// Short form for values up to 127, otherwise `0x80 | n` followed by the
/// `n` big-endian bytes of the value with no leading zero byte.
pub(crate) fn encode_length(length: usize, out: &mut Vec<u8>) {
    if length <= 0x7F {
        out.push(length as u8);
        return;
    }
    let bytes = (length as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

/// Number of bytes `encode_length` produces for `length`.
pub(crate) fn length_header_size(length: usize) -> usize {
    if length <= 0x7F {
        1
    } else {
        1 + (8 - (length as u64).leading_zeros() as usize / 8)
    }
}

/// Decodes a length header at the start of `data`, returning the length and the
/// number of header bytes consumed.
pub(crate) fn decode_length(data: &[u8]) -> Result<(usize, usize), Asn1Error> {
    let first = *data.first().ok_or(Asn1Error::Truncated("length"))?;
    if first & 0x80 == 0 {
        return Ok((first as usize, 1));
    }
    let count = first & 0x7F;
    if !(1..=4).contains(&count) {
        return Err(Asn1Error::InvalidLengthByteCount(count));
    }
    let count = count as usize;
    if data.len() < 1 + count {
        return Err(Asn1Error::Truncated("length"));
    }
    let length = data[1..=count]
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize);
    if length > MAX_ELEMENT_LENGTH {
        return Err(Asn1Error::LengthExceedsMaximum {
            length,
            max: MAX_ELEMENT_LENGTH,
        });
    }
    Ok((length, 1 + count))
}

/// Minimal two's-complement big-endian bytes of `value`: no redundant
/// leading 0x00 or 0xFF byte.
pub(crate) fn minimal_integer_bytes(value: i64) -> ([u8; 8], usize) {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    (bytes, start)
}

/// Sign-extends big-endian two's-complement bytes into an `i64`.
pub(crate) fn integer_from_bytes(value: &[u8]) -> i64 {
    let mut result: i64 = if value.first().is_some_and(|b| b & 0x80 != 0) {
        -1
    } else {
        0
    };
    for &b in value {
        result = (result << 8) | b as i64;
    }
    result
}
