use std::io::{self, Write};
use std::ops::{Deref, DerefMut};

use zeroize::Zeroize;

use super::{
    encode_length, length_header_size, minimal_integer_bytes, Asn1Element, UNIVERSAL_BOOLEAN_TYPE,
    UNIVERSAL_ENUMERATED_TYPE, UNIVERSAL_INTEGER_TYPE, UNIVERSAL_NULL_TYPE,
    UNIVERSAL_OCTET_STRING_TYPE, UNIVERSAL_SEQUENCE_TYPE, UNIVERSAL_SET_TYPE,
};

/// Growable BER writer. Constructed values are opened with `begin_sequence` /
/// `begin_set`; the returned guard back-patches the length header when it is
/// dropped (or `end()` is called).
#[derive(Debug, Default)]
pub struct Asn1Buffer {
    buffer: Vec<u8>,
    zero_on_clear: bool,
}

impl Asn1Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            zero_on_clear: false,
        }
    }

    /// When enabled, `clear()` overwrites the backing storage before resetting
    /// the length. Use for buffers that carried credentials.
    pub fn set_zero_on_clear(&mut self, zero_on_clear: bool) {
        self.zero_on_clear = zero_on_clear;
    }

    pub fn zero_on_clear(&self) -> bool {
        self.zero_on_clear
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Resets the buffer for reuse, keeping its allocation.
    pub fn clear(&mut self) {
        if self.zero_on_clear {
            // Vec::zeroize wipes the spare capacity as well, then truncates.
            self.buffer.zeroize();
        }
        self.buffer.clear();
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.buffer)
    }

    pub fn add_boolean(&mut self, value: bool) {
        self.add_boolean_with_type(UNIVERSAL_BOOLEAN_TYPE, value);
    }

    pub fn add_boolean_with_type(&mut self, tag: u8, value: bool) {
        self.buffer
            .extend_from_slice(&[tag, 0x01, if value { 0xFF } else { 0x00 }]);
    }

    pub fn add_integer(&mut self, value: i32) {
        self.add_long_with_type(UNIVERSAL_INTEGER_TYPE, value as i64);
    }

    pub fn add_integer_with_type(&mut self, tag: u8, value: i32) {
        self.add_long_with_type(tag, value as i64);
    }

    pub fn add_long(&mut self, value: i64) {
        self.add_long_with_type(UNIVERSAL_INTEGER_TYPE, value);
    }

    pub fn add_long_with_type(&mut self, tag: u8, value: i64) {
        let (bytes, start) = minimal_integer_bytes(value);
        self.buffer.push(tag);
        self.buffer.push((bytes.len() - start) as u8);
        self.buffer.extend_from_slice(&bytes[start..]);
    }

    pub fn add_enumerated(&mut self, value: i32) {
        self.add_long_with_type(UNIVERSAL_ENUMERATED_TYPE, value as i64);
    }

    pub fn add_enumerated_with_type(&mut self, tag: u8, value: i32) {
        self.add_long_with_type(tag, value as i64);
    }

    pub fn add_null(&mut self) {
        self.add_null_with_type(UNIVERSAL_NULL_TYPE);
    }

    pub fn add_null_with_type(&mut self, tag: u8) {
        self.buffer.extend_from_slice(&[tag, 0x00]);
    }

    pub fn add_octet_string(&mut self, value: &[u8]) {
        self.add_octet_string_with_type(UNIVERSAL_OCTET_STRING_TYPE, value);
    }

    pub fn add_octet_string_with_type(&mut self, tag: u8, value: &[u8]) {
        self.buffer.push(tag);
        encode_length(value.len(), &mut self.buffer);
        self.buffer.extend_from_slice(value);
    }

    pub fn add_string(&mut self, value: &str) {
        self.add_string_with_type(UNIVERSAL_OCTET_STRING_TYPE, value);
    }

    /// Appends a UTF-8 string as an octet string.
    ///
    /// The header is written for one byte per character. When the string holds
    /// multi-byte characters the header is rewritten in place so the value
    /// bytes already appended stay intact.
    pub fn add_string_with_type(&mut self, tag: u8, value: &str) {
        self.buffer.push(tag);
        let header_start = self.buffer.len();
        let char_count = value.chars().count();
        encode_length(char_count, &mut self.buffer);
        let value_start = self.buffer.len();
        self.buffer.extend_from_slice(value.as_bytes());

        if value.len() != char_count {
            let mut header = Vec::with_capacity(length_header_size(value.len()));
            encode_length(value.len(), &mut header);
            self.buffer.splice(header_start..value_start, header);
        }
    }

    pub fn add_element(&mut self, element: &Asn1Element) {
        self.add_octet_string_with_type(element.tag(), element.value());
    }

    pub fn begin_sequence(&mut self) -> Asn1BufferSequence<'_> {
        self.begin_constructed(UNIVERSAL_SEQUENCE_TYPE)
    }

    pub fn begin_sequence_with_type(&mut self, tag: u8) -> Asn1BufferSequence<'_> {
        self.begin_constructed(tag)
    }

    pub fn begin_set(&mut self) -> Asn1BufferSequence<'_> {
        self.begin_constructed(UNIVERSAL_SET_TYPE)
    }

    pub fn begin_set_with_type(&mut self, tag: u8) -> Asn1BufferSequence<'_> {
        self.begin_constructed(tag)
    }

    fn begin_constructed(&mut self, tag: u8) -> Asn1BufferSequence<'_> {
        self.buffer.push(tag);
        // Single placeholder byte; widened on close when the value needs long form.
        self.buffer.push(0x00);
        let value_start = self.buffer.len();
        Asn1BufferSequence {
            buffer: self,
            value_start,
            finished: false,
        }
    }

    fn patch_length(&mut self, value_start: usize) {
        let length = self.buffer.len() - value_start;
        if length <= 0x7F {
            self.buffer[value_start - 1] = length as u8;
            return;
        }
        debug_assert!(length <= super::MAX_ELEMENT_LENGTH);
        let mut header = Vec::with_capacity(length_header_size(length));
        encode_length(length, &mut header);
        self.buffer[value_start - 1] = header[0];
        self.buffer
            .splice(value_start..value_start, header[1..].iter().copied());
    }
}

/// Open constructed value inside an [`Asn1Buffer`]. Elements are added
/// through `Deref`; the length is fixed when the guard goes away.
#[derive(Debug)]
pub struct Asn1BufferSequence<'a> {
    buffer: &'a mut Asn1Buffer,
    value_start: usize,
    finished: bool,
}

impl Asn1BufferSequence<'_> {
    /// Closes the value. Equivalent to dropping the guard.
    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.finished {
            self.buffer.patch_length(self.value_start);
            self.finished = true;
        }
    }
}

impl Deref for Asn1BufferSequence<'_> {
    type Target = Asn1Buffer;

    fn deref(&self) -> &Asn1Buffer {
        self.buffer
    }
}

impl DerefMut for Asn1BufferSequence<'_> {
    fn deref_mut(&mut self) -> &mut Asn1Buffer {
        self.buffer
    }
}

impl Drop for Asn1BufferSequence<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
