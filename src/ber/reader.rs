use std::io::{ErrorKind, Read};

use tracing::trace;

use super::{integer_from_bytes, Asn1Element, Asn1Error, MAX_ELEMENT_LENGTH};

/// Incremental BER decoder over a byte stream.
///
/// Reads one element (or one element header) at a time and never buffers
/// more than the value currently being decoded. The only lookahead is the
/// single tag byte held by [`peek`](Self::peek). A reader has one owner:
/// callers serialize all reads against it.
pub struct Asn1StreamReader<R: Read> {
    inner: Option<R>,
    peeked: Option<u8>,
    total_bytes_read: usize,
    max_element_size: usize,
    ignore_initial_timeout: bool,
    ignore_subsequent_timeout: bool,
}

/// Bounds of a sequence or set opened by
/// [`Asn1StreamReader::begin_sequence`]. Holds only offsets; the components
/// are read from the reader itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Asn1StreamReaderSequence {
    tag: u8,
    length: usize,
    end: usize,
}

impl Asn1StreamReaderSequence {
    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// True while the reader has consumed fewer bytes than the sequence declared.
    pub fn has_more_elements<R: Read>(
        &self,
        reader: &Asn1StreamReader<R>,
    ) -> Result<bool, Asn1Error> {
        let consumed = reader.total_bytes_read();
        if consumed > self.end {
            return Err(Asn1Error::SequenceOverrun {
                length: self.length,
            });
        }
        Ok(consumed < self.end)
    }
}

impl<R: Read> Asn1StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: Some(inner),
            peeked: None,
            total_bytes_read: 0,
            max_element_size: MAX_ELEMENT_LENGTH,
            ignore_initial_timeout: false,
            ignore_subsequent_timeout: false,
        }
    }

    pub fn with_max_element_size(inner: R, max_element_size: usize) -> Self {
        let mut reader = Self::new(inner);
        reader.set_max_element_size(max_element_size);
        reader
    }

    /// Zero means no limit beyond what a BER length can express.
    pub fn set_max_element_size(&mut self, max_element_size: usize) {
        self.max_element_size = if max_element_size == 0 {
            MAX_ELEMENT_LENGTH
        } else {
            max_element_size.min(MAX_ELEMENT_LENGTH)
        };
    }

    pub fn max_element_size(&self) -> usize {
        self.max_element_size
    }

    /// Chooses which read timeouts are retried instead of returned: those
    /// hit before the first byte of an element, and those hit part way
    /// through one.
    pub fn set_ignore_socket_timeout(&mut self, initial: bool, subsequent: bool) {
        self.ignore_initial_timeout = initial;
        self.ignore_subsequent_timeout = subsequent;
    }

    pub fn total_bytes_read(&self) -> usize {
        self.total_bytes_read
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Drops the underlying stream. Later reads report end of input.
    pub fn close(&mut self) {
        self.peeked = None;
        self.inner = None;
    }

    /// Returns the next tag byte without consuming it, or `None` at end of input.
    pub fn peek(&mut self) -> Result<Option<u8>, Asn1Error> {
        if self.peeked.is_none() {
            self.peeked = self.read_raw_byte(true)?;
        }
        Ok(self.peeked)
    }

    /// Reads the tag of the next element. `None` means the stream ended
    /// cleanly on an element boundary; the stream is closed in that case.
    pub fn read_type(&mut self) -> Result<Option<u8>, Asn1Error> {
        let tag = match self.peeked.take() {
            Some(tag) => Some(tag),
            None => self.read_raw_byte(true)?,
        };
        match tag {
            Some(tag) => {
                self.total_bytes_read += 1;
                Ok(Some(tag))
            }
            None => {
                trace!(
                    bytes_read = self.total_bytes_read,
                    "end of stream at element boundary"
                );
                self.close();
                Ok(None)
            }
        }
    }

    pub fn read_length(&mut self) -> Result<usize, Asn1Error> {
        let first = self.read_subsequent_byte("length")?;
        if first & 0x80 == 0 {
            return self.check_length(first as usize);
        }

        let count = first & 0x7F;
        if !(1..=4).contains(&count) {
            return Err(Asn1Error::InvalidLengthByteCount(count));
        }
        let mut length = 0usize;
        for _ in 0..count {
            length = (length << 8) | self.read_subsequent_byte("length")? as usize;
        }
        self.check_length(length)
    }

    fn check_length(&self, length: usize) -> Result<usize, Asn1Error> {
        if length > self.max_element_size {
            return Err(Asn1Error::LengthExceedsMaximum {
                length,
                max: self.max_element_size,
            });
        }
        Ok(length)
    }

    /// Reads a whole element. `None` on a clean end of stream.
    pub fn read_element(&mut self) -> Result<Option<Asn1Element>, Asn1Error> {
        let Some(tag) = self.read_type()? else {
            return Ok(None);
        };
        let length = self.read_length()?;
        let value = self.read_value(length)?;
        Ok(Some(Asn1Element::new(tag, value)))
    }

    /// Consumes the next element without decoding its value.
    pub fn skip_element(&mut self) -> Result<(), Asn1Error> {
        self.read_required_type()?;
        let length = self.read_length()?;
        self.skip(length)
    }

    pub fn read_boolean(&mut self) -> Result<bool, Asn1Error> {
        let length = self.read_header()?;
        if length != 1 {
            return self.reject_length("boolean", length);
        }
        Ok(self.read_subsequent_byte("value")? != 0)
    }

    pub fn read_integer(&mut self) -> Result<i32, Asn1Error> {
        let length = self.read_header()?;
        if !(1..=4).contains(&length) {
            return self.reject_length("integer", length);
        }
        let value = self.read_value(length)?;
        Ok(integer_from_bytes(&value) as i32)
    }

    pub fn read_long(&mut self) -> Result<i64, Asn1Error> {
        let length = self.read_header()?;
        if !(1..=8).contains(&length) {
            return self.reject_length("long", length);
        }
        let value = self.read_value(length)?;
        Ok(integer_from_bytes(&value))
    }

    pub fn read_enumerated(&mut self) -> Result<i32, Asn1Error> {
        self.read_integer()
    }

    pub fn read_null(&mut self) -> Result<(), Asn1Error> {
        let length = self.read_header()?;
        if length != 0 {
            return self.reject_length("null", length);
        }
        Ok(())
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, Asn1Error> {
        let length = self.read_header()?;
        self.read_value(length)
    }

    pub fn read_string(&mut self) -> Result<String, Asn1Error> {
        String::from_utf8(self.read_bytes()?).map_err(|_| Asn1Error::InvalidUtf8)
    }

    /// Opens a sequence. `None` on a clean end of stream.
    pub fn begin_sequence(&mut self) -> Result<Option<Asn1StreamReaderSequence>, Asn1Error> {
        let Some(tag) = self.read_type()? else {
            return Ok(None);
        };
        let length = self.read_length()?;
        Ok(Some(Asn1StreamReaderSequence {
            tag,
            length,
            end: self.total_bytes_read + length,
        }))
    }

    pub fn begin_set(&mut self) -> Result<Option<Asn1StreamReaderSequence>, Asn1Error> {
        self.begin_sequence()
    }

    /// Opens a sequence that must be present, as inside an enclosing element.
    pub fn begin_required_sequence(&mut self) -> Result<Asn1StreamReaderSequence, Asn1Error> {
        self.begin_sequence()?
            .ok_or(Asn1Error::Truncated("sequence"))
    }

    fn read_required_type(&mut self) -> Result<u8, Asn1Error> {
        self.read_type()?.ok_or(Asn1Error::Truncated("type"))
    }

    fn read_header(&mut self) -> Result<usize, Asn1Error> {
        self.read_required_type()?;
        self.read_length()
    }

    /// Skips a value of the wrong size so the stream stays on an element boundary.
    fn reject_length<T>(&mut self, kind: &'static str, length: usize) -> Result<T, Asn1Error> {
        self.skip(length)?;
        Err(Asn1Error::InvalidValueLength { kind, length })
    }

    fn read_value(&mut self, length: usize) -> Result<Vec<u8>, Asn1Error> {
        let mut value = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            filled += self.read_chunk(&mut value[filled..], "value")?;
        }
        Ok(value)
    }

    fn skip(&mut self, mut length: usize) -> Result<(), Asn1Error> {
        let mut scratch = [0u8; 512];
        while length > 0 {
            let want = length.min(scratch.len());
            length -= self.read_chunk(&mut scratch[..want], "value")?;
        }
        Ok(())
    }

    fn read_subsequent_byte(&mut self, what: &'static str) -> Result<u8, Asn1Error> {
        let mut byte = [0u8; 1];
        self.read_chunk(&mut byte, what)?;
        Ok(byte[0])
    }

    /// Reads at least one byte into `buf` from the middle of an element.
    fn read_chunk(&mut self, buf: &mut [u8], what: &'static str) -> Result<usize, Asn1Error> {
        let ignore = self.ignore_subsequent_timeout;
        let inner = self.inner.as_mut().ok_or(Asn1Error::Truncated(what))?;
        loop {
            match inner.read(buf) {
                Ok(0) => return Err(Asn1Error::Truncated(what)),
                Ok(n) => {
                    self.total_bytes_read += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(e.kind()) => {
                    if ignore {
                        trace!("ignoring read timeout inside an element");
                        continue;
                    }
                    return Err(Asn1Error::Timeout { initial: false });
                }
                Err(e) => return Err(Asn1Error::Io(e)),
            }
        }
    }

    /// Reads the first byte of an element. Not counted until consumed.
    fn read_raw_byte(&mut self, initial: bool) -> Result<Option<u8>, Asn1Error> {
        let ignore = if initial {
            self.ignore_initial_timeout
        } else {
            self.ignore_subsequent_timeout
        };
        let Some(inner) = self.inner.as_mut() else {
            return Ok(None);
        };
        let mut byte = [0u8; 1];
        loop {
            match inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(e.kind()) => {
                    if ignore {
                        continue;
                    }
                    return Err(Asn1Error::Timeout { initial });
                }
                Err(e) => return Err(Asn1Error::Io(e)),
            }
        }
    }
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
