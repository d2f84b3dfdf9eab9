use super::{
    decode_length, encode_length, integer_from_bytes, Asn1Error, UNIVERSAL_OCTET_STRING_TYPE,
};

/// A single decoded BER element: tag plus raw value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asn1Element {
    tag: u8,
    value: Vec<u8>,
}

impl Asn1Element {
    pub fn new(tag: u8, value: Vec<u8>) -> Self {
        Self { tag, value }
    }

    pub fn octet_string(value: impl Into<Vec<u8>>) -> Self {
        Self::new(UNIVERSAL_OCTET_STRING_TYPE, value.into())
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    pub fn is_constructed(&self) -> bool {
        self.tag & 0x20 != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.value.len() + 6);
        out.push(self.tag);
        encode_length(self.value.len(), &mut out);
        out.extend_from_slice(&self.value);
        out
    }

    /// Decodes exactly one element; trailing bytes are an error.
    pub fn decode(data: &[u8]) -> Result<Self, Asn1Error> {
        let (element, consumed) = Self::decode_prefix(data)?;
        if consumed != data.len() {
            return Err(Asn1Error::Malformed(format!(
                "{} trailing bytes after element",
                data.len() - consumed
            )));
        }
        Ok(element)
    }

    /// Decodes the element at the start of `data`, returning it with the
    /// number of bytes it occupied.
    pub fn decode_prefix(data: &[u8]) -> Result<(Self, usize), Asn1Error> {
        let tag = *data.first().ok_or(Asn1Error::Truncated("type"))?;
        let (length, header) = decode_length(&data[1..])?;
        let start = 1 + header;
        let end = start
            .checked_add(length)
            .filter(|&end| end <= data.len())
            .ok_or(Asn1Error::Truncated("value"))?;
        Ok((Self::new(tag, data[start..end].to_vec()), end))
    }

    /// Decodes the value of a constructed element into its components.
    pub fn elements(&self) -> Result<Vec<Asn1Element>, Asn1Error> {
        let mut elements = Vec::new();
        let mut rest = &self.value[..];
        while !rest.is_empty() {
            let (element, consumed) = Self::decode_prefix(rest)?;
            elements.push(element);
            rest = &rest[consumed..];
        }
        Ok(elements)
    }

    pub fn as_boolean(&self) -> Result<bool, Asn1Error> {
        match self.value.as_slice() {
            [b] => Ok(*b != 0),
            other => Err(Asn1Error::InvalidValueLength {
                kind: "boolean",
                length: other.len(),
            }),
        }
    }

    pub fn as_integer(&self) -> Result<i32, Asn1Error> {
        if !(1..=4).contains(&self.value.len()) {
            return Err(Asn1Error::InvalidValueLength {
                kind: "integer",
                length: self.value.len(),
            });
        }
        Ok(integer_from_bytes(&self.value) as i32)
    }

    pub fn as_long(&self) -> Result<i64, Asn1Error> {
        if !(1..=8).contains(&self.value.len()) {
            return Err(Asn1Error::InvalidValueLength {
                kind: "long",
                length: self.value.len(),
            });
        }
        Ok(integer_from_bytes(&self.value))
    }

    pub fn as_string(&self) -> Result<String, Asn1Error> {
        String::from_utf8(self.value.clone()).map_err(|_| Asn1Error::InvalidUtf8)
    }

    /// Checks the tag, for callers that require a specific type.
    pub fn expect_tag(&self, expected: u8) -> Result<&Self, Asn1Error> {
        if self.tag == expected {
            Ok(self)
        } else {
            Err(Asn1Error::UnexpectedType {
                expected,
                found: self.tag,
            })
        }
    }
}
