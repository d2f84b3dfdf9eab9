// Search filter codec (RFC 4511 section 4.5.1) and RFC 4515 string form

use std::fmt;
use std::io::Read;

use crate::ber::{Asn1Buffer, Asn1Error, Asn1StreamReader};

pub const FILTER_AND: u8 = 0xA0;
pub const FILTER_OR: u8 = 0xA1;
pub const FILTER_NOT: u8 = 0xA2;
pub const FILTER_EQUALITY: u8 = 0xA3;
pub const FILTER_SUBSTRINGS: u8 = 0xA4;
pub const FILTER_GREATER_OR_EQUAL: u8 = 0xA5;
pub const FILTER_LESS_OR_EQUAL: u8 = 0xA6;
pub const FILTER_PRESENT: u8 = 0x87;
pub const FILTER_APPROXIMATE: u8 = 0xA8;
pub const FILTER_EXTENSIBLE: u8 = 0xA9;

const SUBSTRING_INITIAL: u8 = 0x80;
const SUBSTRING_ANY: u8 = 0x81;
const SUBSTRING_FINAL: u8 = 0x82;

const EXTENSIBLE_MATCHING_RULE: u8 = 0x81;
const EXTENSIBLE_TYPE: u8 = 0x82;
const EXTENSIBLE_VALUE: u8 = 0x83;
const EXTENSIBLE_DN_ATTRIBUTES: u8 = 0x84;

/// Deepest and/or/not nesting accepted from the wire.
pub const MAX_FILTER_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality { attribute: String, value: Vec<u8> },
    Substrings {
        attribute: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_: Option<Vec<u8>>,
    },
    GreaterOrEqual { attribute: String, value: Vec<u8> },
    LessOrEqual { attribute: String, value: Vec<u8> },
    Present(String),
    Approximate { attribute: String, value: Vec<u8> },
    Extensible {
        matching_rule: Option<String>,
        attribute: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

impl Filter {
    pub fn equality(attribute: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Filter::Equality {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present(attribute.into())
    }

    /// `(objectClass=*)`, the usual match-everything filter.
    pub fn match_all() -> Self {
        Filter::present("objectClass")
    }

    pub fn write_to(&self, buf: &mut Asn1Buffer) {
        match self {
            Filter::And(filters) | Filter::Or(filters) => {
                let tag = if matches!(self, Filter::And(_)) {
                    FILTER_AND
                } else {
                    FILTER_OR
                };
                let mut set = buf.begin_set_with_type(tag);
                for filter in filters {
                    filter.write_to(&mut set);
                }
            }
            Filter::Not(inner) => {
                let mut seq = buf.begin_sequence_with_type(FILTER_NOT);
                inner.write_to(&mut seq);
            }
            Filter::Equality { attribute, value } => {
                write_assertion(buf, FILTER_EQUALITY, attribute, value)
            }
            Filter::GreaterOrEqual { attribute, value } => {
                write_assertion(buf, FILTER_GREATER_OR_EQUAL, attribute, value)
            }
            Filter::LessOrEqual { attribute, value } => {
                write_assertion(buf, FILTER_LESS_OR_EQUAL, attribute, value)
            }
            Filter::Approximate { attribute, value } => {
                write_assertion(buf, FILTER_APPROXIMATE, attribute, value)
            }
            Filter::Substrings {
                attribute,
                initial,
                any,
                final_,
            } => {
                let mut seq = buf.begin_sequence_with_type(FILTER_SUBSTRINGS);
                seq.add_string(attribute);
                let mut parts = seq.begin_sequence();
                if let Some(initial) = initial {
                    parts.add_octet_string_with_type(SUBSTRING_INITIAL, initial);
                }
                for value in any {
                    parts.add_octet_string_with_type(SUBSTRING_ANY, value);
                }
                if let Some(final_) = final_ {
                    parts.add_octet_string_with_type(SUBSTRING_FINAL, final_);
                }
            }
            Filter::Present(attribute) => {
                buf.add_string_with_type(FILTER_PRESENT, attribute);
            }
            Filter::Extensible {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                let mut seq = buf.begin_sequence_with_type(FILTER_EXTENSIBLE);
                if let Some(rule) = matching_rule {
                    seq.add_string_with_type(EXTENSIBLE_MATCHING_RULE, rule);
                }
                if let Some(attribute) = attribute {
                    seq.add_string_with_type(EXTENSIBLE_TYPE, attribute);
                }
                seq.add_octet_string_with_type(EXTENSIBLE_VALUE, value);
                if *dn_attributes {
                    seq.add_boolean_with_type(EXTENSIBLE_DN_ATTRIBUTES, true);
                }
            }
        }
    }

    pub fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        Self::read_nested(reader, 0)
    }

    fn read_nested<R: Read>(
        reader: &mut Asn1StreamReader<R>,
        depth: usize,
    ) -> Result<Self, Asn1Error> {
        if depth > MAX_FILTER_DEPTH {
            return Err(Asn1Error::Malformed(format!(
                "filter nested deeper than {} levels",
                MAX_FILTER_DEPTH
            )));
        }
        let tag = reader.peek()?.ok_or(Asn1Error::Truncated("filter"))?;
        match tag {
            FILTER_AND | FILTER_OR => {
                let set = reader.begin_required_sequence()?;
                let mut filters = Vec::new();
                while set.has_more_elements(reader)? {
                    filters.push(Self::read_nested(reader, depth + 1)?);
                }
                Ok(if tag == FILTER_AND {
                    Filter::And(filters)
                } else {
                    Filter::Or(filters)
                })
            }
            FILTER_NOT => {
                let seq = reader.begin_required_sequence()?;
                let inner = Self::read_nested(reader, depth + 1)?;
                if seq.has_more_elements(reader)? {
                    return Err(Asn1Error::Malformed(
                        "NOT filter contains more than one component".into(),
                    ));
                }
                Ok(Filter::Not(Box::new(inner)))
            }
            FILTER_EQUALITY | FILTER_GREATER_OR_EQUAL | FILTER_LESS_OR_EQUAL
            | FILTER_APPROXIMATE => {
                reader.begin_required_sequence()?;
                let attribute = reader.read_string()?;
                let value = reader.read_bytes()?;
                Ok(match tag {
                    FILTER_EQUALITY => Filter::Equality { attribute, value },
                    FILTER_GREATER_OR_EQUAL => Filter::GreaterOrEqual { attribute, value },
                    FILTER_LESS_OR_EQUAL => Filter::LessOrEqual { attribute, value },
                    _ => Filter::Approximate { attribute, value },
                })
            }
            FILTER_SUBSTRINGS => {
                reader.begin_required_sequence()?;
                let attribute = reader.read_string()?;
                let parts = reader.begin_required_sequence()?;
                let (mut initial, mut any, mut final_) = (None, Vec::new(), None);
                while parts.has_more_elements(reader)? {
                    let part_tag = reader.peek()?.ok_or(Asn1Error::Truncated("substring"))?;
                    let value = reader.read_bytes()?;
                    match part_tag {
                        SUBSTRING_INITIAL if initial.is_none() && any.is_empty() => {
                            initial = Some(value)
                        }
                        SUBSTRING_ANY if final_.is_none() => any.push(value),
                        SUBSTRING_FINAL if final_.is_none() => final_ = Some(value),
                        other => {
                            return Err(Asn1Error::Malformed(format!(
                                "unexpected substring component 0x{:02X}",
                                other
                            )))
                        }
                    }
                }
                Ok(Filter::Substrings {
                    attribute,
                    initial,
                    any,
                    final_,
                })
            }
            FILTER_PRESENT => Ok(Filter::Present(reader.read_string()?)),
            FILTER_EXTENSIBLE => {
                let seq = reader.begin_required_sequence()?;
                let mut matching_rule = None;
                let mut attribute = None;
                let mut value = None;
                let mut dn_attributes = false;
                while seq.has_more_elements(reader)? {
                    match reader.peek()?.ok_or(Asn1Error::Truncated("filter"))? {
                        EXTENSIBLE_MATCHING_RULE => matching_rule = Some(reader.read_string()?),
                        EXTENSIBLE_TYPE => attribute = Some(reader.read_string()?),
                        EXTENSIBLE_VALUE => value = Some(reader.read_bytes()?),
                        EXTENSIBLE_DN_ATTRIBUTES => dn_attributes = reader.read_boolean()?,
                        other => {
                            return Err(Asn1Error::Malformed(format!(
                                "unexpected extensible match component 0x{:02X}",
                                other
                            )))
                        }
                    }
                }
                let value = value.ok_or_else(|| {
                    Asn1Error::Malformed("extensible match without a match value".into())
                })?;
                if matching_rule.is_none() && attribute.is_none() {
                    return Err(Asn1Error::Malformed(
                        "extensible match needs a matching rule or an attribute type".into(),
                    ));
                }
                Ok(Filter::Extensible {
                    matching_rule,
                    attribute,
                    value,
                    dn_attributes,
                })
            }
            other => Err(Asn1Error::Malformed(format!(
                "invalid filter type 0x{:02X}",
                other
            ))),
        }
    }
}

fn write_assertion(buf: &mut Asn1Buffer, tag: u8, attribute: &str, value: &[u8]) {
    let mut seq = buf.begin_sequence_with_type(tag);
    seq.add_string(attribute);
    seq.add_octet_string(value);
}

/// RFC 4515 value escaping: `*()\`, NUL and non-ASCII bytes become `\xx`.
fn write_escaped(f: &mut fmt::Formatter<'_>, value: &[u8]) -> fmt::Result {
    for &b in value {
        match b {
            b'*' | b'(' | b')' | b'\\' | 0 => write!(f, "\\{:02x}", b)?,
            0x20..=0x7E => write!(f, "{}", b as char)?,
            _ => write!(f, "\\{:02x}", b)?,
        }
    }
    Ok(())
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(filters) | Filter::Or(filters) => {
                f.write_str(if matches!(self, Filter::And(_)) { "(&" } else { "(|" })?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                f.write_str(")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::Equality { attribute, value } => {
                write!(f, "({}=", attribute)?;
                write_escaped(f, value)?;
                f.write_str(")")
            }
            Filter::GreaterOrEqual { attribute, value } => {
                write!(f, "({}>=", attribute)?;
                write_escaped(f, value)?;
                f.write_str(")")
            }
            Filter::LessOrEqual { attribute, value } => {
                write!(f, "({}<=", attribute)?;
                write_escaped(f, value)?;
                f.write_str(")")
            }
            Filter::Approximate { attribute, value } => {
                write!(f, "({}~=", attribute)?;
                write_escaped(f, value)?;
                f.write_str(")")
            }
            Filter::Substrings {
                attribute,
                initial,
                any,
                final_,
            } => {
                write!(f, "({}=", attribute)?;
                if let Some(initial) = initial {
                    write_escaped(f, initial)?;
                }
                f.write_str("*")?;
                for value in any {
                    write_escaped(f, value)?;
                    f.write_str("*")?;
                }
                if let Some(final_) = final_ {
                    write_escaped(f, final_)?;
                }
                f.write_str(")")
            }
            Filter::Present(attribute) => write!(f, "({}=*)", attribute),
            Filter::Extensible {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                f.write_str("(")?;
                if let Some(attribute) = attribute {
                    f.write_str(attribute)?;
                }
                if *dn_attributes {
                    f.write_str(":dn")?;
                }
                if let Some(rule) = matching_rule {
                    write!(f, ":{}", rule)?;
                }
                f.write_str(":=")?;
                write_escaped(f, value)?;
                f.write_str(")")
            }
        }
    }
}
