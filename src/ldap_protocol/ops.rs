// Request and response operations carried inside an LDAPMessage

use std::io::Read;

use crate::ber::{Asn1Buffer, Asn1Error, Asn1StreamReader, Asn1StreamReaderSequence};

use super::filter::Filter;
use super::result::LdapResult;
use super::*;

const BIND_AUTH_SIMPLE: u8 = 0x80;
const BIND_AUTH_SASL: u8 = 0xA3;
const BIND_SERVER_SASL_CREDS: u8 = 0x87;
const MODIFY_DN_NEW_SUPERIOR: u8 = 0x80;
const EXTENDED_REQUEST_NAME: u8 = 0x80;
const EXTENDED_REQUEST_VALUE: u8 = 0x81;
const EXTENDED_RESPONSE_NAME: u8 = 0x8A;
const EXTENDED_RESPONSE_VALUE: u8 = 0x8B;
const INTERMEDIATE_RESPONSE_NAME: u8 = 0x80;
const INTERMEDIATE_RESPONSE_VALUE: u8 = 0x81;

/// Skips components a newer peer may append after the ones decoded here.
fn skip_remaining<R: Read>(
    reader: &mut Asn1StreamReader<R>,
    seq: &Asn1StreamReaderSequence,
) -> Result<(), Asn1Error> {
    while seq.has_more_elements(reader)? {
        reader.skip_element()?;
    }
    Ok(())
}

fn peek_in<R: Read>(
    reader: &mut Asn1StreamReader<R>,
    seq: &Asn1StreamReaderSequence,
) -> Result<Option<u8>, Asn1Error> {
    if seq.has_more_elements(reader)? {
        reader.peek()
    } else {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, values: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn from_strings(name: impl Into<String>, values: &[&str]) -> Self {
        Self::new(
            name,
            values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        )
    }

    pub(crate) fn write_to(&self, buf: &mut Asn1Buffer) {
        let mut seq = buf.begin_sequence();
        seq.add_string(&self.name);
        let mut set = seq.begin_set();
        for value in &self.values {
            set.add_octet_string(value);
        }
    }

    pub(crate) fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        let seq = reader.begin_required_sequence()?;
        let name = reader.read_string()?;
        let set = reader.begin_required_sequence()?;
        let mut values = Vec::new();
        while set.has_more_elements(reader)? {
            values.push(reader.read_bytes()?);
        }
        skip_remaining(reader, &seq)?;
        Ok(Self { name, values })
    }
}

fn write_attribute_list(buf: &mut Asn1Buffer, attributes: &[Attribute]) {
    let mut seq = buf.begin_sequence();
    for attribute in attributes {
        attribute.write_to(&mut seq);
    }
}

fn read_attribute_list<R: Read>(
    reader: &mut Asn1StreamReader<R>,
) -> Result<Vec<Attribute>, Asn1Error> {
    let seq = reader.begin_required_sequence()?;
    let mut attributes = Vec::new();
    while seq.has_more_elements(reader)? {
        attributes.push(Attribute::read_from(reader)?);
    }
    Ok(attributes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(Vec<u8>),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

impl BindRequest {
    pub fn simple(name: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            version: 3,
            name: name.into(),
            authentication: BindAuthentication::Simple(password.into()),
        }
    }

    pub fn sasl(mechanism: impl Into<String>, credentials: Option<Vec<u8>>) -> Self {
        Self {
            version: 3,
            name: String::new(),
            authentication: BindAuthentication::Sasl {
                mechanism: mechanism.into(),
                credentials,
            },
        }
    }

    pub(crate) fn write_to(&self, buf: &mut Asn1Buffer) {
        let mut seq = buf.begin_sequence_with_type(LDAP_TAG_BIND_REQUEST);
        seq.add_integer(self.version);
        seq.add_string(&self.name);
        match &self.authentication {
            BindAuthentication::Simple(password) => {
                seq.add_octet_string_with_type(BIND_AUTH_SIMPLE, password);
            }
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            } => {
                let mut sasl = seq.begin_sequence_with_type(BIND_AUTH_SASL);
                sasl.add_string(mechanism);
                if let Some(credentials) = credentials {
                    sasl.add_octet_string(credentials);
                }
            }
        }
    }

    pub(crate) fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        let seq = reader.begin_required_sequence()?;
        let version = reader.read_integer()?;
        let name = reader.read_string()?;
        // Some clients tag simple credentials with something other than [0];
        // anything that is not the SASL choice is taken as a simple password.
        let authentication = if reader.peek()? == Some(BIND_AUTH_SASL) {
            let sasl = reader.begin_required_sequence()?;
            let mechanism = reader.read_string()?;
            let credentials = if sasl.has_more_elements(reader)? {
                Some(reader.read_bytes()?)
            } else {
                None
            };
            skip_remaining(reader, &sasl)?;
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            }
        } else {
            BindAuthentication::Simple(reader.read_bytes()?)
        };
        skip_remaining(reader, &seq)?;
        Ok(Self {
            version,
            name,
            authentication,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_credentials: Option<Vec<u8>>,
}

impl BindResponse {
    pub(crate) fn write_to(&self, buf: &mut Asn1Buffer) {
        let mut seq = buf.begin_sequence_with_type(LDAP_TAG_BIND_RESPONSE);
        self.result.write_components(&mut seq);
        if let Some(credentials) = &self.server_sasl_credentials {
            seq.add_octet_string_with_type(BIND_SERVER_SASL_CREDS, credentials);
        }
    }

    pub(crate) fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        let seq = reader.begin_required_sequence()?;
        let result = LdapResult::read_components(reader, &seq)?;
        let server_sasl_credentials = if peek_in(reader, &seq)? == Some(BIND_SERVER_SASL_CREDS) {
            Some(reader.read_bytes()?)
        } else {
            None
        };
        skip_remaining(reader, &seq)?;
        Ok(Self {
            result,
            server_sasl_credentials,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
    Subordinates = 3,
}

impl TryFrom<i32> for SearchScope {
    type Error = Asn1Error;

    fn try_from(value: i32) -> Result<Self, Asn1Error> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            3 => Ok(SearchScope::Subordinates),
            _ => Err(Asn1Error::Malformed(format!("invalid search scope: {}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: SearchScope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn new(base_dn: impl Into<String>, scope: SearchScope, filter: Filter) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope,
            deref_aliases: 0,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter,
            attributes: Vec::new(),
        }
    }

    pub(crate) fn write_to(&self, buf: &mut Asn1Buffer) {
        let mut seq = buf.begin_sequence_with_type(LDAP_TAG_SEARCH_REQUEST);
        seq.add_string(&self.base_dn);
        seq.add_enumerated(self.scope as i32);
        seq.add_enumerated(self.deref_aliases);
        seq.add_integer(self.size_limit);
        seq.add_integer(self.time_limit);
        seq.add_boolean(self.types_only);
        self.filter.write_to(&mut seq);
        let mut attrs = seq.begin_sequence();
        for attribute in &self.attributes {
            attrs.add_string(attribute);
        }
    }

    pub(crate) fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        let seq = reader.begin_required_sequence()?;
        let base_dn = reader.read_string()?;
        let scope = SearchScope::try_from(reader.read_enumerated()?)?;
        let deref_aliases = reader.read_enumerated()?;
        let size_limit = reader.read_integer()?;
        let time_limit = reader.read_integer()?;
        let types_only = reader.read_boolean()?;
        let filter = Filter::read_from(reader)?;
        let attrs = reader.begin_required_sequence()?;
        let mut attributes = Vec::new();
        while attrs.has_more_elements(reader)? {
            attributes.push(reader.read_string()?);
        }
        skip_remaining(reader, &seq)?;
        Ok(Self {
            base_dn,
            scope,
            deref_aliases,
            size_limit,
            time_limit,
            types_only,
            filter,
            attributes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

impl SearchResultEntry {
    pub(crate) fn write_to(&self, buf: &mut Asn1Buffer) {
        let mut seq = buf.begin_sequence_with_type(LDAP_TAG_SEARCH_RESULT_ENTRY);
        seq.add_string(&self.dn);
        write_attribute_list(&mut seq, &self.attributes);
    }

    pub(crate) fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        let seq = reader.begin_required_sequence()?;
        let dn = reader.read_string()?;
        let attributes = read_attribute_list(reader)?;
        skip_remaining(reader, &seq)?;
        Ok(Self { dn, attributes })
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModificationType {
    Add = 0,
    Delete = 1,
    Replace = 2,
    Increment = 3,
}

impl TryFrom<i32> for ModificationType {
    type Error = Asn1Error;

    fn try_from(value: i32) -> Result<Self, Asn1Error> {
        match value {
            0 => Ok(ModificationType::Add),
            1 => Ok(ModificationType::Delete),
            2 => Ok(ModificationType::Replace),
            3 => Ok(ModificationType::Increment),
            _ => Err(Asn1Error::Malformed(format!(
                "invalid modification type: {}",
                value
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub operation: ModificationType,
    pub attribute: Attribute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub dn: String,
    pub changes: Vec<Modification>,
}

impl ModifyRequest {
    pub(crate) fn write_to(&self, buf: &mut Asn1Buffer) {
        let mut seq = buf.begin_sequence_with_type(LDAP_TAG_MODIFY_REQUEST);
        seq.add_string(&self.dn);
        let mut changes = seq.begin_sequence();
        for change in &self.changes {
            let mut item = changes.begin_sequence();
            item.add_enumerated(change.operation as i32);
            change.attribute.write_to(&mut item);
        }
    }

    pub(crate) fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        let seq = reader.begin_required_sequence()?;
        let dn = reader.read_string()?;
        let list = reader.begin_required_sequence()?;
        let mut changes = Vec::new();
        while list.has_more_elements(reader)? {
            let item = reader.begin_required_sequence()?;
            let operation = ModificationType::try_from(reader.read_enumerated()?)?;
            let attribute = Attribute::read_from(reader)?;
            skip_remaining(reader, &item)?;
            changes.push(Modification {
                operation,
                attribute,
            });
        }
        skip_remaining(reader, &seq)?;
        Ok(Self { dn, changes })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

impl AddRequest {
    pub(crate) fn write_to(&self, buf: &mut Asn1Buffer) {
        let mut seq = buf.begin_sequence_with_type(LDAP_TAG_ADD_REQUEST);
        seq.add_string(&self.dn);
        write_attribute_list(&mut seq, &self.attributes);
    }

    pub(crate) fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        let seq = reader.begin_required_sequence()?;
        let dn = reader.read_string()?;
        let attributes = read_attribute_list(reader)?;
        skip_remaining(reader, &seq)?;
        Ok(Self { dn, attributes })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub dn: String,
}

impl DeleteRequest {
    pub(crate) fn write_to(&self, buf: &mut Asn1Buffer) {
        buf.add_string_with_type(LDAP_TAG_DELETE_REQUEST, &self.dn);
    }

    pub(crate) fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        Ok(Self {
            dn: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub dn: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

impl ModifyDnRequest {
    pub(crate) fn write_to(&self, buf: &mut Asn1Buffer) {
        let mut seq = buf.begin_sequence_with_type(LDAP_TAG_MODIFY_DN_REQUEST);
        seq.add_string(&self.dn);
        seq.add_string(&self.new_rdn);
        seq.add_boolean(self.delete_old_rdn);
        if let Some(new_superior) = &self.new_superior {
            seq.add_string_with_type(MODIFY_DN_NEW_SUPERIOR, new_superior);
        }
    }

    pub(crate) fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        let seq = reader.begin_required_sequence()?;
        let dn = reader.read_string()?;
        let new_rdn = reader.read_string()?;
        let delete_old_rdn = reader.read_boolean()?;
        let new_superior = if peek_in(reader, &seq)? == Some(MODIFY_DN_NEW_SUPERIOR) {
            Some(reader.read_string()?)
        } else {
            None
        };
        skip_remaining(reader, &seq)?;
        Ok(Self {
            dn,
            new_rdn,
            delete_old_rdn,
            new_superior,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub dn: String,
    pub attribute: String,
    pub value: Vec<u8>,
}

impl CompareRequest {
    pub(crate) fn write_to(&self, buf: &mut Asn1Buffer) {
        let mut seq = buf.begin_sequence_with_type(LDAP_TAG_COMPARE_REQUEST);
        seq.add_string(&self.dn);
        let mut ava = seq.begin_sequence();
        ava.add_string(&self.attribute);
        ava.add_octet_string(&self.value);
    }

    pub(crate) fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        let seq = reader.begin_required_sequence()?;
        let dn = reader.read_string()?;
        let ava = reader.begin_required_sequence()?;
        let attribute = reader.read_string()?;
        let value = reader.read_bytes()?;
        skip_remaining(reader, &ava)?;
        skip_remaining(reader, &seq)?;
        Ok(Self {
            dn,
            attribute,
            value,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub oid: String,
    pub value: Option<Vec<u8>>,
}

impl ExtendedRequest {
    pub fn new(oid: impl Into<String>, value: Option<Vec<u8>>) -> Self {
        Self {
            oid: oid.into(),
            value,
        }
    }

    pub(crate) fn write_to(&self, buf: &mut Asn1Buffer) {
        let mut seq = buf.begin_sequence_with_type(LDAP_TAG_EXTENDED_REQUEST);
        seq.add_string_with_type(EXTENDED_REQUEST_NAME, &self.oid);
        if let Some(value) = &self.value {
            seq.add_octet_string_with_type(EXTENDED_REQUEST_VALUE, value);
        }
    }

    pub(crate) fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        let seq = reader.begin_required_sequence()?;
        let oid = reader.read_string()?;
        let value = if peek_in(reader, &seq)? == Some(EXTENDED_REQUEST_VALUE) {
            Some(reader.read_bytes()?)
        } else {
            None
        };
        skip_remaining(reader, &seq)?;
        Ok(Self { oid, value })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub oid: Option<String>,
    pub value: Option<Vec<u8>>,
}

impl ExtendedResponse {
    pub fn new(result: LdapResult) -> Self {
        Self {
            result,
            oid: None,
            value: None,
        }
    }

    pub(crate) fn write_to(&self, buf: &mut Asn1Buffer) {
        let mut seq = buf.begin_sequence_with_type(LDAP_TAG_EXTENDED_RESPONSE);
        self.result.write_components(&mut seq);
        if let Some(oid) = &self.oid {
            seq.add_string_with_type(EXTENDED_RESPONSE_NAME, oid);
        }
        if let Some(value) = &self.value {
            seq.add_octet_string_with_type(EXTENDED_RESPONSE_VALUE, value);
        }
    }

    pub(crate) fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        let seq = reader.begin_required_sequence()?;
        let result = LdapResult::read_components(reader, &seq)?;
        let mut response = Self::new(result);
        if peek_in(reader, &seq)? == Some(EXTENDED_RESPONSE_NAME) {
            response.oid = Some(reader.read_string()?);
        }
        if peek_in(reader, &seq)? == Some(EXTENDED_RESPONSE_VALUE) {
            response.value = Some(reader.read_bytes()?);
        }
        skip_remaining(reader, &seq)?;
        Ok(response)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateResponse {
    pub oid: Option<String>,
    pub value: Option<Vec<u8>>,
}

impl IntermediateResponse {
    pub(crate) fn write_to(&self, buf: &mut Asn1Buffer) {
        let mut seq = buf.begin_sequence_with_type(LDAP_TAG_INTERMEDIATE_RESPONSE);
        if let Some(oid) = &self.oid {
            seq.add_string_with_type(INTERMEDIATE_RESPONSE_NAME, oid);
        }
        if let Some(value) = &self.value {
            seq.add_octet_string_with_type(INTERMEDIATE_RESPONSE_VALUE, value);
        }
    }

    pub(crate) fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        let seq = reader.begin_required_sequence()?;
        let mut response = Self {
            oid: None,
            value: None,
        };
        if peek_in(reader, &seq)? == Some(INTERMEDIATE_RESPONSE_NAME) {
            response.oid = Some(reader.read_string()?);
        }
        if peek_in(reader, &seq)? == Some(INTERMEDIATE_RESPONSE_VALUE) {
            response.value = Some(reader.read_bytes()?);
        }
        skip_remaining(reader, &seq)?;
        Ok(response)
    }
}

/// Writes one of the responses that consist of nothing but an LDAPResult.
pub(crate) fn write_result(buf: &mut Asn1Buffer, tag: u8, result: &LdapResult) {
    let mut seq = buf.begin_sequence_with_type(tag);
    result.write_components(&mut seq);
}

pub(crate) fn read_result<R: Read>(
    reader: &mut Asn1StreamReader<R>,
) -> Result<LdapResult, Asn1Error> {
    let seq = reader.begin_required_sequence()?;
    let result = LdapResult::read_components(reader, &seq)?;
    skip_remaining(reader, &seq)?;
    Ok(result)
}

pub(crate) fn write_search_reference(buf: &mut Asn1Buffer, uris: &[String]) {
    let mut seq = buf.begin_sequence_with_type(LDAP_TAG_SEARCH_RESULT_REFERENCE);
    for uri in uris {
        seq.add_string(uri);
    }
}

pub(crate) fn read_search_reference<R: Read>(
    reader: &mut Asn1StreamReader<R>,
) -> Result<Vec<String>, Asn1Error> {
    let seq = reader.begin_required_sequence()?;
    let mut uris = Vec::new();
    while seq.has_more_elements(reader)? {
        uris.push(reader.read_string()?);
    }
    Ok(uris)
}
