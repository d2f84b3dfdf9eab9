// LDAP v3 protocol messages (RFC 4511) on top of the BER codec

mod filter;
mod ops;
mod result;

pub use filter::{Filter, MAX_FILTER_DEPTH};
pub use ops::{
    AddRequest, Attribute, BindAuthentication, BindRequest, BindResponse, CompareRequest,
    DeleteRequest, ExtendedRequest, ExtendedResponse, IntermediateResponse, Modification,
    ModificationType, ModifyDnRequest, ModifyRequest, SearchRequest, SearchResultEntry,
    SearchScope,
};
pub use result::{LdapResult, ResultCode};

use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::ber::{Asn1Buffer, Asn1Element, Asn1Error, Asn1StreamReader};

pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DELETE_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DELETE_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;

/// Context [0] IMPLICIT SEQUENCE OF Control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;

/// Unsolicited notification sent before the server drops a connection.
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// Request operation kinds, as used by the control table and the
/// server's allowed / authentication-required operation lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Abandon,
    Add,
    Bind,
    Compare,
    Delete,
    Extended,
    Modify,
    ModifyDn,
    Search,
    Unbind,
}

impl OperationType {
    pub const ALL: [OperationType; 10] = [
        OperationType::Abandon,
        OperationType::Add,
        OperationType::Bind,
        OperationType::Compare,
        OperationType::Delete,
        OperationType::Extended,
        OperationType::Modify,
        OperationType::ModifyDn,
        OperationType::Search,
        OperationType::Unbind,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Abandon => "abandon",
            OperationType::Add => "add",
            OperationType::Bind => "bind",
            OperationType::Compare => "compare",
            OperationType::Delete => "delete",
            OperationType::Extended => "extended",
            OperationType::Modify => "modify",
            OperationType::ModifyDn => "modify_dn",
            OperationType::Search => "search",
            OperationType::Unbind => "unbind",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// LDAP Control (request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

impl Control {
    pub fn new(oid: impl Into<String>, critical: bool, value: Option<Vec<u8>>) -> Self {
        Self {
            oid: oid.into(),
            critical,
            value,
        }
    }

    fn write_to(&self, buf: &mut Asn1Buffer) {
        let mut seq = buf.begin_sequence();
        seq.add_string(&self.oid);
        if self.critical {
            seq.add_boolean(true);
        }
        if let Some(value) = &self.value {
            seq.add_octet_string(value);
        }
    }

    /// Control ::= SEQUENCE { controlType, criticality BOOLEAN DEFAULT FALSE, controlValue OCTET STRING OPTIONAL }
    fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        let seq = reader.begin_required_sequence()?;
        let oid = reader.read_string()?;
        let mut critical = false;
        let mut value = None;
        while seq.has_more_elements(reader)? {
            match reader.peek()? {
                Some(crate::ber::UNIVERSAL_BOOLEAN_TYPE) if value.is_none() => {
                    critical = reader.read_boolean()?;
                }
                Some(crate::ber::UNIVERSAL_OCTET_STRING_TYPE) if value.is_none() => {
                    value = Some(reader.read_bytes()?);
                }
                Some(other) => {
                    return Err(Asn1Error::Malformed(format!(
                        "unexpected element 0x{:02X} in control {}",
                        other, oid
                    )))
                }
                None => return Err(Asn1Error::Truncated("control")),
            }
        }
        Ok(Self {
            oid,
            critical,
            value,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
    AbandonRequest(i32),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    DeleteRequest(DeleteRequest),
    DeleteResponse(LdapResult),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    ModifyDnRequest(ModifyDnRequest),
    ModifyDnResponse(LdapResult),
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(Vec<String>),
    SearchResultDone(LdapResult),
    UnbindRequest,
}

impl ProtocolOp {
    /// The BER type of this operation on the wire.
    pub fn tag(&self) -> u8 {
        match self {
            ProtocolOp::AbandonRequest(_) => LDAP_TAG_ABANDON_REQUEST,
            ProtocolOp::AddRequest(_) => LDAP_TAG_ADD_REQUEST,
            ProtocolOp::AddResponse(_) => LDAP_TAG_ADD_RESPONSE,
            ProtocolOp::BindRequest(_) => LDAP_TAG_BIND_REQUEST,
            ProtocolOp::BindResponse(_) => LDAP_TAG_BIND_RESPONSE,
            ProtocolOp::CompareRequest(_) => LDAP_TAG_COMPARE_REQUEST,
            ProtocolOp::CompareResponse(_) => LDAP_TAG_COMPARE_RESPONSE,
            ProtocolOp::DeleteRequest(_) => LDAP_TAG_DELETE_REQUEST,
            ProtocolOp::DeleteResponse(_) => LDAP_TAG_DELETE_RESPONSE,
            ProtocolOp::ExtendedRequest(_) => LDAP_TAG_EXTENDED_REQUEST,
            ProtocolOp::ExtendedResponse(_) => LDAP_TAG_EXTENDED_RESPONSE,
            ProtocolOp::IntermediateResponse(_) => LDAP_TAG_INTERMEDIATE_RESPONSE,
            ProtocolOp::ModifyRequest(_) => LDAP_TAG_MODIFY_REQUEST,
            ProtocolOp::ModifyResponse(_) => LDAP_TAG_MODIFY_RESPONSE,
            ProtocolOp::ModifyDnRequest(_) => LDAP_TAG_MODIFY_DN_REQUEST,
            ProtocolOp::ModifyDnResponse(_) => LDAP_TAG_MODIFY_DN_RESPONSE,
            ProtocolOp::SearchRequest(_) => LDAP_TAG_SEARCH_REQUEST,
            ProtocolOp::SearchResultEntry(_) => LDAP_TAG_SEARCH_RESULT_ENTRY,
            ProtocolOp::SearchResultReference(_) => LDAP_TAG_SEARCH_RESULT_REFERENCE,
            ProtocolOp::SearchResultDone(_) => LDAP_TAG_SEARCH_RESULT_DONE,
            ProtocolOp::UnbindRequest => LDAP_TAG_UNBIND_REQUEST,
        }
    }

    /// Operation type of a request; `None` for responses.
    pub fn operation_type(&self) -> Option<OperationType> {
        match self {
            ProtocolOp::AbandonRequest(_) => Some(OperationType::Abandon),
            ProtocolOp::AddRequest(_) => Some(OperationType::Add),
            ProtocolOp::BindRequest(_) => Some(OperationType::Bind),
            ProtocolOp::CompareRequest(_) => Some(OperationType::Compare),
            ProtocolOp::DeleteRequest(_) => Some(OperationType::Delete),
            ProtocolOp::ExtendedRequest(_) => Some(OperationType::Extended),
            ProtocolOp::ModifyRequest(_) => Some(OperationType::Modify),
            ProtocolOp::ModifyDnRequest(_) => Some(OperationType::ModifyDn),
            ProtocolOp::SearchRequest(_) => Some(OperationType::Search),
            ProtocolOp::UnbindRequest => Some(OperationType::Unbind),
            _ => None,
        }
    }

    /// The LDAPResult of a response operation.
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            ProtocolOp::AddResponse(result)
            | ProtocolOp::CompareResponse(result)
            | ProtocolOp::DeleteResponse(result)
            | ProtocolOp::ModifyResponse(result)
            | ProtocolOp::ModifyDnResponse(result)
            | ProtocolOp::SearchResultDone(result) => Some(result),
            ProtocolOp::BindResponse(response) => Some(&response.result),
            ProtocolOp::ExtendedResponse(response) => Some(&response.result),
            _ => None,
        }
    }

    pub fn write_to(&self, buf: &mut Asn1Buffer) {
        match self {
            ProtocolOp::AbandonRequest(id) => {
                buf.add_integer_with_type(LDAP_TAG_ABANDON_REQUEST, *id)
            }
            ProtocolOp::AddRequest(op) => op.write_to(buf),
            ProtocolOp::BindRequest(op) => op.write_to(buf),
            ProtocolOp::BindResponse(op) => op.write_to(buf),
            ProtocolOp::CompareRequest(op) => op.write_to(buf),
            ProtocolOp::DeleteRequest(op) => op.write_to(buf),
            ProtocolOp::ExtendedRequest(op) => op.write_to(buf),
            ProtocolOp::ExtendedResponse(op) => op.write_to(buf),
            ProtocolOp::IntermediateResponse(op) => op.write_to(buf),
            ProtocolOp::ModifyRequest(op) => op.write_to(buf),
            ProtocolOp::ModifyDnRequest(op) => op.write_to(buf),
            ProtocolOp::SearchRequest(op) => op.write_to(buf),
            ProtocolOp::SearchResultEntry(op) => op.write_to(buf),
            ProtocolOp::SearchResultReference(uris) => ops::write_search_reference(buf, uris),
            ProtocolOp::AddResponse(result)
            | ProtocolOp::CompareResponse(result)
            | ProtocolOp::DeleteResponse(result)
            | ProtocolOp::ModifyResponse(result)
            | ProtocolOp::ModifyDnResponse(result)
            | ProtocolOp::SearchResultDone(result) => {
                ops::write_result(buf, self.tag(), result)
            }
            ProtocolOp::UnbindRequest => buf.add_null_with_type(LDAP_TAG_UNBIND_REQUEST),
        }
    }

    pub fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Self, Asn1Error> {
        let tag = reader.peek()?.ok_or(Asn1Error::Truncated("protocol op"))?;
        let op = match tag {
            LDAP_TAG_ABANDON_REQUEST => ProtocolOp::AbandonRequest(reader.read_integer()?),
            LDAP_TAG_ADD_REQUEST => ProtocolOp::AddRequest(AddRequest::read_from(reader)?),
            LDAP_TAG_ADD_RESPONSE => ProtocolOp::AddResponse(ops::read_result(reader)?),
            LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(BindRequest::read_from(reader)?),
            LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(BindResponse::read_from(reader)?),
            LDAP_TAG_COMPARE_REQUEST => {
                ProtocolOp::CompareRequest(CompareRequest::read_from(reader)?)
            }
            LDAP_TAG_COMPARE_RESPONSE => ProtocolOp::CompareResponse(ops::read_result(reader)?),
            LDAP_TAG_DELETE_REQUEST => ProtocolOp::DeleteRequest(DeleteRequest::read_from(reader)?),
            LDAP_TAG_DELETE_RESPONSE => ProtocolOp::DeleteResponse(ops::read_result(reader)?),
            LDAP_TAG_EXTENDED_REQUEST => {
                ProtocolOp::ExtendedRequest(ExtendedRequest::read_from(reader)?)
            }
            LDAP_TAG_EXTENDED_RESPONSE => {
                ProtocolOp::ExtendedResponse(ExtendedResponse::read_from(reader)?)
            }
            LDAP_TAG_INTERMEDIATE_RESPONSE => {
                ProtocolOp::IntermediateResponse(IntermediateResponse::read_from(reader)?)
            }
            LDAP_TAG_MODIFY_REQUEST => ProtocolOp::ModifyRequest(ModifyRequest::read_from(reader)?),
            LDAP_TAG_MODIFY_RESPONSE => ProtocolOp::ModifyResponse(ops::read_result(reader)?),
            LDAP_TAG_MODIFY_DN_REQUEST => {
                ProtocolOp::ModifyDnRequest(ModifyDnRequest::read_from(reader)?)
            }
            LDAP_TAG_MODIFY_DN_RESPONSE => ProtocolOp::ModifyDnResponse(ops::read_result(reader)?),
            LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(SearchRequest::read_from(reader)?),
            LDAP_TAG_SEARCH_RESULT_ENTRY => {
                ProtocolOp::SearchResultEntry(SearchResultEntry::read_from(reader)?)
            }
            LDAP_TAG_SEARCH_RESULT_REFERENCE => {
                ProtocolOp::SearchResultReference(ops::read_search_reference(reader)?)
            }
            LDAP_TAG_SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(ops::read_result(reader)?),
            LDAP_TAG_UNBIND_REQUEST => {
                reader.read_null()?;
                ProtocolOp::UnbindRequest
            }
            _ => {
                return Err(Asn1Error::Malformed(format!(
                    "unsupported LDAP operation tag: 0x{:02X}",
                    tag
                )))
            }
        };
        Ok(op)
    }
}

// LDAP Message structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Vec<Control>,
}

impl LdapMessage {
    pub fn new(message_id: i32, protocol_op: ProtocolOp) -> Self {
        Self {
            message_id,
            protocol_op,
            controls: Vec::new(),
        }
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }

    /// LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    pub fn write_to(&self, buf: &mut Asn1Buffer) {
        let mut seq = buf.begin_sequence();
        seq.add_integer(self.message_id);
        self.protocol_op.write_to(&mut seq);
        if !self.controls.is_empty() {
            let mut controls = seq.begin_sequence_with_type(LDAP_CONTEXT_CONTROLS);
            for control in &self.controls {
                control.write_to(&mut controls);
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Asn1Buffer::new();
        self.write_to(&mut buf);
        buf.into_vec()
    }

    /// Reads the next message. `Ok(None)` when the stream ended cleanly
    /// between messages.
    pub fn read_from<R: Read>(reader: &mut Asn1StreamReader<R>) -> Result<Option<Self>, Asn1Error> {
        let Some(seq) = reader.begin_sequence()? else {
            return Ok(None);
        };
        if seq.tag() != crate::ber::UNIVERSAL_SEQUENCE_TYPE {
            return Err(Asn1Error::UnexpectedType {
                expected: crate::ber::UNIVERSAL_SEQUENCE_TYPE,
                found: seq.tag(),
            });
        }
        let message_id = reader.read_integer()?;
        let protocol_op = ProtocolOp::read_from(reader)?;

        let mut controls = Vec::new();
        if seq.has_more_elements(reader)? {
            match reader.peek()? {
                Some(LDAP_CONTEXT_CONTROLS) => {
                    let list = reader.begin_required_sequence()?;
                    while list.has_more_elements(reader)? {
                        controls.push(Control::read_from(reader)?);
                    }
                }
                Some(other) => {
                    return Err(Asn1Error::Malformed(format!(
                        "unexpected element 0x{:02X} after the protocol op",
                        other
                    )))
                }
                None => return Err(Asn1Error::Truncated("controls")),
            }
        }
        if seq.has_more_elements(reader)? {
            return Err(Asn1Error::Malformed(
                "trailing data inside LDAP message".into(),
            ));
        }

        Ok(Some(Self {
            message_id,
            protocol_op,
            controls,
        }))
    }

    /// Decodes a message from a byte slice that holds exactly one message.
    pub fn decode(bytes: &[u8]) -> Result<Self, Asn1Error> {
        Asn1Element::decode(bytes)?;
        let mut reader = Asn1StreamReader::new(bytes);
        Self::read_from(&mut reader)?.ok_or(Asn1Error::Truncated("message"))
    }
}

/// Response for a request that failed before it could be processed.
/// Returns `None` for requests that never get a response.
pub fn encode_error_response(
    message_id: i32,
    operation: OperationType,
    result: LdapResult,
) -> Option<LdapMessage> {
    let op = match operation {
        OperationType::Abandon | OperationType::Unbind => return None,
        OperationType::Add => ProtocolOp::AddResponse(result),
        OperationType::Bind => ProtocolOp::BindResponse(BindResponse {
            result,
            server_sasl_credentials: None,
        }),
        OperationType::Compare => ProtocolOp::CompareResponse(result),
        OperationType::Delete => ProtocolOp::DeleteResponse(result),
        OperationType::Extended => ProtocolOp::ExtendedResponse(ExtendedResponse::new(result)),
        OperationType::Modify => ProtocolOp::ModifyResponse(result),
        OperationType::ModifyDn => ProtocolOp::ModifyDnResponse(result),
        OperationType::Search => ProtocolOp::SearchResultDone(result),
    };
    Some(LdapMessage::new(message_id, op))
}

/// Unsolicited notice of disconnection (message ID 0).
pub fn notice_of_disconnection(result_code: ResultCode, message: &str) -> LdapMessage {
    let mut response = ExtendedResponse::new(LdapResult::new(result_code, message));
    response.oid = Some(NOTICE_OF_DISCONNECTION_OID.to_string());
    LdapMessage::new(0, ProtocolOp::ExtendedResponse(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_message_set() -> Vec<LdapMessage> {
        let search = SearchRequest {
            base_dn: "dc=example,dc=com".into(),
            scope: SearchScope::WholeSubtree,
            deref_aliases: 3,
            size_limit: 10,
            time_limit: 30,
            types_only: false,
            filter: Filter::And(vec![
                Filter::equality("objectClass", "person"),
                Filter::present("mail"),
            ]),
            attributes: vec!["cn".into(), "mail".into()],
        };
        let mut bind_response = BindResponse {
            result: LdapResult::success(),
            server_sasl_credentials: Some(vec![1, 2, 3]),
        };
        bind_response.result.diagnostic_message = "ok".into();

        vec![
            LdapMessage::new(1, ProtocolOp::BindRequest(BindRequest::simple("cn=admin", "secret"))),
            LdapMessage::new(
                2,
                ProtocolOp::BindRequest(BindRequest::sasl("PLAIN", Some(b"\0jdoe\0pw".to_vec()))),
            ),
            LdapMessage::new(3, ProtocolOp::BindResponse(bind_response)),
            LdapMessage::new(4, ProtocolOp::SearchRequest(search)).with_controls(vec![
                Control::new("1.2.840.113556.1.4.319", true, Some(vec![0x30, 0x05, 0x02, 0x01, 0x0A, 0x04, 0x00])),
                Control::new("2.16.840.1.113730.3.4.2", false, None),
            ]),
            LdapMessage::new(
                5,
                ProtocolOp::SearchResultEntry(SearchResultEntry {
                    dn: "cn=a,dc=example,dc=com".into(),
                    attributes: vec![Attribute::from_strings("cn", &["a", "A"])],
                }),
            ),
            LdapMessage::new(
                5,
                ProtocolOp::SearchResultReference(vec!["ldap://other/".into()]),
            ),
            LdapMessage::new(5, ProtocolOp::SearchResultDone(LdapResult::success())),
            LdapMessage::new(
                6,
                ProtocolOp::ModifyRequest(ModifyRequest {
                    dn: "cn=a,dc=example,dc=com".into(),
                    changes: vec![
                        Modification {
                            operation: ModificationType::Replace,
                            attribute: Attribute::from_strings("sn", &["b"]),
                        },
                        Modification {
                            operation: ModificationType::Delete,
                            attribute: Attribute::new("mail", vec![]),
                        },
                    ],
                }),
            ),
            LdapMessage::new(
                7,
                ProtocolOp::AddRequest(AddRequest {
                    dn: "cn=ж,dc=example,dc=com".into(),
                    attributes: vec![Attribute::from_strings("objectClass", &["top", "person"])],
                }),
            ),
            LdapMessage::new(8, ProtocolOp::DeleteRequest(DeleteRequest { dn: "cn=a".into() })),
            LdapMessage::new(
                9,
                ProtocolOp::ModifyDnRequest(ModifyDnRequest {
                    dn: "cn=a,o=x".into(),
                    new_rdn: "cn=b".into(),
                    delete_old_rdn: false,
                    new_superior: Some("ou=y,o=x".into()),
                }),
            ),
            LdapMessage::new(
                10,
                ProtocolOp::CompareRequest(CompareRequest {
                    dn: "cn=a,o=x".into(),
                    attribute: "cn".into(),
                    value: b"a".to_vec(),
                }),
            ),
            LdapMessage::new(11, ProtocolOp::AbandonRequest(4)),
            LdapMessage::new(
                12,
                ProtocolOp::ExtendedRequest(ExtendedRequest::new("1.3.6.1.4.1.4203.1.11.3", None)),
            ),
            notice_of_disconnection(ResultCode::PROTOCOL_ERROR, "bye"),
            LdapMessage::new(
                13,
                ProtocolOp::IntermediateResponse(IntermediateResponse {
                    oid: Some("1.2.3".into()),
                    value: Some(vec![0]),
                }),
            ),
            LdapMessage::new(14, ProtocolOp::ModifyDnResponse(LdapResult::new(ResultCode::NO_SUCH_OBJECT, "missing").with_matched_dn("o=x"))),
            LdapMessage::new(15, ProtocolOp::UnbindRequest),
        ]
    }

    #[test]
    fn test_decode_encode_decode_idempotent() {
        for message in full_message_set() {
            let bytes = message.encode();
            let first = LdapMessage::decode(&bytes).unwrap();
            assert_eq!(first, message);
            let second = LdapMessage::decode(&first.encode()).unwrap();
            assert_eq!(second, first);
            assert_eq!(first.encode(), bytes);
        }
    }

    #[test]
    fn test_stream_of_messages_then_clean_eof() {
        let messages = full_message_set();
        let mut buf = Asn1Buffer::new();
        for message in &messages {
            message.write_to(&mut buf);
        }
        let mut reader = Asn1StreamReader::new(buf.as_bytes());
        let mut decoded = Vec::new();
        while let Some(message) = LdapMessage::read_from(&mut reader).unwrap() {
            decoded.push(message);
        }
        assert_eq!(decoded, messages);
        assert!(reader.is_closed());
    }

    #[test]
    fn test_unbind_wire_bytes() {
        let bytes = LdapMessage::new(3, ProtocolOp::UnbindRequest).encode();
        assert_eq!(bytes, vec![0x30, 0x05, 0x02, 0x01, 0x03, 0x42, 0x00]);
    }

    #[test]
    fn test_control_criticality_default() {
        // Control with criticality omitted and a value present.
        let bytes = [
            0x30, 0x10, 0x02, 0x01, 0x01, 0x42, 0x00, 0xA0, 0x09, 0x30, 0x07, 0x04, 0x01, b'1',
            0x04, 0x02, 0xAB, 0xCD,
        ];
        let message = LdapMessage::decode(&bytes[..]).unwrap();
        assert_eq!(
            message.controls,
            vec![Control::new("1", false, Some(vec![0xAB, 0xCD]))]
        );
    }

    #[test]
    fn test_unsupported_op_tag() {
        let bytes = [0x30, 0x05, 0x02, 0x01, 0x01, 0x5F, 0x00];
        assert!(matches!(
            LdapMessage::decode(&bytes),
            Err(Asn1Error::Malformed(_))
        ));
    }

    #[test]
    fn test_error_response_kinds() {
        let result = LdapResult::new(ResultCode::UNWILLING_TO_PERFORM, "no");
        assert!(encode_error_response(1, OperationType::Unbind, result.clone()).is_none());
        assert!(encode_error_response(1, OperationType::Abandon, result.clone()).is_none());
        let message = encode_error_response(7, OperationType::Search, result).unwrap();
        assert_eq!(message.message_id, 7);
        assert_eq!(message.protocol_op.tag(), LDAP_TAG_SEARCH_RESULT_DONE);
    }

    #[test]
    fn test_operation_type_of_requests() {
        let op = ProtocolOp::DeleteRequest(DeleteRequest { dn: String::new() });
        assert_eq!(op.operation_type(), Some(OperationType::Delete));
        assert_eq!(ProtocolOp::SearchResultDone(LdapResult::success()).operation_type(), None);
        assert_eq!(OperationType::ModifyDn.to_string(), "modify_dn");
    }
}
