// Request control admission: per-operation gating, value decoding and
// cross-control checks, plus the response controls the server attaches

use std::collections::HashMap;

use tracing::debug;

use crate::ber::{Asn1Buffer, Asn1Error, Asn1StreamReader};
use crate::error::AdmissionError;
use crate::ldap_protocol::{Control, Filter, OperationType, SearchResultEntry};

pub const MANAGE_DSA_IT_OID: &str = "2.16.840.1.113730.3.4.2";
pub const SUBTREE_DELETE_OID: &str = "1.2.840.113556.1.4.805";
pub const PROXIED_AUTH_V1_OID: &str = "2.16.840.1.113730.3.4.12";
pub const PROXIED_AUTH_V2_OID: &str = "2.16.840.1.113730.3.4.18";
pub const SIMPLE_PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";
pub const SERVER_SIDE_SORT_REQUEST_OID: &str = "1.2.840.113556.1.4.473";
pub const SERVER_SIDE_SORT_RESPONSE_OID: &str = "1.2.840.113556.1.4.474";
pub const VIRTUAL_LIST_VIEW_REQUEST_OID: &str = "2.16.840.1.113730.3.4.9";
pub const VIRTUAL_LIST_VIEW_RESPONSE_OID: &str = "2.16.840.1.113730.3.4.10";
pub const SUBENTRIES_OID: &str = "1.3.6.1.4.1.7628.5.101.1";
pub const RFC3672_SUBENTRIES_OID: &str = "1.3.6.1.4.1.4203.1.10.1";
pub const PRE_READ_OID: &str = "1.3.6.1.1.13.1";
pub const POST_READ_OID: &str = "1.3.6.1.1.13.2";
pub const AUTHORIZATION_IDENTITY_REQUEST_OID: &str = "2.16.840.1.113730.3.4.16";
pub const AUTHORIZATION_IDENTITY_RESPONSE_OID: &str = "2.16.840.1.113730.3.4.15";
pub const ASSERTION_OID: &str = "1.3.6.1.1.12";
pub const PERMISSIVE_MODIFY_OID: &str = "1.2.840.113556.1.4.1413";
pub const DONT_USE_COPY_OID: &str = "1.3.6.1.1.22";
pub const NO_OP_OID: &str = "1.3.6.1.4.1.4203.1.10.2";
/// Marks operations issued by the server itself; exempt from every admission rule.
pub const INTERNAL_OPERATION_OID: &str = "1.3.6.1.4.1.30221.2.5.18";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub attribute: String,
    pub ordering_rule: Option<String>,
    pub reverse: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlvTarget {
    ByOffset { offset: i32, content_count: i32 },
    GreaterOrEqual(Vec<u8>),
}

/// A request control decoded according to its OID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestControl {
    ManageDsaIt,
    SubtreeDelete,
    ProxiedAuthV1 { proxy_dn: String },
    ProxiedAuthV2 { authzid: String },
    SimplePagedResults { size: i32, cookie: Vec<u8> },
    ServerSideSort(Vec<SortKey>),
    VirtualListView {
        before_count: i32,
        after_count: i32,
        target: VlvTarget,
        context_id: Option<Vec<u8>>,
    },
    Subentries,
    Rfc3672Subentries { visibility: bool },
    PreRead(Vec<String>),
    PostRead(Vec<String>),
    AuthorizationIdentity,
    Assertion(Filter),
    PermissiveModify,
    DontUseCopy,
    NoOp,
    /// Internal-operation marker, kept verbatim.
    InternalOperation,
}

impl RequestControl {
    pub fn oid(&self) -> &'static str {
        match self {
            RequestControl::ManageDsaIt => MANAGE_DSA_IT_OID,
            RequestControl::SubtreeDelete => SUBTREE_DELETE_OID,
            RequestControl::ProxiedAuthV1 { .. } => PROXIED_AUTH_V1_OID,
            RequestControl::ProxiedAuthV2 { .. } => PROXIED_AUTH_V2_OID,
            RequestControl::SimplePagedResults { .. } => SIMPLE_PAGED_RESULTS_OID,
            RequestControl::ServerSideSort(_) => SERVER_SIDE_SORT_REQUEST_OID,
            RequestControl::VirtualListView { .. } => VIRTUAL_LIST_VIEW_REQUEST_OID,
            RequestControl::Subentries => SUBENTRIES_OID,
            RequestControl::Rfc3672Subentries { .. } => RFC3672_SUBENTRIES_OID,
            RequestControl::PreRead(_) => PRE_READ_OID,
            RequestControl::PostRead(_) => POST_READ_OID,
            RequestControl::AuthorizationIdentity => AUTHORIZATION_IDENTITY_REQUEST_OID,
            RequestControl::Assertion(_) => ASSERTION_OID,
            RequestControl::PermissiveModify => PERMISSIVE_MODIFY_OID,
            RequestControl::DontUseCopy => DONT_USE_COPY_OID,
            RequestControl::NoOp => NO_OP_OID,
            RequestControl::InternalOperation => INTERNAL_OPERATION_OID,
        }
    }

    /// Encodes the control as a client would send it.
    pub fn to_control(&self, critical: bool) -> Control {
        let value = match self {
            RequestControl::ProxiedAuthV1 { proxy_dn } => {
                let mut buf = Asn1Buffer::new();
                buf.begin_sequence().add_string(proxy_dn);
                Some(buf.into_vec())
            }
            RequestControl::ProxiedAuthV2 { authzid } => Some(authzid.as_bytes().to_vec()),
            RequestControl::SimplePagedResults { size, cookie } => {
                let mut buf = Asn1Buffer::new();
                {
                    let mut seq = buf.begin_sequence();
                    seq.add_integer(*size);
                    seq.add_octet_string(cookie);
                }
                Some(buf.into_vec())
            }
            RequestControl::ServerSideSort(keys) => {
                let mut buf = Asn1Buffer::new();
                {
                    let mut list = buf.begin_sequence();
                    for key in keys {
                        let mut item = list.begin_sequence();
                        item.add_string(&key.attribute);
                        if let Some(rule) = &key.ordering_rule {
                            item.add_string_with_type(SORT_ORDERING_RULE, rule);
                        }
                        if key.reverse {
                            item.add_boolean_with_type(SORT_REVERSE_ORDER, true);
                        }
                    }
                }
                Some(buf.into_vec())
            }
            RequestControl::VirtualListView {
                before_count,
                after_count,
                target,
                context_id,
            } => {
                let mut buf = Asn1Buffer::new();
                {
                    let mut seq = buf.begin_sequence();
                    seq.add_integer(*before_count);
                    seq.add_integer(*after_count);
                    match target {
                        VlvTarget::ByOffset {
                            offset,
                            content_count,
                        } => {
                            let mut by_offset = seq.begin_sequence_with_type(VLV_BY_OFFSET);
                            by_offset.add_integer(*offset);
                            by_offset.add_integer(*content_count);
                        }
                        VlvTarget::GreaterOrEqual(value) => {
                            seq.add_octet_string_with_type(VLV_GREATER_OR_EQUAL, value);
                        }
                    }
                    if let Some(context_id) = context_id {
                        seq.add_octet_string(context_id);
                    }
                }
                Some(buf.into_vec())
            }
            RequestControl::Rfc3672Subentries { visibility } => {
                let mut buf = Asn1Buffer::new();
                buf.add_boolean(*visibility);
                Some(buf.into_vec())
            }
            RequestControl::PreRead(attributes) | RequestControl::PostRead(attributes) => {
                let mut buf = Asn1Buffer::new();
                {
                    let mut seq = buf.begin_sequence();
                    for attribute in attributes {
                        seq.add_string(attribute);
                    }
                }
                Some(buf.into_vec())
            }
            RequestControl::Assertion(filter) => {
                let mut buf = Asn1Buffer::new();
                filter.write_to(&mut buf);
                Some(buf.into_vec())
            }
            _ => None,
        };
        Control::new(self.oid(), critical, value)
    }
}

const SORT_ORDERING_RULE: u8 = 0x80;
const SORT_REVERSE_ORDER: u8 = 0x81;
const VLV_BY_OFFSET: u8 = 0xA0;
const VLV_GREATER_OR_EQUAL: u8 = 0x81;

type Decoder = fn(&Control) -> Result<RequestControl, Asn1Error>;

/// One row of the admission table.
struct ControlRule {
    oid: &'static str,
    operations: &'static [OperationType],
    decode: Decoder,
}

use crate::ldap_protocol::OperationType::{Add, Bind, Compare, Delete, Modify, ModifyDn, Search};

const UPDATE_AND_READ: &[OperationType] = &[Add, Compare, Delete, Modify, ModifyDn, Search];

static CONTROL_RULES: &[ControlRule] = &[
    ControlRule {
        oid: MANAGE_DSA_IT_OID,
        operations: UPDATE_AND_READ,
        decode: |c| no_value(c, RequestControl::ManageDsaIt),
    },
    ControlRule {
        oid: SUBTREE_DELETE_OID,
        operations: &[Delete],
        decode: |c| no_value(c, RequestControl::SubtreeDelete),
    },
    ControlRule {
        oid: PROXIED_AUTH_V1_OID,
        operations: UPDATE_AND_READ,
        decode: decode_proxied_auth_v1,
    },
    ControlRule {
        oid: PROXIED_AUTH_V2_OID,
        operations: UPDATE_AND_READ,
        decode: decode_proxied_auth_v2,
    },
    ControlRule {
        oid: SIMPLE_PAGED_RESULTS_OID,
        operations: &[Search],
        decode: decode_paged_results,
    },
    ControlRule {
        oid: SERVER_SIDE_SORT_REQUEST_OID,
        operations: &[Search],
        decode: decode_server_side_sort,
    },
    ControlRule {
        oid: VIRTUAL_LIST_VIEW_REQUEST_OID,
        operations: &[Search],
        decode: decode_virtual_list_view,
    },
    ControlRule {
        oid: SUBENTRIES_OID,
        operations: &[Search],
        decode: |c| no_value(c, RequestControl::Subentries),
    },
    ControlRule {
        oid: RFC3672_SUBENTRIES_OID,
        operations: &[Search],
        decode: decode_rfc3672_subentries,
    },
    ControlRule {
        oid: POST_READ_OID,
        operations: &[Add, Modify, ModifyDn],
        decode: |c| decode_attribute_list(c).map(RequestControl::PostRead),
    },
    ControlRule {
        oid: PRE_READ_OID,
        operations: &[Delete, Modify, ModifyDn],
        decode: |c| decode_attribute_list(c).map(RequestControl::PreRead),
    },
    ControlRule {
        oid: AUTHORIZATION_IDENTITY_REQUEST_OID,
        operations: &[Bind],
        decode: |c| no_value(c, RequestControl::AuthorizationIdentity),
    },
    ControlRule {
        oid: ASSERTION_OID,
        operations: UPDATE_AND_READ,
        decode: decode_assertion,
    },
    ControlRule {
        oid: PERMISSIVE_MODIFY_OID,
        operations: &[Modify],
        decode: |c| no_value(c, RequestControl::PermissiveModify),
    },
    ControlRule {
        oid: DONT_USE_COPY_OID,
        operations: &[Compare, Search],
        decode: |c| no_value(c, RequestControl::DontUseCopy),
    },
    ControlRule {
        oid: NO_OP_OID,
        operations: &[Add, Delete, Modify, ModifyDn],
        decode: |c| no_value(c, RequestControl::NoOp),
    },
];

fn find_rule(oid: &str) -> Option<&'static ControlRule> {
    CONTROL_RULES.iter().find(|rule| rule.oid == oid)
}

/// OIDs of every request control the server understands, for the root DSE.
pub fn supported_control_oids() -> Vec<&'static str> {
    let mut oids: Vec<&'static str> = CONTROL_RULES.iter().map(|rule| rule.oid).collect();
    oids.push(INTERNAL_OPERATION_OID);
    oids
}

fn no_value(control: &Control, decoded: RequestControl) -> Result<RequestControl, Asn1Error> {
    match &control.value {
        None => Ok(decoded),
        Some(_) => Err(Asn1Error::Malformed("control must not have a value".into())),
    }
}

fn required_value(control: &Control) -> Result<&[u8], Asn1Error> {
    control
        .value
        .as_deref()
        .ok_or_else(|| Asn1Error::Malformed("control requires a value".into()))
}

fn value_reader(control: &Control) -> Result<Asn1StreamReader<&[u8]>, Asn1Error> {
    Ok(Asn1StreamReader::new(required_value(control)?))
}

/// Fails if anything follows the decoded value.
fn expect_end(reader: &mut Asn1StreamReader<&[u8]>) -> Result<(), Asn1Error> {
    match reader.read_element()? {
        None => Ok(()),
        Some(_) => Err(Asn1Error::Malformed("trailing data in control value".into())),
    }
}

fn decode_proxied_auth_v1(control: &Control) -> Result<RequestControl, Asn1Error> {
    let mut reader = value_reader(control)?;
    reader.begin_required_sequence()?;
    let proxy_dn = reader.read_string()?;
    expect_end(&mut reader)?;
    Ok(RequestControl::ProxiedAuthV1 { proxy_dn })
}

fn decode_proxied_auth_v2(control: &Control) -> Result<RequestControl, Asn1Error> {
    let authzid = String::from_utf8(required_value(control)?.to_vec())
        .map_err(|_| Asn1Error::InvalidUtf8)?;
    Ok(RequestControl::ProxiedAuthV2 { authzid })
}

fn decode_paged_results(control: &Control) -> Result<RequestControl, Asn1Error> {
    let mut reader = value_reader(control)?;
    reader.begin_required_sequence()?;
    let size = reader.read_integer()?;
    let cookie = reader.read_bytes()?;
    expect_end(&mut reader)?;
    Ok(RequestControl::SimplePagedResults { size, cookie })
}

fn decode_server_side_sort(control: &Control) -> Result<RequestControl, Asn1Error> {
    let mut reader = value_reader(control)?;
    let list = reader.begin_required_sequence()?;
    let mut keys = Vec::new();
    while list.has_more_elements(&reader)? {
        let item = reader.begin_required_sequence()?;
        let mut key = SortKey {
            attribute: reader.read_string()?,
            ordering_rule: None,
            reverse: false,
        };
        while item.has_more_elements(&reader)? {
            match reader.peek()? {
                Some(SORT_ORDERING_RULE) => key.ordering_rule = Some(reader.read_string()?),
                Some(SORT_REVERSE_ORDER) => key.reverse = reader.read_boolean()?,
                _ => return Err(Asn1Error::Malformed("invalid sort key element".into())),
            }
        }
        keys.push(key);
    }
    if keys.is_empty() {
        return Err(Asn1Error::Malformed("sort request has no sort keys".into()));
    }
    expect_end(&mut reader)?;
    Ok(RequestControl::ServerSideSort(keys))
}

fn decode_virtual_list_view(control: &Control) -> Result<RequestControl, Asn1Error> {
    let mut reader = value_reader(control)?;
    let seq = reader.begin_required_sequence()?;
    let before_count = reader.read_integer()?;
    let after_count = reader.read_integer()?;
    let target = match reader.peek()? {
        Some(VLV_BY_OFFSET) => {
            reader.begin_required_sequence()?;
            VlvTarget::ByOffset {
                offset: reader.read_integer()?,
                content_count: reader.read_integer()?,
            }
        }
        Some(VLV_GREATER_OR_EQUAL) => VlvTarget::GreaterOrEqual(reader.read_bytes()?),
        _ => return Err(Asn1Error::Malformed("invalid virtual list view target".into())),
    };
    let context_id = if seq.has_more_elements(&reader)? {
        Some(reader.read_bytes()?)
    } else {
        None
    };
    expect_end(&mut reader)?;
    Ok(RequestControl::VirtualListView {
        before_count,
        after_count,
        target,
        context_id,
    })
}

fn decode_rfc3672_subentries(control: &Control) -> Result<RequestControl, Asn1Error> {
    let mut reader = value_reader(control)?;
    let visibility = reader.read_boolean()?;
    expect_end(&mut reader)?;
    Ok(RequestControl::Rfc3672Subentries { visibility })
}

fn decode_attribute_list(control: &Control) -> Result<Vec<String>, Asn1Error> {
    let mut reader = value_reader(control)?;
    let seq = reader.begin_required_sequence()?;
    let mut attributes = Vec::new();
    while seq.has_more_elements(&reader)? {
        attributes.push(reader.read_string()?);
    }
    expect_end(&mut reader)?;
    Ok(attributes)
}

fn decode_assertion(control: &Control) -> Result<RequestControl, Asn1Error> {
    let mut reader = value_reader(control)?;
    let filter = Filter::read_from(&mut reader)?;
    expect_end(&mut reader)?;
    Ok(RequestControl::Assertion(filter))
}

/// Controls that passed admission, keyed by OID.
#[derive(Debug, Clone, Default)]
pub struct AdmittedControls {
    controls: HashMap<String, (Control, RequestControl)>,
}

impl AdmittedControls {
    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }

    pub fn contains(&self, oid: &str) -> bool {
        self.controls.contains_key(oid)
    }

    pub fn get(&self, oid: &str) -> Option<&RequestControl> {
        self.controls.get(oid).map(|(_, decoded)| decoded)
    }

    /// The control as received on the wire.
    pub fn raw(&self, oid: &str) -> Option<&Control> {
        self.controls.get(oid).map(|(raw, _)| raw)
    }

    pub fn oids(&self) -> impl Iterator<Item = &str> {
        self.controls.keys().map(String::as_str)
    }

    pub fn assertion(&self) -> Option<&Filter> {
        match self.get(ASSERTION_OID) {
            Some(RequestControl::Assertion(filter)) => Some(filter),
            _ => None,
        }
    }

    pub fn pre_read(&self) -> Option<&[String]> {
        match self.get(PRE_READ_OID) {
            Some(RequestControl::PreRead(attributes)) => Some(attributes),
            _ => None,
        }
    }

    pub fn post_read(&self) -> Option<&[String]> {
        match self.get(POST_READ_OID) {
            Some(RequestControl::PostRead(attributes)) => Some(attributes),
            _ => None,
        }
    }

    pub fn sort_keys(&self) -> Option<&[SortKey]> {
        match self.get(SERVER_SIDE_SORT_REQUEST_OID) {
            Some(RequestControl::ServerSideSort(keys)) => Some(keys),
            _ => None,
        }
    }

    /// Page size and resume cookie.
    pub fn paged_results(&self) -> Option<(i32, &[u8])> {
        match self.get(SIMPLE_PAGED_RESULTS_OID) {
            Some(RequestControl::SimplePagedResults { size, cookie }) => Some((*size, cookie)),
            _ => None,
        }
    }

    /// Before count, after count and target.
    pub fn virtual_list_view(&self) -> Option<(i32, i32, &VlvTarget)> {
        match self.get(VIRTUAL_LIST_VIEW_REQUEST_OID) {
            Some(RequestControl::VirtualListView {
                before_count,
                after_count,
                target,
                ..
            }) => Some((*before_count, *after_count, target)),
            _ => None,
        }
    }

    pub fn is_no_op(&self) -> bool {
        self.contains(NO_OP_OID)
    }

    pub fn is_permissive_modify(&self) -> bool {
        self.contains(PERMISSIVE_MODIFY_OID)
    }

    pub fn is_subtree_delete(&self) -> bool {
        self.contains(SUBTREE_DELETE_OID)
    }

    pub fn wants_authorization_identity(&self) -> bool {
        self.contains(AUTHORIZATION_IDENTITY_REQUEST_OID)
    }
}

/// Validates the controls of one request against its operation type.
///
/// Controls that apply to the operation are decoded and returned keyed by
/// OID. A control that does not apply (or is unknown) is an error when
/// critical and silently dropped otherwise. The internal-operation control
/// is always accepted.
pub fn admit(
    operation: OperationType,
    controls: &[Control],
) -> Result<AdmittedControls, AdmissionError> {
    let mut admitted = AdmittedControls::default();

    for control in controls {
        if control.oid == INTERNAL_OPERATION_OID {
            admitted.controls.insert(
                control.oid.clone(),
                (control.clone(), RequestControl::InternalOperation),
            );
            continue;
        }

        let rule = match find_rule(&control.oid) {
            Some(rule) if rule.operations.contains(&operation) => rule,
            _ => {
                if control.critical {
                    return Err(AdmissionError::UnavailableCriticalExtension {
                        oid: control.oid.clone(),
                        operation,
                    });
                }
                debug!(oid = %control.oid, %operation, "dropping non-critical control");
                continue;
            }
        };

        let decoded = (rule.decode)(control).map_err(|e| AdmissionError::MalformedControl {
            oid: control.oid.clone(),
            message: e.to_string(),
        })?;

        if admitted.controls.contains_key(&control.oid) {
            return Err(AdmissionError::ConstraintViolation(format!(
                "the request contains multiple {} controls",
                control.oid
            )));
        }
        admitted
            .controls
            .insert(control.oid.clone(), (control.clone(), decoded));
    }

    if admitted.contains(PROXIED_AUTH_V1_OID) && admitted.contains(PROXIED_AUTH_V2_OID) {
        return Err(AdmissionError::ConstraintViolation(
            "the request cannot include both the proxied authorization v1 and v2 controls".into(),
        ));
    }
    if admitted.contains(VIRTUAL_LIST_VIEW_REQUEST_OID) {
        if admitted.contains(SIMPLE_PAGED_RESULTS_OID) {
            return Err(AdmissionError::ConstraintViolation(
                "the request cannot include both the virtual list view and simple paged results controls"
                    .into(),
            ));
        }
        if !admitted.contains(SERVER_SIDE_SORT_REQUEST_OID) {
            return Err(AdmissionError::SortControlMissing);
        }
    }

    Ok(admitted)
}

/// `dn:<dn>` for a bound identity, empty for anonymous.
pub fn authorization_identity_response(dn: &str) -> Control {
    let value = if dn.is_empty() {
        Vec::new()
    } else {
        format!("dn:{}", dn).into_bytes()
    };
    Control::new(AUTHORIZATION_IDENTITY_RESPONSE_OID, false, Some(value))
}

/// Pre-read or post-read response carrying an entry snapshot.
pub fn read_entry_response(oid: &str, entry: &SearchResultEntry) -> Control {
    let mut buf = Asn1Buffer::new();
    entry.write_to(&mut buf);
    Control::new(oid, false, Some(buf.into_vec()))
}

pub fn paged_results_response(size_estimate: i32, cookie: &[u8]) -> Control {
    let mut buf = Asn1Buffer::new();
    {
        let mut seq = buf.begin_sequence();
        seq.add_integer(size_estimate);
        seq.add_octet_string(cookie);
    }
    Control::new(SIMPLE_PAGED_RESULTS_OID, false, Some(buf.into_vec()))
}

pub fn server_side_sort_response(result_code: i32) -> Control {
    let mut buf = Asn1Buffer::new();
    buf.begin_sequence().add_enumerated(result_code);
    Control::new(SERVER_SIDE_SORT_RESPONSE_OID, false, Some(buf.into_vec()))
}

pub fn virtual_list_view_response(
    target_position: i32,
    content_count: i32,
    result_code: i32,
) -> Control {
    let mut buf = Asn1Buffer::new();
    {
        let mut seq = buf.begin_sequence();
        seq.add_integer(target_position);
        seq.add_integer(content_count);
        seq.add_enumerated(result_code);
    }
    Control::new(VIRTUAL_LIST_VIEW_RESPONSE_OID, false, Some(buf.into_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap_protocol::ResultCode;

    fn sample(oid: &str) -> RequestControl {
        match oid {
            MANAGE_DSA_IT_OID => RequestControl::ManageDsaIt,
            SUBTREE_DELETE_OID => RequestControl::SubtreeDelete,
            PROXIED_AUTH_V1_OID => RequestControl::ProxiedAuthV1 {
                proxy_dn: "cn=proxy".into(),
            },
            PROXIED_AUTH_V2_OID => RequestControl::ProxiedAuthV2 {
                authzid: "dn:cn=proxy".into(),
            },
            SIMPLE_PAGED_RESULTS_OID => RequestControl::SimplePagedResults {
                size: 10,
                cookie: Vec::new(),
            },
            SERVER_SIDE_SORT_REQUEST_OID => RequestControl::ServerSideSort(vec![SortKey {
                attribute: "cn".into(),
                ordering_rule: None,
                reverse: true,
            }]),
            VIRTUAL_LIST_VIEW_REQUEST_OID => RequestControl::VirtualListView {
                before_count: 0,
                after_count: 5,
                target: VlvTarget::ByOffset {
                    offset: 1,
                    content_count: 0,
                },
                context_id: None,
            },
            SUBENTRIES_OID => RequestControl::Subentries,
            RFC3672_SUBENTRIES_OID => RequestControl::Rfc3672Subentries { visibility: true },
            PRE_READ_OID => RequestControl::PreRead(vec!["cn".into()]),
            POST_READ_OID => RequestControl::PostRead(vec!["*".into()]),
            AUTHORIZATION_IDENTITY_REQUEST_OID => RequestControl::AuthorizationIdentity,
            ASSERTION_OID => RequestControl::Assertion(Filter::present("cn")),
            PERMISSIVE_MODIFY_OID => RequestControl::PermissiveModify,
            DONT_USE_COPY_OID => RequestControl::DontUseCopy,
            NO_OP_OID => RequestControl::NoOp,
            other => panic!("no sample for {}", other),
        }
    }

    /// Expected applicability of each control, per operation type.
    fn expected_operations(oid: &str) -> Vec<OperationType> {
        match oid {
            MANAGE_DSA_IT_OID | PROXIED_AUTH_V1_OID | PROXIED_AUTH_V2_OID | ASSERTION_OID => {
                vec![Add, Compare, Delete, Modify, ModifyDn, Search]
            }
            SUBTREE_DELETE_OID => vec![Delete],
            SIMPLE_PAGED_RESULTS_OID
            | SERVER_SIDE_SORT_REQUEST_OID
            | VIRTUAL_LIST_VIEW_REQUEST_OID
            | SUBENTRIES_OID
            | RFC3672_SUBENTRIES_OID => vec![Search],
            POST_READ_OID => vec![Add, Modify, ModifyDn],
            PRE_READ_OID => vec![Delete, Modify, ModifyDn],
            AUTHORIZATION_IDENTITY_REQUEST_OID => vec![Bind],
            PERMISSIVE_MODIFY_OID => vec![Modify],
            DONT_USE_COPY_OID => vec![Compare, Search],
            NO_OP_OID => vec![Add, Delete, Modify, ModifyDn],
            other => panic!("unexpected oid {}", other),
        }
    }

    /// Adds the sort control a VLV control depends on.
    fn with_prerequisites(oid: &str, control: Control) -> Vec<Control> {
        let mut controls = vec![control];
        if oid == VIRTUAL_LIST_VIEW_REQUEST_OID {
            controls.push(sample(SERVER_SIDE_SORT_REQUEST_OID).to_control(false));
        }
        controls
    }

    #[test]
    fn test_admission_matrix() {
        for oid in supported_control_oids() {
            if oid == INTERNAL_OPERATION_OID {
                continue;
            }
            let allowed = expected_operations(oid);
            for operation in OperationType::ALL {
                let applies = allowed.contains(&operation);

                let critical = with_prerequisites(oid, sample(oid).to_control(true));
                let outcome = admit(operation, &critical);
                if applies {
                    let admitted = outcome.unwrap_or_else(|e| panic!("{} on {}: {}", oid, operation, e));
                    assert_eq!(admitted.get(oid), Some(&sample(oid)), "{} on {}", oid, operation);
                } else {
                    let err = outcome.unwrap_err();
                    assert_eq!(
                        err.result_code(),
                        ResultCode::UNAVAILABLE_CRITICAL_EXTENSION,
                        "{} on {}",
                        oid,
                        operation
                    );
                }

                let non_critical = vec![sample(oid).to_control(false)];
                if !applies {
                    let admitted = admit(operation, &non_critical).unwrap();
                    assert!(!admitted.contains(oid), "{} on {}", oid, operation);
                }
            }
        }
    }

    #[test]
    fn test_unknown_control() {
        let unknown = Control::new("1.2.3.4", false, Some(vec![1, 2, 3]));
        assert!(admit(Search, &[unknown]).unwrap().is_empty());
        let unknown = Control::new("1.2.3.4", true, None);
        assert!(matches!(
            admit(Search, &[unknown]),
            Err(AdmissionError::UnavailableCriticalExtension { .. })
        ));
    }

    #[test]
    fn test_duplicate_control_is_constraint_violation() {
        let control = sample(MANAGE_DSA_IT_OID).to_control(false);
        let err = admit(Modify, &[control.clone(), control]).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::CONSTRAINT_VIOLATION);
    }

    #[test]
    fn test_internal_operation_control_exempt() {
        let internal = Control::new(INTERNAL_OPERATION_OID, true, Some(b"anything".to_vec()));
        for operation in OperationType::ALL {
            let admitted = admit(operation, &[internal.clone(), internal.clone()]).unwrap();
            assert_eq!(admitted.get(INTERNAL_OPERATION_OID), Some(&RequestControl::InternalOperation));
            assert_eq!(admitted.raw(INTERNAL_OPERATION_OID), Some(&internal));
        }
    }

    #[test]
    fn test_both_proxied_auth_versions_rejected() {
        let controls = vec![
            sample(PROXIED_AUTH_V1_OID).to_control(true),
            sample(PROXIED_AUTH_V2_OID).to_control(true),
        ];
        for operation in [Add, Compare, Delete, Modify, ModifyDn, Search] {
            let err = admit(operation, &controls).unwrap_err();
            assert_eq!(err.result_code(), ResultCode::CONSTRAINT_VIOLATION);
        }
    }

    #[test]
    fn test_vlv_without_sort_is_sort_control_missing() {
        for critical in [true, false] {
            let controls = vec![sample(VIRTUAL_LIST_VIEW_REQUEST_OID).to_control(critical)];
            assert_eq!(
                admit(Search, &controls).unwrap_err(),
                AdmissionError::SortControlMissing
            );
        }
    }

    #[test]
    fn test_vlv_with_paged_results_rejected() {
        let controls = vec![
            sample(VIRTUAL_LIST_VIEW_REQUEST_OID).to_control(true),
            sample(SERVER_SIDE_SORT_REQUEST_OID).to_control(true),
            sample(SIMPLE_PAGED_RESULTS_OID).to_control(true),
        ];
        let err = admit(Search, &controls).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::CONSTRAINT_VIOLATION);
    }

    #[test]
    fn test_malformed_value_is_protocol_error() {
        let bad = Control::new(SIMPLE_PAGED_RESULTS_OID, false, Some(vec![0x30, 0x05, 0x02]));
        let err = admit(Search, &[bad]).unwrap_err();
        assert!(matches!(err, AdmissionError::MalformedControl { .. }));
        assert_eq!(err.result_code(), ResultCode::PROTOCOL_ERROR);

        let valued = Control::new(MANAGE_DSA_IT_OID, false, Some(vec![0x05, 0x00]));
        assert!(admit(Search, &[valued]).is_err());
    }

    #[test]
    fn test_non_critical_drop_does_not_trigger_cross_checks() {
        // VLV on a modify is dropped, so no sort control is needed.
        let controls = vec![sample(VIRTUAL_LIST_VIEW_REQUEST_OID).to_control(false)];
        assert!(admit(Modify, &controls).unwrap().is_empty());
    }

    #[test]
    fn test_authorization_identity_response_value() {
        assert_eq!(
            authorization_identity_response("cn=a").value,
            Some(b"dn:cn=a".to_vec())
        );
        assert_eq!(authorization_identity_response("").value, Some(Vec::new()));
    }
}
