// LDAP result codes and the LDAPResult component shared by every response

use std::fmt;
use std::io::Read;

use crate::ber::{Asn1Buffer, Asn1Error, Asn1StreamReader, Asn1StreamReaderSequence};

/// LDAP result code. Kept as a raw integer so codes this server does not
/// name still round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);
    pub const OPERATIONS_ERROR: ResultCode = ResultCode(1);
    pub const PROTOCOL_ERROR: ResultCode = ResultCode(2);
    pub const TIME_LIMIT_EXCEEDED: ResultCode = ResultCode(3);
    pub const SIZE_LIMIT_EXCEEDED: ResultCode = ResultCode(4);
    pub const COMPARE_FALSE: ResultCode = ResultCode(5);
    pub const COMPARE_TRUE: ResultCode = ResultCode(6);
    pub const AUTH_METHOD_NOT_SUPPORTED: ResultCode = ResultCode(7);
    pub const STRONGER_AUTH_REQUIRED: ResultCode = ResultCode(8);
    pub const REFERRAL: ResultCode = ResultCode(10);
    pub const ADMIN_LIMIT_EXCEEDED: ResultCode = ResultCode(11);
    pub const UNAVAILABLE_CRITICAL_EXTENSION: ResultCode = ResultCode(12);
    pub const CONFIDENTIALITY_REQUIRED: ResultCode = ResultCode(13);
    pub const SASL_BIND_IN_PROGRESS: ResultCode = ResultCode(14);
    pub const NO_SUCH_ATTRIBUTE: ResultCode = ResultCode(16);
    pub const UNDEFINED_ATTRIBUTE_TYPE: ResultCode = ResultCode(17);
    pub const INAPPROPRIATE_MATCHING: ResultCode = ResultCode(18);
    pub const CONSTRAINT_VIOLATION: ResultCode = ResultCode(19);
    pub const ATTRIBUTE_OR_VALUE_EXISTS: ResultCode = ResultCode(20);
    pub const INVALID_ATTRIBUTE_SYNTAX: ResultCode = ResultCode(21);
    pub const NO_SUCH_OBJECT: ResultCode = ResultCode(32);
    pub const INVALID_DN_SYNTAX: ResultCode = ResultCode(34);
    pub const INAPPROPRIATE_AUTHENTICATION: ResultCode = ResultCode(48);
    pub const INVALID_CREDENTIALS: ResultCode = ResultCode(49);
    pub const INSUFFICIENT_ACCESS_RIGHTS: ResultCode = ResultCode(50);
    pub const BUSY: ResultCode = ResultCode(51);
    pub const UNAVAILABLE: ResultCode = ResultCode(52);
    pub const UNWILLING_TO_PERFORM: ResultCode = ResultCode(53);
    pub const SORT_CONTROL_MISSING: ResultCode = ResultCode(60);
    pub const OFFSET_RANGE_ERROR: ResultCode = ResultCode(61);
    pub const NAMING_VIOLATION: ResultCode = ResultCode(64);
    pub const OBJECT_CLASS_VIOLATION: ResultCode = ResultCode(65);
    pub const NOT_ALLOWED_ON_NONLEAF: ResultCode = ResultCode(66);
    pub const NOT_ALLOWED_ON_RDN: ResultCode = ResultCode(67);
    pub const ENTRY_ALREADY_EXISTS: ResultCode = ResultCode(68);
    pub const OTHER: ResultCode = ResultCode(80);
    pub const CANCELED: ResultCode = ResultCode(118);
    pub const NO_SUCH_OPERATION: ResultCode = ResultCode(119);
    pub const ASSERTION_FAILED: ResultCode = ResultCode(122);
    pub const AUTHORIZATION_DENIED: ResultCode = ResultCode(123);
    pub const NO_OPERATION: ResultCode = ResultCode(16654);

    pub fn name(&self) -> &'static str {
        match self.0 {
            0 => "success",
            1 => "operationsError",
            2 => "protocolError",
            3 => "timeLimitExceeded",
            4 => "sizeLimitExceeded",
            5 => "compareFalse",
            6 => "compareTrue",
            7 => "authMethodNotSupported",
            8 => "strongerAuthRequired",
            10 => "referral",
            11 => "adminLimitExceeded",
            12 => "unavailableCriticalExtension",
            13 => "confidentialityRequired",
            14 => "saslBindInProgress",
            16 => "noSuchAttribute",
            17 => "undefinedAttributeType",
            18 => "inappropriateMatching",
            19 => "constraintViolation",
            20 => "attributeOrValueExists",
            21 => "invalidAttributeSyntax",
            32 => "noSuchObject",
            34 => "invalidDNSyntax",
            48 => "inappropriateAuthentication",
            49 => "invalidCredentials",
            50 => "insufficientAccessRights",
            51 => "busy",
            52 => "unavailable",
            53 => "unwillingToPerform",
            60 => "sortControlMissing",
            61 => "offsetRangeError",
            64 => "namingViolation",
            65 => "objectClassViolation",
            66 => "notAllowedOnNonLeaf",
            67 => "notAllowedOnRDN",
            68 => "entryAlreadyExists",
            80 => "other",
            118 => "canceled",
            119 => "noSuchOperation",
            122 => "assertionFailed",
            123 => "authorizationDenied",
            16654 => "noOperation",
            _ => "unknown",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.0, 0 | 5 | 6 | 14)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// Context tag of the referral URIs inside an LDAPResult.
pub const LDAP_RESULT_REFERRAL_TAG: u8 = 0xA3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn new(result_code: ResultCode, diagnostic_message: impl Into<String>) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: diagnostic_message.into(),
            referrals: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::SUCCESS, "")
    }

    pub fn with_matched_dn(mut self, matched_dn: impl Into<String>) -> Self {
        self.matched_dn = matched_dn.into();
        self
    }

    /// Writes the LDAPResult components into an already opened sequence.
    pub(crate) fn write_components(&self, buf: &mut Asn1Buffer) {
        buf.add_enumerated(self.result_code.0);
        buf.add_string(&self.matched_dn);
        buf.add_string(&self.diagnostic_message);
        if !self.referrals.is_empty() {
            let mut refs = buf.begin_sequence_with_type(LDAP_RESULT_REFERRAL_TAG);
            for uri in &self.referrals {
                refs.add_string(uri);
            }
        }
    }

    /// Reads the LDAPResult components from an opened sequence, stopping
    /// before any response-specific trailing fields.
    pub(crate) fn read_components<R: Read>(
        reader: &mut Asn1StreamReader<R>,
        seq: &Asn1StreamReaderSequence,
    ) -> Result<Self, Asn1Error> {
        let result_code = ResultCode(reader.read_enumerated()?);
        let matched_dn = reader.read_string()?;
        let diagnostic_message = reader.read_string()?;
        let mut referrals = Vec::new();
        if seq.has_more_elements(reader)? && reader.peek()? == Some(LDAP_RESULT_REFERRAL_TAG) {
            let refs = reader.begin_required_sequence()?;
            while refs.has_more_elements(reader)? {
                referrals.push(reader.read_string()?);
            }
        }
        Ok(Self {
            result_code,
            matched_dn,
            diagnostic_message,
            referrals,
        })
    }
}
