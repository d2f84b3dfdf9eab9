// Error kinds reported to LDAP clients as structured results

use thiserror::Error;

use crate::ldap_protocol::{LdapResult, OperationType, ResultCode};

/// A request's control set was rejected. The operation fails; the
/// connection stays usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("critical control {oid} is not supported for {operation} operations")]
    UnavailableCriticalExtension {
        oid: String,
        operation: OperationType,
    },

    #[error("{0}")]
    ConstraintViolation(String),

    #[error("the virtual list view request control requires a server-side sort request control")]
    SortControlMissing,

    #[error("unable to decode the value of control {oid}: {message}")]
    MalformedControl { oid: String, message: String },
}

impl AdmissionError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            AdmissionError::UnavailableCriticalExtension { .. } => {
                ResultCode::UNAVAILABLE_CRITICAL_EXTENSION
            }
            AdmissionError::ConstraintViolation(_) => ResultCode::CONSTRAINT_VIOLATION,
            AdmissionError::SortControlMissing => ResultCode::SORT_CONTROL_MISSING,
            AdmissionError::MalformedControl { .. } => ResultCode::PROTOCOL_ERROR,
        }
    }
}

/// Bind failures. All map to `invalidCredentials`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no SASL credentials were provided")]
    NoCredentials,

    #[error("malformed SASL credentials: {0}")]
    MalformedCredentials(String),

    /// Carries no detail.
    #[error("invalid credentials")]
    InvalidCredentials,
}

impl AuthError {
    pub fn result_code(&self) -> ResultCode {
        ResultCode::INVALID_CREDENTIALS
    }

    /// Text sent back to the client.
    pub fn diagnostic_message(&self) -> String {
        match self {
            AuthError::InvalidCredentials => String::new(),
            other => other.to_string(),
        }
    }
}

/// Generic operation failure carrying the result to send back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{result_code}: {message}")]
pub struct LdapError {
    pub result_code: ResultCode,
    pub message: String,
    pub matched_dn: String,
}

impl LdapError {
    pub fn new(result_code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            result_code,
            message: message.into(),
            matched_dn: String::new(),
        }
    }

    pub fn with_matched_dn(mut self, matched_dn: impl Into<String>) -> Self {
        self.matched_dn = matched_dn.into();
        self
    }

    pub fn no_such_object(dn: &str) -> Self {
        Self::new(
            ResultCode::NO_SUCH_OBJECT,
            format!("entry '{}' does not exist", dn),
        )
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::new(ResultCode::PROTOCOL_ERROR, message)
    }

    pub fn unwilling_to_perform(message: impl Into<String>) -> Self {
        Self::new(ResultCode::UNWILLING_TO_PERFORM, message)
    }

    pub fn to_result(&self) -> LdapResult {
        LdapResult::new(self.result_code, self.message.clone()).with_matched_dn(&self.matched_dn)
    }
}

impl From<AdmissionError> for LdapError {
    fn from(err: AdmissionError) -> Self {
        LdapError::new(err.result_code(), err.to_string())
    }
}

impl From<AuthError> for LdapError {
    fn from(err: AuthError) -> Self {
        LdapError::new(err.result_code(), err.diagnostic_message())
    }
}

pub type LdapResultOf<T> = std::result::Result<T, LdapError>;
