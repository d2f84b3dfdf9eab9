// Extended operation handlers and their OID registry

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::ber::{Asn1Buffer, Asn1Error, Asn1StreamReader};
use crate::directory::{normalize_dn, Directory};
use crate::error::{LdapError, LdapResultOf};
use crate::ldap_protocol::{ExtendedRequest, ExtendedResponse, LdapResult, ResultCode};

pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
pub const PASSWORD_MODIFY_OID: &str = "1.3.6.1.4.1.4203.1.11.1";

const GENERATED_PASSWORD_LENGTH: usize = 16;

/// What an extended handler may see of the requesting connection.
pub struct ExtendedContext<'a> {
    pub directory: &'a Directory,
    /// Empty when the connection is anonymous.
    pub authenticated_dn: &'a str,
}

pub trait ExtendedOperationHandler: Send + Sync {
    fn name(&self) -> &str;

    fn supported_oids(&self) -> Vec<&'static str>;

    fn process(&self, ctx: &ExtendedContext<'_>, request: &ExtendedRequest) -> ExtendedResponse;
}

/// RFC 4532 "Who am I?".
#[derive(Debug, Default)]
pub struct WhoAmIHandler;

impl ExtendedOperationHandler for WhoAmIHandler {
    fn name(&self) -> &str {
        "Who Am I"
    }

    fn supported_oids(&self) -> Vec<&'static str> {
        vec![WHO_AM_I_OID]
    }

    fn process(&self, ctx: &ExtendedContext<'_>, _request: &ExtendedRequest) -> ExtendedResponse {
        let authzid = if ctx.authenticated_dn.is_empty() {
            String::new()
        } else {
            format!("dn:{}", ctx.authenticated_dn)
        };
        let mut response = ExtendedResponse::new(LdapResult::success());
        response.value = Some(authzid.into_bytes());
        response
    }
}

const PASSWORD_MODIFY_USER_IDENTITY: u8 = 0x80;
const PASSWORD_MODIFY_OLD_PASSWORD: u8 = 0x81;
const PASSWORD_MODIFY_NEW_PASSWORD: u8 = 0x82;
const PASSWORD_MODIFY_GENERATED_PASSWORD: u8 = 0x80;

/// Decoded RFC 3062 request value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PasswordModifyRequest {
    pub user_identity: Option<String>,
    pub old_password: Option<Vec<u8>>,
    pub new_password: Option<Vec<u8>>,
}

impl PasswordModifyRequest {
    pub fn decode(value: &[u8]) -> Result<Self, Asn1Error> {
        let mut reader = Asn1StreamReader::new(value);
        let seq = reader.begin_required_sequence()?;
        let mut request = Self::default();
        while seq.has_more_elements(&reader)? {
            match reader.peek()? {
                Some(PASSWORD_MODIFY_USER_IDENTITY) => {
                    request.user_identity = Some(reader.read_string()?)
                }
                Some(PASSWORD_MODIFY_OLD_PASSWORD) => {
                    request.old_password = Some(reader.read_bytes()?)
                }
                Some(PASSWORD_MODIFY_NEW_PASSWORD) => {
                    request.new_password = Some(reader.read_bytes()?)
                }
                other => {
                    return Err(Asn1Error::Malformed(format!(
                        "unexpected element type {:02x?} in password modify request",
                        other
                    )))
                }
            }
        }
        Ok(request)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Asn1Buffer::new();
        {
            let mut seq = buf.begin_sequence();
            if let Some(identity) = &self.user_identity {
                seq.add_string_with_type(PASSWORD_MODIFY_USER_IDENTITY, identity);
            }
            if let Some(old) = &self.old_password {
                seq.add_octet_string_with_type(PASSWORD_MODIFY_OLD_PASSWORD, old);
            }
            if let Some(new) = &self.new_password {
                seq.add_octet_string_with_type(PASSWORD_MODIFY_NEW_PASSWORD, new);
            }
        }
        buf.into_vec()
    }
}

/// RFC 3062 password modify. Generates a password when none is supplied.
#[derive(Debug, Default)]
pub struct PasswordModifyHandler;

impl PasswordModifyHandler {
    fn target_dn(ctx: &ExtendedContext<'_>, identity: Option<&str>) -> LdapResultOf<String> {
        match identity {
            None if ctx.authenticated_dn.is_empty() => Err(LdapError::unwilling_to_perform(
                "no user identity was given and the connection is not authenticated",
            )),
            None => Ok(ctx.authenticated_dn.to_string()),
            Some(identity) if identity.starts_with("dn:") || identity.starts_with("u:") => {
                let dn = ctx.directory.resolve_authzid(identity).map_err(|e| {
                    LdapError::new(ResultCode::NO_SUCH_OBJECT, e.message)
                })?;
                if dn.is_empty() {
                    return Err(LdapError::unwilling_to_perform(
                        "cannot change the password of the anonymous identity",
                    ));
                }
                Ok(dn)
            }
            Some(dn) => Ok(dn.to_string()),
        }
    }

    fn modify(
        ctx: &ExtendedContext<'_>,
        request: &PasswordModifyRequest,
    ) -> LdapResultOf<Option<Vec<u8>>> {
        let dn = Self::target_dn(ctx, request.user_identity.as_deref())?;
        if ctx.directory.get(&dn).is_none() {
            return Err(LdapError::no_such_object(&dn));
        }
        match &request.old_password {
            Some(old) => {
                if !ctx.directory.check_password(&dn, old) {
                    return Err(LdapError::new(ResultCode::INVALID_CREDENTIALS, ""));
                }
            }
            None if ctx.authenticated_dn.is_empty() => {
                return Err(LdapError::unwilling_to_perform(
                    "the current password is required for an anonymous password change",
                ))
            }
            // Without the old password only the bound identity may change itself.
            None if normalize_dn(ctx.authenticated_dn) != normalize_dn(&dn) => {
                return Err(LdapError::new(
                    ResultCode::INSUFFICIENT_ACCESS_RIGHTS,
                    "the current password is required to change another user's password",
                ))
            }
            None => {}
        }

        let (new_password, generated) = match &request.new_password {
            Some(password) => (Zeroizing::new(password.clone()), false),
            None => (Zeroizing::new(generate_password()), true),
        };
        ctx.directory.set_password(&dn, new_password.to_vec())?;
        info!(dn = %dn, generated, "password changed");

        if generated {
            let mut buf = Asn1Buffer::new();
            buf.set_zero_on_clear(true);
            buf.begin_sequence()
                .add_octet_string_with_type(PASSWORD_MODIFY_GENERATED_PASSWORD, &new_password);
            Ok(Some(buf.as_bytes().to_vec()))
        } else {
            Ok(None)
        }
    }
}

fn generate_password() -> Vec<u8> {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LENGTH)
        .collect()
}

impl ExtendedOperationHandler for PasswordModifyHandler {
    fn name(&self) -> &str {
        "Password Modify"
    }

    fn supported_oids(&self) -> Vec<&'static str> {
        vec![PASSWORD_MODIFY_OID]
    }

    fn process(&self, ctx: &ExtendedContext<'_>, request: &ExtendedRequest) -> ExtendedResponse {
        let decoded = match &request.value {
            Some(value) => match PasswordModifyRequest::decode(value) {
                Ok(decoded) => decoded,
                Err(e) => {
                    return ExtendedResponse::new(LdapResult::new(
                        ResultCode::PROTOCOL_ERROR,
                        format!("unable to decode the password modify request: {}", e),
                    ))
                }
            },
            None => PasswordModifyRequest::default(),
        };

        match Self::modify(ctx, &decoded) {
            Ok(value) => {
                let mut response = ExtendedResponse::new(LdapResult::success());
                response.value = value;
                response
            }
            Err(e) => ExtendedResponse::new(e.to_result()),
        }
    }
}

/// OID to handler.
#[derive(Default, Clone)]
pub struct ExtendedRegistry {
    handlers: BTreeMap<String, Arc<dyn ExtendedOperationHandler>>,
}

impl ExtendedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// WhoAmI and Password Modify.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WhoAmIHandler));
        registry.register(Arc::new(PasswordModifyHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ExtendedOperationHandler>) {
        for oid in handler.supported_oids() {
            self.handlers.insert(oid.to_string(), handler.clone());
        }
    }

    pub fn supported_oids(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn process(&self, ctx: &ExtendedContext<'_>, request: &ExtendedRequest) -> ExtendedResponse {
        match self.handlers.get(&request.oid) {
            Some(handler) => {
                debug!(oid = %request.oid, handler = handler.name(), "dispatching extended request");
                handler.process(ctx, request)
            }
            None => ExtendedResponse::new(LdapResult::new(
                ResultCode::PROTOCOL_ERROR,
                format!("extended operation {} is not supported", request.oid),
            )),
        }
    }
}

impl std::fmt::Debug for ExtendedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtendedRegistry")
            .field("oids", &self.supported_oids())
            .finish()
    }
}
