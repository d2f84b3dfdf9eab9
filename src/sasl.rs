// SASL bind mechanisms and the per-connection state they keep

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;
use zeroize::Zeroizing;

use crate::directory::Directory;
use crate::error::AuthError;

pub const PLAIN_MECHANISM: &str = "PLAIN";

/// Key/value store owned by one connection, for mechanisms that carry
/// values from one bind request to the next. Dropped with the connection.
#[derive(Default)]
pub struct SaslState {
    values: HashMap<String, Box<dyn Any + Send>>,
}

impl SaslState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    /// `None` when the key is absent or holds a different type.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        let value = self.values.remove(key)?;
        value.downcast::<T>().ok().map(|v| *v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl std::fmt::Debug for SaslState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslState")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Successful SASL bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslBindOutcome {
    /// Empty for an anonymous bind.
    pub authenticated_dn: String,
    pub server_sasl_credentials: Option<Vec<u8>>,
}

pub trait SaslBindHandler: Send + Sync {
    /// Mechanism name as sent by clients, e.g. `PLAIN`.
    fn mechanism(&self) -> &str;

    /// Multi-stage mechanisms keep their [`SaslState`] across binds.
    fn is_multi_stage(&self) -> bool {
        false
    }

    fn process_bind(
        &self,
        directory: &Directory,
        bind_dn: &str,
        credentials: Option<&[u8]>,
        state: &mut SaslState,
    ) -> Result<SaslBindOutcome, AuthError>;
}

/// RFC 4616 PLAIN: `[authzid] NUL authcid NUL password`.
#[derive(Debug, Clone)]
pub struct PlainBindHandler {
    allow_anonymous: bool,
}

impl PlainBindHandler {
    pub fn new(allow_anonymous: bool) -> Self {
        Self { allow_anonymous }
    }
}

impl Default for PlainBindHandler {
    fn default() -> Self {
        Self::new(true)
    }
}

/// PLAIN credentials split at the first two NUL bytes.
pub(crate) struct PlainCredentials<'a> {
    pub authzid: Option<&'a str>,
    pub authcid: &'a str,
    pub password: Zeroizing<Vec<u8>>,
}

pub(crate) fn parse_plain_credentials<'a>(bytes: &'a [u8]) -> Result<PlainCredentials<'a>, AuthError> {
    let mut nuls = bytes.iter().enumerate().filter(|(_, b)| **b == 0).map(|(i, _)| i);
    let (first, second) = match (nuls.next(), nuls.next()) {
        (Some(first), Some(second)) => (first, second),
        _ => {
            return Err(AuthError::MalformedCredentials(
                "PLAIN credentials must contain two NUL separators".into(),
            ))
        }
    };

    let utf8 = |part: &'a [u8]| {
        std::str::from_utf8(part).map_err(|_| {
            AuthError::MalformedCredentials("PLAIN identities must be valid UTF-8".into())
        })
    };
    let authzid = if first == 0 {
        None
    } else {
        Some(utf8(&bytes[..first])?)
    };
    Ok(PlainCredentials {
        authzid,
        authcid: utf8(&bytes[first + 1..second])?,
        password: Zeroizing::new(bytes[second + 1..].to_vec()),
    })
}

impl SaslBindHandler for PlainBindHandler {
    fn mechanism(&self) -> &str {
        PLAIN_MECHANISM
    }

    fn process_bind(
        &self,
        directory: &Directory,
        _bind_dn: &str,
        credentials: Option<&[u8]>,
        _state: &mut SaslState,
    ) -> Result<SaslBindOutcome, AuthError> {
        let credentials = credentials.ok_or(AuthError::NoCredentials)?;
        let parsed = parse_plain_credentials(credentials)?;

        let auth_dn = directory.resolve_authzid(parsed.authcid).map_err(|e| {
            debug!(error = %e, "unable to resolve PLAIN authentication identity");
            AuthError::InvalidCredentials
        })?;

        if auth_dn.is_empty() {
            if self.allow_anonymous && parsed.password.is_empty() && parsed.authzid.is_none() {
                return Ok(SaslBindOutcome {
                    authenticated_dn: String::new(),
                    server_sasl_credentials: None,
                });
            }
            return Err(AuthError::InvalidCredentials);
        }

        if parsed.password.is_empty() || !directory.check_password(&auth_dn, &parsed.password) {
            return Err(AuthError::InvalidCredentials);
        }

        // The authorization identity replaces the verified one outright.
        let authenticated_dn = match parsed.authzid {
            Some(authzid) => directory.resolve_authzid(authzid).map_err(|e| {
                debug!(error = %e, "unable to resolve PLAIN authorization identity");
                AuthError::InvalidCredentials
            })?,
            None => auth_dn,
        };

        Ok(SaslBindOutcome {
            authenticated_dn,
            server_sasl_credentials: None,
        })
    }
}

/// Mechanism name to handler.
#[derive(Default, Clone)]
pub struct SaslRegistry {
    handlers: BTreeMap<String, Arc<dyn SaslBindHandler>>,
}

impl SaslRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in handlers named in `mechanisms`.
    /// Unknown names are skipped.
    pub fn with_mechanisms(mechanisms: &[String], allow_anonymous_plain: bool) -> Self {
        let mut registry = Self::new();
        for name in mechanisms {
            if name.eq_ignore_ascii_case(PLAIN_MECHANISM) {
                registry.register(Arc::new(PlainBindHandler::new(allow_anonymous_plain)));
            } else {
                debug!(mechanism = %name, "no built-in handler for SASL mechanism");
            }
        }
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn SaslBindHandler>) {
        self.handlers.insert(handler.mechanism().to_string(), handler);
    }

    pub fn get(&self, mechanism: &str) -> Option<Arc<dyn SaslBindHandler>> {
        self.handlers.get(mechanism).cloned()
    }

    pub fn mechanisms(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

impl std::fmt::Debug for SaslRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslRegistry")
            .field("mechanisms", &self.mechanisms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Entry;
    use crate::ldap_protocol::Attribute;

    fn directory() -> Directory {
        let mut directory = Directory::in_memory(&["dc=example,dc=com".to_string()]);
        directory.add_additional_bind_credentials("cn=Directory Manager", "manager");
        directory
            .add(
                Entry::from_attributes(
                    "dc=example,dc=com",
                    vec![Attribute::from_strings("objectClass", &["top", "domain"])],
                ),
                false,
            )
            .unwrap();
        for (uid, password) in [("jdoe", "secret"), ("asmith", "other")] {
            directory
                .add(
                    Entry::from_attributes(
                        format!("uid={},dc=example,dc=com", uid),
                        vec![
                            Attribute::from_strings("objectClass", &["person"]),
                            Attribute::from_strings("userPassword", &[password]),
                        ],
                    ),
                    false,
                )
                .unwrap();
        }
        directory
    }

    fn bind(handler: &PlainBindHandler, credentials: &[u8]) -> Result<SaslBindOutcome, AuthError> {
        handler.process_bind(&directory(), "", Some(credentials), &mut SaslState::new())
    }

    #[test]
    fn test_plain_success() {
        let outcome = bind(&PlainBindHandler::default(), b"\x00jdoe\x00secret").unwrap();
        assert_eq!(outcome.authenticated_dn, "uid=jdoe,dc=example,dc=com");
    }

    #[test]
    fn test_plain_dn_authcid_and_additional_credentials() {
        let outcome =
            bind(&PlainBindHandler::default(), b"\x00dn:cn=Directory Manager\x00manager").unwrap();
        assert_eq!(outcome.authenticated_dn, "cn=Directory Manager");
    }

    #[test]
    fn test_plain_anonymous() {
        let outcome = bind(&PlainBindHandler::default(), b"\x00\x00").unwrap();
        assert_eq!(outcome.authenticated_dn, "");

        assert_eq!(
            bind(&PlainBindHandler::new(false), b"\x00\x00"),
            Err(AuthError::InvalidCredentials)
        );
        // Anonymous with a password or an authzid is not anonymous.
        assert_eq!(
            bind(&PlainBindHandler::default(), b"\x00\x00pw"),
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(
            bind(&PlainBindHandler::default(), b"u:jdoe\x00\x00"),
            Err(AuthError::InvalidCredentials)
        );
    }

    #[test]
    fn test_plain_missing_separator() {
        let err = bind(&PlainBindHandler::default(), b"\x00jdoe").unwrap_err();
        assert!(matches!(err, AuthError::MalformedCredentials(_)));
        assert_eq!(err.result_code().0, 49);
    }

    #[test]
    fn test_plain_no_credentials() {
        let handler = PlainBindHandler::default();
        let err = handler
            .process_bind(&directory(), "", None, &mut SaslState::new())
            .unwrap_err();
        assert_eq!(err, AuthError::NoCredentials);
    }

    #[test]
    fn test_plain_wrong_password_has_no_message() {
        let err = bind(&PlainBindHandler::default(), b"\x00jdoe\x00wrong").unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);
        assert!(err.diagnostic_message().is_empty());

        let err = bind(&PlainBindHandler::default(), b"\x00nobody\x00secret").unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);
    }

    #[test]
    fn test_plain_authzid_replaces_identity() {
        let outcome = bind(&PlainBindHandler::default(), b"u:asmith\x00jdoe\x00secret").unwrap();
        assert_eq!(outcome.authenticated_dn, "uid=asmith,dc=example,dc=com");

        let err = bind(&PlainBindHandler::default(), b"u:ghost\x00jdoe\x00secret").unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);
    }

    #[test]
    fn test_parse_password_may_contain_nul() {
        let parsed = parse_plain_credentials(b"\x00jdoe\x00a\x00b").unwrap();
        assert_eq!(parsed.authzid, None);
        assert_eq!(parsed.authcid, "jdoe");
        assert_eq!(parsed.password.as_slice(), b"a\x00b");
    }

    #[test]
    fn test_state_typed_values() {
        let mut state = SaslState::new();
        state.insert("stage", 2u32);
        state.insert("nonce", b"abc".to_vec());
        assert_eq!(state.get::<u32>("stage"), Some(&2));
        assert_eq!(state.get::<String>("stage"), None);
        assert_eq!(state.remove::<Vec<u8>>("nonce"), Some(b"abc".to_vec()));
        assert_eq!(state.len(), 1);
        state.clear();
        assert!(state.is_empty());
    }

    #[test]
    fn test_registry() {
        let registry =
            SaslRegistry::with_mechanisms(&["plain".to_string(), "GSSAPI".to_string()], true);
        assert_eq!(registry.mechanisms(), vec!["PLAIN".to_string()]);
        assert!(registry.get("PLAIN").is_some());
        assert!(registry.get("GSSAPI").is_none());
    }
}
