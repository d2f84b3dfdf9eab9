use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::directory::{split_dn, Directory, Entry};
use crate::ldap_handler::HandlerSettings;
use crate::ldap_protocol::{Attribute, OperationType};
use crate::sasl::PLAIN_MECHANISM;
use crate::server::parse_listen_url;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 20 * 1024 * 1024;
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listeners")]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub base_dns: Vec<String>,
    /// Operation types the server accepts. Missing means all of them.
    pub allowed_operation_types: Option<Vec<OperationType>>,
    #[serde(default)]
    pub authentication_required_operation_types: Vec<OperationType>,
    /// Checked before the password attributes of the entry itself.
    #[serde(default)]
    pub additional_bind_credentials: Vec<BindCredential>,
    #[serde(default = "default_password_attributes")]
    pub password_attributes: Vec<String>,
    #[serde(default = "default_sasl_mechanisms")]
    pub sasl_mechanisms: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_anonymous_sasl_plain: bool,
    /// Server-side cap on search results, 0 = unlimited.
    #[serde(default)]
    pub max_size_limit: usize,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub entries: Vec<EntryConfig>,
    /// Optional HTTP listen address for metrics and health (e.g. "0.0.0.0:9090"). Endpoints: GET /metrics (Prometheus), GET /health (liveness), GET /ready (readiness).
    pub metrics_listen: Option<String>,
    pub vendor_name: Option<String>,
    pub vendor_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_listener_name")]
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindCredential {
    pub dn: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Open client connections across all listeners. Clients over the limit
    /// get a busy notice of disconnection.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Socket read timeout. Unset means reads block until data arrives.
    pub read_timeout_ms: Option<u64>,
    /// Keep waiting when a timeout hits before the first byte of a message.
    #[serde(default = "default_true")]
    pub ignore_initial_timeout: bool,
    /// Keep waiting when a timeout hits in the middle of a message.
    #[serde(default)]
    pub ignore_subsequent_timeout: bool,
}

impl ConnectionConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            read_timeout_ms: None,
            ignore_initial_timeout: true,
            ignore_subsequent_timeout: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    pub dn: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValues>,
}

/// A single value may be written without the surrounding list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValues {
    One(String),
    Many(Vec<String>),
}

impl AttributeValues {
    pub fn to_bytes(&self) -> Vec<Vec<u8>> {
        match self {
            AttributeValues::One(value) => vec![value.as_bytes().to_vec()],
            AttributeValues::Many(values) => {
                values.iter().map(|v| v.as_bytes().to_vec()).collect()
            }
        }
    }
}

impl EntryConfig {
    pub fn to_entry(&self) -> Entry {
        let attributes = self
            .attributes
            .iter()
            .map(|(name, values)| Attribute::new(name.clone(), values.to_bytes()))
            .collect();
        Entry::from_attributes(self.dn.clone(), attributes)
    }
}

fn default_listeners() -> Vec<ListenerConfig> {
    vec![ListenerConfig {
        name: default_listener_name(),
        url: "ldap://127.0.0.1:1389".to_string(),
    }]
}

fn default_listener_name() -> String {
    "default".to_string()
}

fn default_password_attributes() -> Vec<String> {
    vec!["userPassword".to_string()]
}

fn default_sasl_mechanisms() -> Vec<String> {
    vec![PLAIN_MECHANISM.to_string()]
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            bail!("at least one listener is required");
        }
        let mut names = BTreeSet::new();
        for listener in &self.listeners {
            if !names.insert(listener.name.as_str()) {
                bail!("duplicate listener name: {}", listener.name);
            }
            parse_listen_url(&listener.url)
                .with_context(|| format!("listener {}", listener.name))?;
        }
        if self.base_dns.iter().any(|dn| dn.trim().is_empty()) {
            bail!("base_dns must not contain the empty DN");
        }
        if self.password_attributes.is_empty() {
            bail!("password_attributes must not be empty");
        }
        for mechanism in &self.sasl_mechanisms {
            if !mechanism.eq_ignore_ascii_case(PLAIN_MECHANISM) {
                bail!("unsupported SASL mechanism: {}", mechanism);
            }
        }
        if self.connection.max_message_size == 0 {
            bail!("connection.max_message_size must be greater than zero");
        }
        if self.connection.max_connections == 0 {
            bail!("connection.max_connections must be greater than zero");
        }
        Ok(())
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        let mut settings = HandlerSettings::default();
        if let Some(allowed) = &self.allowed_operation_types {
            settings.allowed_operation_types = allowed.iter().copied().collect();
        }
        settings.authentication_required_operation_types = self
            .authentication_required_operation_types
            .iter()
            .copied()
            .collect();
        settings.max_size_limit = self.max_size_limit;
        if let Some(name) = &self.vendor_name {
            settings.vendor_name = name.clone();
        }
        if let Some(version) = &self.vendor_version {
            settings.vendor_version = version.clone();
        }
        settings
    }

    /// Builds the directory and loads the configured entries, parents first.
    pub fn build_directory(&self) -> Result<Directory> {
        let mut directory = Directory::in_memory(&self.base_dns);
        directory.set_password_attributes(self.password_attributes.clone());
        for credential in &self.additional_bind_credentials {
            directory.add_additional_bind_credentials(&credential.dn, credential.password.as_bytes());
        }

        let mut entries: Vec<&EntryConfig> = self.entries.iter().collect();
        entries.sort_by_key(|entry| split_dn(&entry.dn).len());
        for entry in entries {
            directory
                .add(entry.to_entry(), false)
                .with_context(|| format!("loading entry {}", entry.dn))?;
        }
        Ok(directory)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listeners: default_listeners(),
            base_dns: vec!["dc=example,dc=com".to_string()],
            allowed_operation_types: None,
            authentication_required_operation_types: Vec::new(),
            additional_bind_credentials: Vec::new(),
            password_attributes: default_password_attributes(),
            sasl_mechanisms: default_sasl_mechanisms(),
            allow_anonymous_sasl_plain: true,
            max_size_limit: 0,
            connection: ConnectionConfig::default(),
            entries: Vec::new(),
            metrics_listen: None,
            vendor_name: None,
            vendor_version: None,
        }
    }
}
