pub mod ber;
pub mod config;
pub mod controls;
pub mod directory;
pub mod error;
pub mod extended;
pub mod ldap_handler;
pub mod ldap_protocol;
pub mod metrics;
pub mod sasl;
pub mod server;

pub use config::Config;
pub use directory::Directory;
pub use ldap_handler::LdapHandler;
pub use metrics::{run_metrics_server, Metrics, ServerStatus};
pub use server::LdapServer;
