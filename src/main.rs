use anyhow::{Context, Result};
use clap::Parser;
use ldap_inmem_server::config::ListenerConfig;
use ldap_inmem_server::extended::ExtendedRegistry;
use ldap_inmem_server::sasl::SaslRegistry;
use ldap_inmem_server::{run_metrics_server, Config, LdapHandler, LdapServer, Metrics, ServerStatus};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ldap-inmem-server")]
#[command(about = "In-memory LDAPv3 directory server for tests and development")]
struct Args {
    /// Configuration file path (built-in defaults when omitted)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen URL (overrides the first configured listener; e.g. ldap://:1389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_inmem_server={},info", log_level))
        .init();

    info!("Starting in-memory LDAP server");

    let mut config = match &args.config {
        Some(path) => {
            info!("Configuration source: file {:?}", path);
            Config::from_file(path)?
        }
        None => {
            info!("No --config given, using built-in defaults");
            Config::default()
        }
    };
    if let Some(url) = args.listen {
        match config.listeners.first_mut() {
            Some(first) => first.url = url,
            None => config.listeners.push(ListenerConfig {
                name: "default".to_string(),
                url,
            }),
        }
    }
    config.validate().context("Invalid configuration")?;

    info!("Configuration loaded:");
    for listener in &config.listeners {
        info!("  Listener {}: {}", listener.name, listener.url);
    }
    info!("  Base DNs: {:?}", config.base_dns);
    info!("  SASL mechanisms: {:?}", config.sasl_mechanisms);
    info!("  Initial entries: {}", config.entries.len());

    let directory = Arc::new(config.build_directory()?);
    let metrics = Arc::new(Metrics::default());
    let handler = Arc::new(LdapHandler::new(
        Arc::clone(&directory),
        SaslRegistry::with_mechanisms(&config.sasl_mechanisms, config.allow_anonymous_sasl_plain),
        ExtendedRegistry::with_defaults(),
        config.handler_settings(),
        Arc::clone(&metrics),
    ));

    let server = LdapServer::new(config.listeners.clone(), handler, config.connection.clone());

    if let Some(addr) = config.metrics_listen.clone() {
        let ready = server.ready_flag();
        let listeners: Vec<String> = config.listeners.iter().map(|l| l.name.clone()).collect();
        let status = Arc::new(move || ServerStatus {
            ready: ready.load(Ordering::Acquire),
            entries: directory.entry_count(),
            listeners: listeners.clone(),
        });
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, metrics, status).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    server.start().await?;

    Ok(())
}
