use crate::ber::{Asn1Buffer, Asn1Error, Asn1StreamReader};
use crate::config::{ConnectionConfig, ListenerConfig};
use crate::ldap_handler::{ConnectionState, LdapHandler};
use crate::ldap_protocol::{notice_of_disconnection, LdapMessage, ProtocolOp, ResultCode};
use anyhow::{Context, Result};
use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A listener socket that has been bound but is not accepting yet.
pub struct BoundListener {
    pub name: String,
    pub local_addr: SocketAddr,
    listener: TcpListener,
}

pub struct LdapServer {
    listeners: Vec<ListenerConfig>,
    handler: Arc<LdapHandler>,
    connection: ConnectionConfig,
    /// One permit per open client connection, shared by every listener.
    slots: Arc<Semaphore>,
    ready: Arc<AtomicBool>,
}

impl LdapServer {
    pub fn new(
        listeners: Vec<ListenerConfig>,
        handler: Arc<LdapHandler>,
        connection: ConnectionConfig,
    ) -> Self {
        let permits = connection.max_connections.min(Semaphore::MAX_PERMITS);
        Self {
            listeners,
            handler,
            connection,
            slots: Arc::new(Semaphore::new(permits)),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that turns true once every listener is bound.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    pub fn handler(&self) -> &Arc<LdapHandler> {
        &self.handler
    }

    pub async fn bind(&self) -> Result<Vec<BoundListener>> {
        let mut bound = Vec::with_capacity(self.listeners.len());
        for config in &self.listeners {
            let addr = parse_listen_url(&config.url)
                .with_context(|| format!("Listener {}", config.name))?;
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind to {}", addr))?;
            let local_addr = listener.local_addr()?;
            info!("Listener {} accepting LDAP connections on {}", config.name, local_addr);
            bound.push(BoundListener {
                name: config.name.clone(),
                local_addr,
                listener,
            });
        }
        self.ready.store(true, Ordering::Release);
        Ok(bound)
    }

    pub async fn start(&self) -> Result<()> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    /// Accepts connections on every listener until one of the accept loops fails.
    pub async fn serve(&self, listeners: Vec<BoundListener>) -> Result<()> {
        info!(
            "Serving {} entries under {:?}",
            self.handler.directory().entry_count(),
            self.handler.directory().base_dns()
        );
        let mut tasks = JoinSet::new();
        for bound in listeners {
            let handler = Arc::clone(&self.handler);
            let connection = self.connection.clone();
            let slots = Arc::clone(&self.slots);
            tasks.spawn(accept_loop(bound, handler, connection, slots));
        }
        while let Some(finished) = tasks.join_next().await {
            finished.context("Listener task panicked")?;
        }
        self.ready.store(false, Ordering::Release);
        Ok(())
    }
}

/// Each accepted client runs on its own thread until it disconnects.
async fn accept_loop(
    bound: BoundListener,
    handler: Arc<LdapHandler>,
    connection: ConnectionConfig,
    slots: Arc<Semaphore>,
) {
    let BoundListener { name, listener, .. } = bound;
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept connection on {}: {}", name, e);
                continue;
            }
        };
        let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
            warn!("Refusing connection from {} on {}: connection limit reached", peer_addr, name);
            handler.metrics().connection_rejected();
            tokio::spawn(refuse(stream));
            continue;
        };
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to take over connection from {}: {}", peer_addr, e);
                continue;
            }
        };
        debug!("New connection from {} on {}", peer_addr, name);
        handler.metrics().connection_opened();

        let conn_handler = Arc::clone(&handler);
        let connection = connection.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("ldap-conn-{}", peer_addr))
            .spawn(move || {
                if let Err(e) = handle_client(stream, peer_addr, &conn_handler, &connection) {
                    error!("Error handling client {}: {:#}", peer_addr, e);
                }
                conn_handler.metrics().connection_closed();
                drop(permit);
            });
        if let Err(e) = spawned {
            error!("Failed to start a connection thread for {}: {}", peer_addr, e);
            handler.metrics().connection_closed();
        }
    }
}

/// Sends a busy notice of disconnection and closes the socket.
async fn refuse(mut stream: TcpStream) {
    let notice = notice_of_disconnection(
        ResultCode::BUSY,
        "the server has reached its connection limit",
    );
    if let Err(e) = stream.write_all(&notice.encode()).await {
        debug!("Failed to send the busy notice: {}", e);
    }
    let _ = stream.shutdown().await;
}

/// Accepts `ldap://host:port` and `ldap://:port` (all interfaces).
pub fn parse_listen_url(url: &str) -> Result<SocketAddr> {
    if url.starts_with("ldaps://") {
        anyhow::bail!("ldaps:// listeners are not supported, use ldap://");
    }
    let url = url
        .strip_prefix("ldap://")
        .ok_or_else(|| anyhow::anyhow!("Invalid URL scheme, expected ldap://"))?;

    let url = url.trim_start_matches('/').trim_end_matches('/');

    if let Some(port) = url.strip_prefix(':') {
        let port: u16 = port.parse().context("Invalid port number")?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    } else {
        url.parse()
            .with_context(|| format!("Failed to parse address: {}", url))
    }
}

/// Runs one client connection to completion on the current (blocking) thread.
fn handle_client(
    stream: std::net::TcpStream,
    peer_addr: SocketAddr,
    handler: &LdapHandler,
    connection: &ConnectionConfig,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(connection.read_timeout())?;

    let mut writer = BufWriter::new(stream.try_clone()?);
    let mut reader = Asn1StreamReader::with_max_element_size(
        BufReader::new(stream.try_clone()?),
        connection.max_message_size,
    );
    reader.set_ignore_socket_timeout(
        connection.ignore_initial_timeout,
        connection.ignore_subsequent_timeout,
    );

    let mut buffer = Asn1Buffer::new();
    buffer.set_zero_on_clear(true);
    let mut state = ConnectionState::new();

    loop {
        let message = match LdapMessage::read_from(&mut reader) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("Client {} disconnected", peer_addr);
                break;
            }
            Err(Asn1Error::Io(e)) => {
                debug!("Connection to {} failed: {}", peer_addr, e);
                break;
            }
            Err(Asn1Error::Timeout { initial }) => {
                debug!("Read from {} timed out (idle: {})", peer_addr, initial);
                break;
            }
            Err(e) => {
                handler.metrics().inc_decode_error();
                warn!("Malformed request from {}: {}", peer_addr, e);
                let notice = notice_of_disconnection(ResultCode::PROTOCOL_ERROR, &e.to_string());
                send(&mut writer, &mut buffer, std::slice::from_ref(&notice))?;
                break;
            }
        };

        let unbind = matches!(message.protocol_op, ProtocolOp::UnbindRequest);
        match handler.handle(&mut state, message) {
            Ok(responses) => send(&mut writer, &mut buffer, &responses)?,
            Err(e) => {
                warn!("Closing connection to {}: {}", peer_addr, e);
                let notice = notice_of_disconnection(e.result_code, &e.message);
                send(&mut writer, &mut buffer, std::slice::from_ref(&notice))?;
                break;
            }
        }
        if unbind {
            debug!("Client {} unbound", peer_addr);
            break;
        }
    }

    reader.close();
    let _ = stream.shutdown(Shutdown::Both);
    Ok(())
}

fn send<W: Write>(writer: &mut W, buffer: &mut Asn1Buffer, messages: &[LdapMessage]) -> Result<()> {
    if messages.is_empty() {
        return Ok(());
    }
    for message in messages {
        buffer.clear();
        message.write_to(buffer);
        buffer.write_to(writer)?;
    }
    buffer.clear();
    writer.flush()?;
    Ok(())
}
