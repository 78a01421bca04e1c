//! The gateway: listener, accept loops and shared connection state
//!
//! `Gateway::bind` does all fallible startup work (socket, TLS material,
//! queue worker) so that a returned gateway is ready to run. The
//! [`GatewayHandle`] is how the application publishes to devices and stops
//! the gateway.

mod connection;
mod publisher;
pub mod runtime;
mod tls;
mod writer;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub use connection::{Connection, ConnectionError};
pub use publisher::{ConnectionPublisher, ConnectionTable, OutboundMessage, PublishError, Publisher};
pub use tls::{load_tls_config, TlsError};
pub use writer::{SendError, SharedWriter};

use crate::charset::Charset;
use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::hooks::{MessageHandler, Verifier};
use crate::queue::{MessageQueue, QueueWorker, DEFAULT_CAPACITY};
use crate::session::{ConnectionId, SessionRegistry};

/// Accept backlog for the listening socket
const LISTEN_BACKLOG: i32 = 1024;
/// Upper bound for concurrent accept tasks
pub const MAX_ACCEPT_THREADS: usize = 5;
/// Upper bound for I/O worker threads
pub const MAX_IO_THREADS: usize = 100;
/// Default read-idle timeout
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// TLS settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// Server certificate chain (PEM)
    pub cert_path: PathBuf,
    /// Server private key (PEM)
    pub key_path: PathBuf,
    /// CA bundle for client certificates (PEM)
    pub ca_cert_path: Option<PathBuf>,
    /// Reject clients without a valid certificate
    pub require_client_cert: bool,
}

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Concurrent accept tasks (1-5)
    pub accept_threads: usize,
    /// Runtime worker threads for connection I/O (1-100)
    pub io_threads: usize,
    /// Close connections with no inbound bytes for this long
    pub idle_timeout: Duration,
    /// Largest inbound remaining length accepted
    pub max_packet_size: usize,
    /// Capacity of the inbound message queue
    pub max_queued_messages: usize,
    /// Payload charset in both directions
    pub charset: Charset,
    /// TLS, if enabled
    pub tls: Option<TlsConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            accept_threads: 1,
            io_threads: available_parallelism(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_queued_messages: DEFAULT_CAPACITY,
            charset: Charset::Utf8,
            tls: None,
        }
    }
}

impl GatewayConfig {
    /// Clamp out-of-range values. Zero means "use the default" everywhere.
    pub fn normalized(mut self) -> Self {
        self.accept_threads = self.accept_threads.clamp(1, MAX_ACCEPT_THREADS);
        self.io_threads = match self.io_threads {
            0 => available_parallelism().min(MAX_IO_THREADS),
            n => n.min(MAX_IO_THREADS),
        };
        if self.idle_timeout.is_zero() {
            self.idle_timeout = DEFAULT_IDLE_TIMEOUT;
        }
        if self.max_packet_size == 0 {
            self.max_packet_size = DEFAULT_MAX_PACKET_SIZE;
        }
        if self.max_queued_messages == 0 {
            self.max_queued_messages = DEFAULT_CAPACITY;
        }
        self
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Startup failures
#[derive(Debug)]
pub enum GatewayError {
    /// Binding or configuring the listening socket failed
    Bind(SocketAddr, io::Error),
    /// TLS material could not be loaded
    Tls(TlsError),
    /// The queue worker thread could not be started
    Worker(io::Error),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Bind(addr, e) => write!(f, "cannot listen on {}: {}", addr, e),
            GatewayError::Tls(e) => write!(f, "TLS setup failed: {}", e),
            GatewayError::Worker(e) => write!(f, "cannot start queue worker: {}", e),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayError::Bind(_, e) | GatewayError::Worker(e) => Some(e),
            GatewayError::Tls(e) => Some(e),
        }
    }
}

impl From<TlsError> for GatewayError {
    fn from(e: TlsError) -> Self {
        GatewayError::Tls(e)
    }
}

/// State shared by every connection task
pub(crate) struct Shared<H: MessageHandler> {
    pub(crate) config: GatewayConfig,
    pub(crate) sessions: Arc<SessionRegistry<H>>,
    pub(crate) connections: Arc<ConnectionTable>,
    pub(crate) queue: MessageQueue,
    pub(crate) verifier: Option<Arc<dyn Verifier>>,
}

/// A bound, not yet running gateway
pub struct Gateway<H: MessageHandler> {
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    config: GatewayConfig,
    sessions: Arc<SessionRegistry<H>>,
    connections: Arc<ConnectionTable>,
    queue: MessageQueue,
    worker: Arc<QueueWorker>,
    verifier: Option<Arc<dyn Verifier>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl<H: MessageHandler> Gateway<H> {
    /// Bind the listener, load TLS material and start the queue worker.
    ///
    /// `config` is normalized first. On error nothing is left running.
    pub async fn bind(config: GatewayConfig, handler: H) -> Result<Self, GatewayError> {
        let config = config.normalized();

        let listener =
            bind_listener(config.bind_addr).map_err(|e| GatewayError::Bind(config.bind_addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Bind(config.bind_addr, e))?;

        let tls = match &config.tls {
            Some(tls_config) => Some(load_tls_config(tls_config)?),
            None => None,
        };

        let handler = Arc::new(handler);
        let (queue, receiver) = MessageQueue::bounded(config.max_queued_messages);
        let worker = QueueWorker::spawn(receiver, handler.clone()).map_err(GatewayError::Worker)?;

        // Latched: tasks that subscribe after close() still see it
        let (shutdown, _) = watch::channel(false);

        info!(
            "listening on {}{} (accept tasks: {}, idle timeout: {:?}, charset: {})",
            local_addr,
            if tls.is_some() { " with TLS" } else { "" },
            config.accept_threads,
            config.idle_timeout,
            config.charset
        );

        Ok(Self {
            listener: Arc::new(listener),
            local_addr,
            tls,
            sessions: Arc::new(SessionRegistry::new(handler)),
            connections: Arc::new(ConnectionTable::new(config.charset)),
            queue,
            worker: Arc::new(worker),
            verifier: None,
            shutdown: Arc::new(shutdown),
            config,
        })
    }

    /// Check credentials on every CONNECT
    pub fn with_verifier(mut self, verifier: impl Verifier + 'static) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn handle(&self) -> GatewayHandle<H> {
        GatewayHandle {
            sessions: self.sessions.clone(),
            connections: self.connections.clone(),
            worker: self.worker.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Accept connections until [`GatewayHandle::close`] is called
    pub async fn run(self) -> Result<(), GatewayError> {
        let shared = Arc::new(Shared {
            config: self.config.clone(),
            sessions: self.sessions.clone(),
            connections: self.connections.clone(),
            queue: self.queue.clone(),
            verifier: self.verifier.clone(),
        });

        let mut accept_tasks = JoinSet::new();
        for n in 0..self.config.accept_threads {
            accept_tasks.spawn(accept_loop(
                n,
                self.listener.clone(),
                self.tls.clone(),
                shared.clone(),
                self.shutdown.clone(),
            ));
        }

        while let Some(result) = accept_tasks.join_next().await {
            if let Err(e) = result {
                error!("accept task failed: {}", e);
            }
        }

        self.connections.close_all();
        self.worker.shutdown();
        info!("gateway on {} stopped", self.local_addr);
        Ok(())
    }
}

/// Cloneable control surface for a running gateway
pub struct GatewayHandle<H: MessageHandler> {
    sessions: Arc<SessionRegistry<H>>,
    connections: Arc<ConnectionTable>,
    worker: Arc<QueueWorker>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl<H: MessageHandler> Clone for GatewayHandle<H> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            connections: self.connections.clone(),
            worker: self.worker.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<H: MessageHandler> GatewayHandle<H> {
    /// Send `content` to the device on `connection` as a QoS 0 PUBLISH
    pub fn publish(
        &self,
        connection: ConnectionId,
        topic: &str,
        content: &str,
    ) -> Result<(), PublishError> {
        self.connections
            .publish(OutboundMessage::new(connection, topic, content))
    }

    /// Live session registry
    pub fn sessions(&self) -> &Arc<SessionRegistry<H>> {
        &self.sessions
    }

    /// Number of open connections, including ones that have not sent CONNECT
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stop accepting, close every connection and stop the queue worker
    pub fn close(&self) {
        info!("closing gateway");
        self.shutdown.send_replace(true);
        self.connections.close_all();
        self.worker.shutdown();
    }
}

/// Listening socket with SO_REUSEADDR off and a 1024 backlog
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(false)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

async fn accept_loop<H: MessageHandler>(
    n: usize,
    listener: Arc<TcpListener>,
    tls: Option<TlsAcceptor>,
    shared: Arc<Shared<H>>,
    shutdown: Arc<watch::Sender<bool>>,
) {
    let mut shutdown_rx = shutdown.subscribe();
    debug!("accept task {} started", n);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.wait_for(|closed| *closed) => break,

            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    if let Err(e) = configure_stream(&stream) {
                        warn!("cannot set socket options for {}: {}", addr, e);
                    }
                    spawn_connection(stream, addr, tls.clone(), shared.clone(), shutdown.subscribe());
                }
                Err(e) => error!("failed to accept TCP connection: {}", e),
            },
        }
    }

    debug!("accept task {} stopped", n);
}

/// TCP_NODELAY and SO_KEEPALIVE on every accepted socket
fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_keepalive(true)
}

fn spawn_connection<H: MessageHandler>(
    stream: TcpStream,
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    shared: Arc<Shared<H>>,
    shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        match tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => start(tls_stream, addr, shared, shutdown_rx).await,
                Err(e) => warn!("TLS handshake with {} failed: {}", addr, e),
            },
            None => start(stream, addr, shared, shutdown_rx).await,
        }
    });
}

async fn start<S, H>(
    stream: S,
    addr: SocketAddr,
    shared: Arc<Shared<H>>,
    shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    H: MessageHandler,
{
    let conn = Connection::new(stream, addr, shared);
    connection::serve(conn, shutdown_rx).await;
}
