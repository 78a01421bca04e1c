//! MQTT Connection Handler
//!
//! One task per accepted connection. Packets are handled strictly in arrival
//! order; replies go through the connection's [`SharedWriter`] so they stay
//! ordered with publishes pushed from other threads.

mod connect;
mod publish;
mod subscribe;


use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::publisher::ConnectionPublisher;
use super::writer::SharedWriter;
use super::Shared;
use crate::codec::Decoder;
use crate::hooks::MessageHandler;
use crate::protocol::{DecodeError, Packet, ProtocolError};
use crate::session::ConnectionId;

/// Why a connection ended
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Decode(DecodeError),
    /// No bytes read within the idle timeout
    IdleTimeout,
    /// Gateway shutdown or writer closed
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::IdleTimeout => write!(f, "Idle timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

/// Connection state
pub(crate) enum State {
    /// Waiting for CONNECT
    PreConnect,
    /// CONNECT accepted
    Established { identity: Arc<str> },
}

/// What the loop does after a packet
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

/// Connection handler - generic over the stream type
pub struct Connection<S, H: MessageHandler> {
    pub(crate) stream: S,
    pub(crate) id: ConnectionId,
    pub(crate) addr: SocketAddr,
    pub(crate) state: State,
    pub(crate) decoder: Decoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) writer: Arc<SharedWriter>,
    pub(crate) publisher: Arc<ConnectionPublisher>,
    pub(crate) shared: Arc<Shared<H>>,
    torn_down: bool,
}

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: MessageHandler,
{
    /// Allocate an id and register the connection's writer
    pub(crate) fn new(stream: S, addr: SocketAddr, shared: Arc<Shared<H>>) -> Self {
        let id = ConnectionId::next();
        let writer = Arc::new(SharedWriter::new());
        shared.connections.insert(id, writer.clone());
        let publisher = Arc::new(ConnectionPublisher::new(id, shared.connections.clone()));

        debug!("{} accepted from {}", id, addr);

        Self {
            stream,
            id,
            addr,
            state: State::PreConnect,
            decoder: Decoder::new().with_max_packet_size(shared.config.max_packet_size),
            read_buf: BytesMut::with_capacity(4096),
            writer,
            publisher,
            shared,
            torn_down: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Identity once CONNECT succeeded, `-` before
    pub(crate) fn identity(&self) -> &str {
        match &self.state {
            State::PreConnect => "-",
            State::Established { identity } => identity,
        }
    }

    /// Read, dispatch and flush until the peer leaves, a packet closes the
    /// connection, an error occurs or the idle timeout fires.
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let idle_timeout = self.shared.config.idle_timeout;
        let mut idle_deadline = Instant::now() + idle_timeout;

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result? {
                        0 => {
                            debug!("{} [{}] closed by peer", self.id, self.identity());
                            return Ok(());
                        }
                        _ => {
                            idle_deadline = Instant::now() + idle_timeout;
                            let flow = self.process_read_buf();
                            // Acks for packets handled before a failure still go out
                            self.flush().await?;
                            if flow? == Flow::Close {
                                return Ok(());
                            }
                        }
                    }
                }

                // Outbound publishes and close requests
                _ = self.writer.notified() => {
                    self.flush().await?;
                    if !self.writer.is_alive() {
                        debug!("{} [{}] writer closed", self.id, self.identity());
                        return Err(ConnectionError::Shutdown);
                    }
                }

                _ = sleep_until(idle_deadline) => {
                    return Err(ConnectionError::IdleTimeout);
                }
            }
        }
    }

    /// Decode and handle every complete packet in the read buffer
    fn process_read_buf(&mut self) -> Result<Flow, ConnectionError> {
        while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
            self.read_buf.advance(consumed);
            if self.handle_packet(packet)? == Flow::Close {
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    /// Handle an incoming packet
    pub(crate) fn handle_packet(&mut self, packet: Packet) -> Result<Flow, ConnectionError> {
        if let State::PreConnect = self.state {
            if !matches!(packet, Packet::Connect(_)) {
                warn!(
                    "{} from {}: {} before CONNECT",
                    self.id,
                    self.addr,
                    packet.name()
                );
            }
        }

        match packet {
            Packet::Connect(connect) => self.handle_connect(*connect),
            Packet::Publish(publish) => {
                self.handle_publish(publish);
                Ok(Flow::Continue)
            }
            Packet::PubRel(pubrel) => {
                self.handle_pubrel(pubrel);
                Ok(Flow::Continue)
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(subscribe);
                Ok(Flow::Continue)
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(unsubscribe);
                Ok(Flow::Continue)
            }
            Packet::PingReq => {
                self.send(Packet::PingResp);
                Ok(Flow::Continue)
            }
            Packet::Disconnect => {
                debug!("{} [{}] DISCONNECT", self.id, self.identity());
                Ok(Flow::Close)
            }
            other => {
                debug!(
                    "{} [{}] ignoring {}",
                    self.id,
                    self.identity(),
                    other.name()
                );
                Ok(Flow::Continue)
            }
        }
    }

    /// Queue a reply. Failures are logged; the connection carries on.
    pub(crate) fn send(&self, packet: Packet) {
        if let Err(e) = self.writer.send_packet(&packet) {
            warn!(
                "{} [{}] failed to send {}: {}",
                self.id,
                self.identity(),
                packet.name(),
                e
            );
        }
    }

    /// Write everything buffered in the SharedWriter to the socket
    async fn flush(&mut self) -> Result<(), ConnectionError> {
        let data = self.writer.take_buffer();
        if !data.is_empty() {
            self.stream.write_all(&data).await?;
            self.stream.flush().await?;
        }
        Ok(())
    }

    /// Unregister the writer, close it and take the session offline.
    /// Runs once; later calls do nothing.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.shared.connections.remove(self.id);
        self.writer.close();
        self.shared.sessions.offline(self.id);
        debug!("{} [{}] torn down", self.id, self.identity());
    }
}

/// Drive a connection to completion and tear it down
pub(crate) async fn serve<S, H>(
    mut conn: Connection<S, H>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    H: MessageHandler,
{
    let id = conn.id();

    let outcome = {
        let conn_fut = conn.run();
        tokio::pin!(conn_fut);

        tokio::select! {
            biased;

            result = &mut conn_fut => Some(result),
            _ = shutdown_rx.wait_for(|closed| *closed) => None,
        }
    };

    match outcome {
        Some(Ok(())) => {}
        Some(Err(ConnectionError::Io(e))) => info!("{} [{}] I/O error: {}", id, conn.identity(), e),
        Some(Err(ConnectionError::IdleTimeout)) => info!(
            "{} [{}] idle for {:?}, closing",
            id,
            conn.identity(),
            conn.shared.config.idle_timeout
        ),
        Some(Err(ConnectionError::Shutdown)) => debug!("{} shut down", id),
        Some(Err(e)) => warn!("{} [{}] closed: {}", id, conn.identity(), e),
        None => debug!("{} gateway shutting down", id),
    }

    conn.teardown();
}
