//! Per-connection outbound buffer.
//!
//! Acks from the connection task and publishes from any other thread are
//! serialized into one buffer; the connection task flushes it to the socket.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::codec::Encoder;
use crate::protocol::{EncodeError, Packet};

/// Error when sending to a SharedWriter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Connection is closed
    Closed,
    /// Packet could not be encoded
    Encode(EncodeError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed => write!(f, "connection closed"),
            SendError::Encode(e) => write!(f, "encode error: {}", e),
        }
    }
}

impl std::error::Error for SendError {}

/// Shared write buffer for one connection
pub struct SharedWriter {
    /// Encoded bytes waiting to be written
    buffer: Mutex<BytesMut>,
    /// Wakes the connection loop when the buffer goes non-empty or on close
    notify: Notify,
    encoder: Encoder,
    alive: AtomicBool,
}

impl SharedWriter {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(BytesMut::with_capacity(1024)),
            notify: Notify::new(),
            encoder: Encoder::new(),
            alive: AtomicBool::new(true),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the connection closed and wake its loop
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Take all pending data from the buffer
    pub fn take_buffer(&self) -> BytesMut {
        self.buffer.lock().split()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Encode `packet` onto the end of the buffer
    pub fn send_packet(&self, packet: &Packet) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }

        let was_empty = {
            let mut buffer = self.buffer.lock();
            let start_len = buffer.len();
            if let Err(e) = self.encoder.encode(packet, &mut buffer) {
                buffer.truncate(start_len);
                return Err(SendError::Encode(e));
            }
            start_len == 0
        };

        // Coalesce wakeups during bursts
        if was_empty {
            self.notify.notify_one();
        }
        Ok(())
    }
}

impl Default for SharedWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWriter")
            .field("buffer_len", &self.buffer_len())
            .field("alive", &self.is_alive())
            .finish()
    }
}
