//! Inbound message queue
//!
//! Connection tasks hand accepted PUBLISH payloads to a bounded FIFO without
//! ever blocking. One dedicated OS thread drains it into
//! [`MessageHandler::on_message`], so slow application code never stalls
//! socket I/O.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::gateway::{OutboundMessage, PublishError, Publisher};
use crate::hooks::{guarded, MessageHandler};
use crate::session::ConnectionId;


/// Default queue capacity
pub const DEFAULT_CAPACITY: usize = 100_000;

/// An inbound PUBLISH waiting for the application
#[derive(Clone)]
pub struct PendingMessage {
    connection: ConnectionId,
    topic: Arc<str>,
    content: String,
    address: SocketAddr,
    publisher: Arc<dyn Publisher>,
}

impl PendingMessage {
    pub fn new(
        connection: ConnectionId,
        topic: Arc<str>,
        content: String,
        address: SocketAddr,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            connection,
            topic,
            content,
            address,
            publisher,
        }
    }

    /// Connection the message arrived on
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Payload decoded with the gateway charset
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Remote address of the device
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn publisher(&self) -> &Arc<dyn Publisher> {
        &self.publisher
    }

    /// Publish back to the connection this message arrived on
    pub fn reply(&self, topic: &str, content: &str) -> Result<(), PublishError> {
        self.publisher
            .publish(OutboundMessage::new(self.connection, topic, content))
    }
}

impl fmt::Debug for PendingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingMessage")
            .field("connection", &self.connection)
            .field("topic", &self.topic)
            .field("content", &self.content)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Enqueue failure. The rejected message is handed back.
#[derive(Debug)]
pub enum QueueError<T> {
    /// Queue is at capacity
    Full(T),
    /// Worker has shut down
    Closed(T),
}

impl<T> QueueError<T> {
    pub fn into_inner(self) -> T {
        match self {
            QueueError::Full(t) | QueueError::Closed(t) => t,
        }
    }
}

impl<T> fmt::Display for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full(_) => write!(f, "message queue full"),
            QueueError::Closed(_) => write!(f, "message queue closed"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for QueueError<T> {}

impl<T> From<TrySendError<T>> for QueueError<T> {
    fn from(e: TrySendError<T>) -> Self {
        match e {
            TrySendError::Full(t) => QueueError::Full(t),
            TrySendError::Disconnected(t) => QueueError::Closed(t),
        }
    }
}

/// Producer side, cloned into every connection task
#[derive(Clone)]
pub struct MessageQueue {
    sender: Sender<PendingMessage>,
    capacity: usize,
}

impl MessageQueue {
    /// Create a queue holding at most `capacity` messages (0 means default)
    pub fn bounded(capacity: usize) -> (Self, Receiver<PendingMessage>) {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };
        let (sender, receiver) = bounded(capacity);
        (Self { sender, capacity }, receiver)
    }

    /// Add a message without blocking
    pub fn try_enqueue(&self, message: PendingMessage) -> Result<(), QueueError<PendingMessage>> {
        self.sender.try_send(message).map_err(QueueError::from)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages currently waiting
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

/// The single consumer thread
pub struct QueueWorker {
    shutdown: Mutex<Option<Sender<()>>>,
    thread: Option<JoinHandle<()>>,
}

impl QueueWorker {
    /// Start draining `receiver` into `handler` on a new OS thread
    pub fn spawn<H: MessageHandler>(
        receiver: Receiver<PendingMessage>,
        handler: Arc<H>,
    ) -> io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let thread = thread::Builder::new()
            .name("mqttgate-queue".to_string())
            .spawn(move || run(receiver, shutdown_rx, handler))?;

        Ok(Self {
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Some(thread),
        })
    }

    /// Ask the worker to stop. Messages still queued are abandoned.
    pub fn shutdown(&self) {
        // Dropping the sender disconnects the shutdown channel
        self.shutdown.lock().take();
    }

    /// Wait for the worker thread to exit
    pub fn join(mut self) {
        self.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run<H: MessageHandler>(
    receiver: Receiver<PendingMessage>,
    shutdown: Receiver<()>,
    handler: Arc<H>,
) {
    info!("queue worker started");

    loop {
        select! {
            recv(receiver) -> message => match message {
                Ok(message) => {
                    let context = format!("{} topic '{}'", message.connection(), message.topic());
                    guarded("message handler", &context, || handler.on_message(&message));
                }
                // Every producer is gone
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }

    debug!("queue worker abandoning {} message(s)", receiver.len());
    info!("queue worker stopped");
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
