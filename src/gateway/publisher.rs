//! Outbound publish path
//!
//! Any thread may push a QoS 0 PUBLISH to a device by connection id. The
//! packet is encoded straight into that connection's [`SharedWriter`].

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use super::writer::{SendError, SharedWriter};
use crate::charset::Charset;
use crate::protocol::{EncodeError, Packet, Publish};
use crate::session::ConnectionId;

/// A message for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub connection: ConnectionId,
    pub topic: String,
    pub content: String,
}

impl OutboundMessage {
    pub fn new(
        connection: ConnectionId,
        topic: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            topic: topic.into(),
            content: content.into(),
        }
    }
}

/// Why an outbound message was not sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Topic or content was empty
    EmptyField(&'static str),
    /// No live connection with this id
    NotConnected(ConnectionId),
    /// The connection is shutting down
    Closed(ConnectionId),
    /// The PUBLISH could not be encoded
    Encode(EncodeError),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::EmptyField(field) => write!(f, "{} must not be empty", field),
            PublishError::NotConnected(id) => write!(f, "{} is not connected", id),
            PublishError::Closed(id) => write!(f, "{} is closed", id),
            PublishError::Encode(e) => write!(f, "encode error: {}", e),
        }
    }
}

impl std::error::Error for PublishError {}

/// Sends messages to devices
pub trait Publisher: Send + Sync {
    fn publish(&self, message: OutboundMessage) -> Result<(), PublishError>;
}

/// Live connection writers by id
pub struct ConnectionTable {
    writers: DashMap<ConnectionId, Arc<SharedWriter>>,
    charset: Charset,
}

impl ConnectionTable {
    pub fn new(charset: Charset) -> Self {
        Self {
            writers: DashMap::new(),
            charset,
        }
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    pub fn insert(&self, connection: ConnectionId, writer: Arc<SharedWriter>) {
        self.writers.insert(connection, writer);
    }

    pub fn remove(&self, connection: ConnectionId) -> Option<Arc<SharedWriter>> {
        self.writers.remove(&connection).map(|(_, writer)| writer)
    }

    pub fn get(&self, connection: ConnectionId) -> Option<Arc<SharedWriter>> {
        self.writers
            .get(&connection)
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.writers.contains_key(&connection)
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    /// Close every live writer. Connection tasks tear themselves down.
    pub fn close_all(&self) {
        for entry in self.writers.iter() {
            entry.value().close();
        }
    }
}

impl Publisher for ConnectionTable {
    fn publish(&self, message: OutboundMessage) -> Result<(), PublishError> {
        let OutboundMessage {
            connection,
            topic,
            content,
        } = message;

        if topic.is_empty() {
            warn!("{}: dropping outbound message with empty topic", connection);
            return Err(PublishError::EmptyField("topic"));
        }
        if content.is_empty() {
            warn!(
                "{}: dropping outbound message with empty content on '{}'",
                connection, topic
            );
            return Err(PublishError::EmptyField("content"));
        }

        let Some(writer) = self.get(connection) else {
            warn!("{}: not connected, dropping message on '{}'", connection, topic);
            return Err(PublishError::NotConnected(connection));
        };

        let packet = Packet::Publish(Publish {
            topic: Arc::from(topic.as_str()),
            payload: self.charset.encode(&content),
            ..Default::default()
        });

        match writer.send_packet(&packet) {
            Ok(()) => {
                debug!("{}: queued PUBLISH on '{}'", connection, topic);
                Ok(())
            }
            Err(SendError::Closed) => Err(PublishError::Closed(connection)),
            Err(SendError::Encode(e)) => {
                warn!("{}: cannot encode PUBLISH on '{}': {}", connection, topic, e);
                Err(PublishError::Encode(e))
            }
        }
    }
}

/// Publisher handed to the application with each session and message
#[derive(Clone)]
pub struct ConnectionPublisher {
    connection: ConnectionId,
    table: Arc<ConnectionTable>,
}

impl ConnectionPublisher {
    pub fn new(connection: ConnectionId, table: Arc<ConnectionTable>) -> Self {
        Self { connection, table }
    }

    /// Connection this publisher was created for
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Publish to [`Self::connection`]
    pub fn reply(&self, topic: &str, content: &str) -> Result<(), PublishError> {
        self.publish(OutboundMessage::new(self.connection, topic, content))
    }
}

impl Publisher for ConnectionPublisher {
    /// Routed by `message.connection`, which need not be this publisher's own
    fn publish(&self, message: OutboundMessage) -> Result<(), PublishError> {
        self.table.publish(message)
    }
}

impl fmt::Debug for ConnectionPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPublisher")
            .field("connection", &self.connection)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoder;
    use pretty_assertions::assert_eq;

    fn table_with(connection: ConnectionId) -> (Arc<ConnectionTable>, Arc<SharedWriter>) {
        let table = Arc::new(ConnectionTable::new(Charset::Utf8));
        let writer = Arc::new(SharedWriter::new());
        table.insert(connection, writer.clone());
        (table, writer)
    }

    #[test]
    fn test_publish_writes_qos0_packet() {
        let c1 = ConnectionId::from_raw(1);
        let (table, writer) = table_with(c1);
        let publisher = ConnectionPublisher::new(c1, table);

        publisher.reply("t_reply", "hi").unwrap();

        let bytes = writer.take_buffer();
        let mut expected = vec![0x30, 0x0B, 0x00, 0x07];
        expected.extend_from_slice(b"t_reply");
        expected.extend_from_slice(b"hi");
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn test_publish_uses_charset() {
        let c1 = ConnectionId::from_raw(1);
        let table = ConnectionTable::new(Charset::Latin1);
        let writer = Arc::new(SharedWriter::new());
        table.insert(c1, writer.clone());

        table.publish(OutboundMessage::new(c1, "t", "é")).unwrap();

        let bytes = writer.take_buffer();
        let (packet, _) = Decoder::new().decode(&bytes).unwrap().unwrap();
        match packet {
            Packet::Publish(p) => assert_eq!(&p.payload[..], &[0xE9]),
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_fields_rejected() {
        let c1 = ConnectionId::from_raw(1);
        let (table, writer) = table_with(c1);

        assert_eq!(
            table.publish(OutboundMessage::new(c1, "", "x")),
            Err(PublishError::EmptyField("topic"))
        );
        assert_eq!(
            table.publish(OutboundMessage::new(c1, "t", "")),
            Err(PublishError::EmptyField("content"))
        );
        assert_eq!(writer.buffer_len(), 0);
    }

    #[test]
    fn test_unknown_connection() {
        let (table, _writer) = table_with(ConnectionId::from_raw(1));
        let other = ConnectionId::from_raw(2);
        assert_eq!(
            table.publish(OutboundMessage::new(other, "t", "x")),
            Err(PublishError::NotConnected(other))
        );
    }

    #[test]
    fn test_closed_writer() {
        let c1 = ConnectionId::from_raw(1);
        let (table, writer) = table_with(c1);
        writer.close();
        assert_eq!(
            table.publish(OutboundMessage::new(c1, "t", "x")),
            Err(PublishError::Closed(c1))
        );
    }

    #[test]
    fn test_publisher_routes_by_message_connection() {
        let c1 = ConnectionId::from_raw(1);
        let c2 = ConnectionId::from_raw(2);
        let (table, w1) = table_with(c1);
        let w2 = Arc::new(SharedWriter::new());
        table.insert(c2, w2.clone());

        let publisher = ConnectionPublisher::new(c1, table.clone());
        publisher
            .publish(OutboundMessage::new(c2, "t", "x"))
            .unwrap();

        assert_eq!(w1.buffer_len(), 0);
        assert!(w2.buffer_len() > 0);

        assert!(table.remove(c2).is_some());
        assert_eq!(
            publisher.publish(OutboundMessage::new(c2, "t", "x")),
            Err(PublishError::NotConnected(c2))
        );
    }

    #[test]
    fn test_concurrent_publishers_do_not_interleave() {
        let c1 = ConnectionId::from_raw(1);
        let (table, writer) = table_with(c1);

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for n in 0..50 {
                        table
                            .publish(OutboundMessage::new(c1, format!("t{}", t), format!("{}", n)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let bytes = writer.take_buffer();
        let decoder = Decoder::new();
        let mut pos = 0;
        let mut count = 0;
        while pos < bytes.len() {
            let (packet, used) = decoder.decode(&bytes[pos..]).unwrap().unwrap();
            assert!(matches!(packet, Packet::Publish(_)));
            pos += used;
            count += 1;
        }
        assert_eq!(count, 200);
    }
}
