//! PUBLISH and PUBREL handling

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::Connection;
use crate::hooks::MessageHandler;
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS};
use crate::queue::{PendingMessage, QueueError};

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: MessageHandler,
{
    /// Acknowledge per QoS, then hand the payload to the queue.
    ///
    /// The ack is not withdrawn if the queue turns the message away.
    pub(crate) fn handle_publish(&mut self, publish: Publish) {
        debug!(
            "{} [{}] PUBLISH '{}' qos={:?} id={:?} ({} bytes)",
            self.id,
            self.identity(),
            publish.topic,
            publish.qos,
            publish.packet_id,
            publish.payload.len()
        );

        let content = self.shared.config.charset.decode(&publish.payload);

        // No QoS 2 state is kept: PUBREC now, PUBCOMP on whatever PUBREL arrives
        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(id)) => self.send(Packet::PubAck(PubAck::new(id))),
            (QoS::ExactlyOnce, Some(id)) => self.send(Packet::PubRec(PubRec::new(id))),
            _ => {}
        }

        let message = PendingMessage::new(
            self.id,
            publish.topic,
            content,
            self.addr,
            self.publisher.clone(),
        );

        match self.shared.queue.try_enqueue(message) {
            Ok(()) => {}
            Err(QueueError::Full(m)) => warn!(
                "{} [{}] message queue full ({}), dropping message on '{}'",
                self.id,
                self.identity(),
                self.shared.queue.capacity(),
                m.topic()
            ),
            Err(QueueError::Closed(m)) => warn!(
                "{} [{}] message queue closed, dropping message on '{}'",
                self.id,
                self.identity(),
                m.topic()
            ),
        }
    }

    pub(crate) fn handle_pubrel(&mut self, pubrel: PubRel) {
        self.send(Packet::PubComp(PubComp::new(pubrel.packet_id)));
    }
}
