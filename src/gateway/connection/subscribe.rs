//! SUBSCRIBE and UNSUBSCRIBE handling
//!
//! Delivery is addressed by connection, not topic, so nothing is recorded.
//! Every requested QoS is granted as asked.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::Connection;
use crate::hooks::MessageHandler;
use crate::protocol::{Packet, SubAck, SubAckReturnCode, Subscribe, UnsubAck, Unsubscribe};

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: MessageHandler,
{
    pub(crate) fn handle_subscribe(&mut self, subscribe: Subscribe) {
        debug!(
            "{} [{}] SUBSCRIBE id={} {:?}",
            self.id,
            self.identity(),
            subscribe.packet_id,
            subscribe
                .subscriptions
                .iter()
                .map(|s| s.filter.as_str())
                .collect::<Vec<_>>()
        );

        let return_codes = subscribe
            .subscriptions
            .iter()
            .map(|s| SubAckReturnCode::Granted(s.qos))
            .collect();

        self.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }));
    }

    pub(crate) fn handle_unsubscribe(&mut self, unsubscribe: Unsubscribe) {
        debug!(
            "{} [{}] UNSUBSCRIBE id={} {:?}",
            self.id,
            self.identity(),
            unsubscribe.packet_id,
            unsubscribe.filters
        );

        self.send(Packet::UnsubAck(UnsubAck::new(unsubscribe.packet_id)));
    }
}
