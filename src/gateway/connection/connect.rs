//! CONNECT packet handling

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{Connection, ConnectionError, Flow, State};
use crate::gateway::Publisher;
use crate::hooks::{guarded, MessageHandler};
use crate::protocol::{ConnAck, Connect, Packet, ProtocolError};

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: MessageHandler,
{
    /// Verify, register the session, then acknowledge.
    ///
    /// Also used for a repeated CONNECT on an established connection, which
    /// rebinds the session in place.
    pub(crate) fn handle_connect(&mut self, connect: Connect) -> Result<Flow, ConnectionError> {
        debug!(
            "{} CONNECT from {} (client_id: '{}', level: {:?}, keep_alive: {}s)",
            self.id, self.addr, connect.client_id, connect.protocol_level, connect.keep_alive
        );

        let context = format!("{} client '{}'", self.id, connect.client_id);

        if let Some(verifier) = &self.shared.verifier {
            let accepted = guarded("verifier", &context, || {
                verifier.verify(
                    &connect.client_id,
                    connect.username.as_deref(),
                    connect.password.as_deref(),
                )
            })
            .unwrap_or(false);

            if !accepted {
                warn!(
                    "{} from {}: credentials rejected for client '{}' (user: {:?})",
                    self.id, self.addr, connect.client_id, connect.username
                );
                return Err(ProtocolError::NotAuthorized.into());
            }
        }

        let handler = self.shared.sessions.handler().clone();
        let identity = match guarded("identity mapping", &context, || {
            handler.client_id_to_identity(&connect.client_id)
        }) {
            Some(identity) => identity,
            None => {
                // No session and no CONNACK; the connection stays open
                warn!(
                    "{} from {}: no identity for client '{}', not registered",
                    self.id, self.addr, connect.client_id
                );
                return Ok(Flow::Continue);
            }
        };

        let publisher: Arc<dyn Publisher> = self.publisher.clone();
        self.shared.sessions.online(
            self.addr,
            self.id,
            &identity,
            connect.username,
            connect.password,
            publisher,
        );

        self.state = State::Established {
            identity: Arc::from(identity),
        };

        self.send(Packet::ConnAck(ConnAck::accepted()));
        Ok(Flow::Continue)
    }
}
