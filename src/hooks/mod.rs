//! Hooks Module
//!
//! Extension points the application plugs into the gateway: credential
//! verification on CONNECT and the message handler that consumes inbound
//! payloads and observes sessions coming and going.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::queue::PendingMessage;
use crate::session::Session;


/// Decides whether a CONNECT is admitted
///
/// A gateway without a verifier admits every client.
pub trait Verifier: Send + Sync {
    /// Called once per CONNECT with the credentials exactly as received
    fn verify(&self, client_id: &str, username: Option<&str>, password: Option<&[u8]>) -> bool;
}

impl<F> Verifier for F
where
    F: Fn(&str, Option<&str>, Option<&[u8]>) -> bool + Send + Sync,
{
    fn verify(&self, client_id: &str, username: Option<&str>, password: Option<&[u8]>) -> bool {
        self(client_id, username, password)
    }
}

/// Application side of the gateway
///
/// `on_message` runs on the single queue worker thread, in arrival order.
/// `online` and `offline` run on the connection task that caused the
/// transition, serialized with every other transition. A panic in any of
/// these is caught and logged; the gateway keeps going.
pub trait MessageHandler: Send + Sync + 'static {
    /// Per-session state owned by the application
    type Extension: Default + Send + Sync + 'static;

    /// An inbound PUBLISH, already acknowledged to the device
    fn on_message(&self, message: &PendingMessage);

    /// A session was created or its connection replaced
    fn online(&self, _identity: &str, _session: &mut Session<Self::Extension>) {}

    /// The session's current connection went away
    fn offline(&self, _identity: &str, _session: &Session<Self::Extension>) {}

    /// Map a CONNECT client id to the session identity
    fn client_id_to_identity(&self, client_id: &str) -> String {
        client_id.to_string()
    }
}

impl<H: MessageHandler> MessageHandler for Arc<H> {
    type Extension = H::Extension;

    fn on_message(&self, message: &PendingMessage) {
        (**self).on_message(message)
    }

    fn online(&self, identity: &str, session: &mut Session<Self::Extension>) {
        (**self).online(identity, session)
    }

    fn offline(&self, identity: &str, session: &Session<Self::Extension>) {
        (**self).offline(identity, session)
    }

    fn client_id_to_identity(&self, client_id: &str) -> String {
        (**self).client_id_to_identity(client_id)
    }
}

/// Run application code, turning a panic into `None` and an error log line
pub(crate) fn guarded<R>(hook: &'static str, context: &str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => Some(r),
        Err(payload) => {
            error!("{} panicked ({}): {}", hook, context, panic_message(&*payload));
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
