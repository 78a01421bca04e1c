//! Device session tracking
//!
//! One [`Session`] per device identity, indexed both by identity and by the
//! connection currently carrying it. All online/offline transitions go
//! through one registry-wide mutex so the two indices never disagree.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::gateway::{OutboundMessage, PublishError, Publisher};
use crate::hooks::{guarded, MessageHandler};

#[cfg(test)]
mod tests;

/// Process-unique handle for one accepted transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next id. Ids are never reused within a process.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{:x}", self.0)
    }
}

/// Shared handle to a session
pub type SessionRef<T> = Arc<RwLock<Session<T>>>;

/// Live state of one device
pub struct Session<T> {
    identity: Arc<str>,
    connection: ConnectionId,
    address: SocketAddr,
    username: Option<String>,
    password: Option<Bytes>,
    refreshed_at: SystemTime,
    publisher: Arc<dyn Publisher>,
    /// Application-owned state, created with `T::default()`
    pub extension: T,
}

impl<T: Default> Session<T> {
    fn new(
        identity: Arc<str>,
        connection: ConnectionId,
        address: SocketAddr,
        username: Option<String>,
        password: Option<Bytes>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            identity,
            connection,
            address,
            username,
            password,
            refreshed_at: SystemTime::now(),
            publisher,
            extension: T::default(),
        }
    }
}

impl<T> Session<T> {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Most recently accepted connection for this identity
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&Bytes> {
        self.password.as_ref()
    }

    /// Time of the last CONNECT for this identity
    pub fn refreshed_at(&self) -> SystemTime {
        self.refreshed_at
    }

    pub fn publisher(&self) -> &Arc<dyn Publisher> {
        &self.publisher
    }

    /// Send `content` to this session's current connection
    pub fn publish(&self, topic: &str, content: &str) -> Result<(), PublishError> {
        self.publisher
            .publish(OutboundMessage::new(self.connection, topic, content))
    }

    fn rebind(
        &mut self,
        connection: ConnectionId,
        address: SocketAddr,
        username: Option<String>,
        password: Option<Bytes>,
        publisher: Arc<dyn Publisher>,
    ) {
        self.connection = connection;
        self.address = address;
        self.username = username;
        self.password = password;
        self.refreshed_at = SystemTime::now();
        self.publisher = publisher;
    }
}

impl<T> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("connection", &self.connection)
            .field("address", &self.address)
            .field("username", &self.username)
            .field("refreshed_at", &self.refreshed_at)
            .finish_non_exhaustive()
    }
}

/// Identity and connection indices over live sessions
///
/// Invariant: every `by_connection` entry points at a session whose
/// `connection` equals the key, and that session is the `by_identity` entry
/// for its identity.
pub struct SessionRegistry<H: MessageHandler> {
    by_identity: DashMap<Arc<str>, SessionRef<H::Extension>>,
    by_connection: DashMap<ConnectionId, SessionRef<H::Extension>>,
    /// Serializes online/offline. Reads go straight to the maps.
    transitions: Mutex<()>,
    handler: Arc<H>,
}

impl<H: MessageHandler> SessionRegistry<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            by_identity: DashMap::new(),
            by_connection: DashMap::new(),
            transitions: Mutex::new(()),
            handler,
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Register `connection` as the live connection for `identity`.
    ///
    /// Creates the session on first sight of the identity, otherwise
    /// rebinds the existing one and drops the index entry of the connection
    /// it replaces. `MessageHandler::online` runs before this returns; it
    /// must not call back into `online` or `offline`.
    pub fn online(
        &self,
        address: SocketAddr,
        connection: ConnectionId,
        identity: &str,
        username: Option<String>,
        password: Option<Bytes>,
        publisher: Arc<dyn Publisher>,
    ) -> SessionRef<H::Extension> {
        let _transition = self.transitions.lock();

        // A connection speaks for one identity at a time. A second CONNECT
        // with a different client id retires the first identity.
        let bound = self
            .by_connection
            .get(&connection)
            .map(|entry| entry.value().clone());
        if let Some(bound) = bound {
            if bound.read().identity() != identity {
                self.by_connection.remove(&connection);
                self.retire(&bound);
            }
        }

        let existing = self
            .by_identity
            .get(identity)
            .map(|entry| entry.value().clone());

        let session = match existing {
            Some(session) => {
                if !self.by_connection.contains_key(&connection) {
                    let previous = session.read().connection();
                    if previous != connection {
                        self.by_connection
                            .remove_if(&previous, |_, s| Arc::ptr_eq(s, &session));
                        debug!(
                            "{} replaces {} for '{}'",
                            connection, previous, identity
                        );
                    }
                    self.by_connection.insert(connection, session.clone());
                }
                session
                    .write()
                    .rebind(connection, address, username, password, publisher);
                session
            }
            None => {
                let identity: Arc<str> = Arc::from(identity);
                let session = Arc::new(RwLock::new(Session::new(
                    identity.clone(),
                    connection,
                    address,
                    username,
                    password,
                    publisher,
                )));
                self.by_identity.insert(identity, session.clone());
                self.by_connection.insert(connection, session.clone());
                session
            }
        };

        info!("'{}' online on {} from {}", identity, connection, address);

        {
            let mut guard = session.write();
            let context = format!("{} '{}'", connection, identity);
            guarded("online listener", &context, || {
                self.handler.online(identity, &mut guard)
            });
        }

        session
    }

    /// Drop `connection` from the registry.
    ///
    /// Does nothing unless `connection` is still the live connection of some
    /// session, so a late teardown of a superseded connection leaves the
    /// newer session alone. Idempotent.
    pub fn offline(&self, connection: ConnectionId) -> Option<SessionRef<H::Extension>> {
        let _transition = self.transitions.lock();

        let (_, session) = self.by_connection.remove(&connection)?;
        self.retire(&session);
        Some(session)
    }

    /// Remove `session` from the identity index and tell the handler.
    /// Caller holds `transitions` and has already dropped its connection entry.
    fn retire(&self, session: &SessionRef<H::Extension>) {
        let guard = session.read();
        let identity = guard.identity.clone();
        self.by_identity
            .remove_if(&identity, |_, s| Arc::ptr_eq(s, session));

        info!("'{}' offline from {}", identity, guard.connection());

        let context = format!("{} '{}'", guard.connection(), identity);
        guarded("offline listener", &context, || {
            self.handler.offline(&identity, &guard)
        });
    }

    /// Session for `identity`, if online
    pub fn lookup(&self, identity: &str) -> Option<SessionRef<H::Extension>> {
        self.by_identity
            .get(identity)
            .map(|entry| entry.value().clone())
    }

    /// Session whose live connection is `connection`
    pub fn lookup_connection(&self, connection: ConnectionId) -> Option<SessionRef<H::Extension>> {
        self.by_connection
            .get(&connection)
            .map(|entry| entry.value().clone())
    }

    /// Identities of all live sessions, in no particular order
    pub fn identities(&self) -> Vec<Arc<str>> {
        self.by_identity
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }

    /// Number of connection index entries. Equals `len()` between transitions.
    pub fn connection_count(&self) -> usize {
        self.by_connection.len()
    }
}
