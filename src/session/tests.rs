//! Session registry tests

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use super::*;
use crate::gateway::{OutboundMessage, PublishError, Publisher};
use crate::hooks::MessageHandler;
use crate::queue::PendingMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Online(String, ConnectionId),
    Offline(String, ConnectionId),
}

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<Event>>,
    panic_on_online: bool,
}

impl MessageHandler for RecordingHandler {
    type Extension = u32;

    fn on_message(&self, _message: &PendingMessage) {}

    fn online(&self, identity: &str, session: &mut Session<u32>) {
        session.extension += 1;
        self.events
            .lock()
            .push(Event::Online(identity.to_string(), session.connection()));
        if self.panic_on_online {
            panic!("listener failure");
        }
    }

    fn offline(&self, identity: &str, session: &Session<u32>) {
        self.events
            .lock()
            .push(Event::Offline(identity.to_string(), session.connection()));
    }
}

/// Publisher that records what it was asked to send
#[derive(Default)]
struct CapturePublisher {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl Publisher for CapturePublisher {
    fn publish(&self, message: OutboundMessage) -> Result<(), PublishError> {
        self.sent.lock().push(message);
        Ok(())
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], port))
}

fn registry() -> SessionRegistry<RecordingHandler> {
    SessionRegistry::new(Arc::new(RecordingHandler::default()))
}

fn online(
    registry: &SessionRegistry<RecordingHandler>,
    connection: ConnectionId,
    identity: &str,
) -> SessionRef<u32> {
    registry.online(
        addr(1883),
        connection,
        identity,
        None,
        None,
        Arc::new(CapturePublisher::default()),
    )
}

fn assert_consistent(registry: &SessionRegistry<RecordingHandler>) {
    assert_eq!(registry.len(), registry.connection_count());
    for entry in registry.by_connection.iter() {
        let session = entry.value();
        assert_eq!(session.read().connection(), *entry.key());
        let primary = registry
            .lookup(session.read().identity())
            .expect("secondary entry without primary");
        assert!(Arc::ptr_eq(&primary, session));
    }
}

#[test]
fn test_connection_id_display() {
    assert_eq!(ConnectionId::from_raw(255).to_string(), "conn-ff");
    let a = ConnectionId::next();
    let b = ConnectionId::next();
    assert!(b > a);
}

#[test]
fn test_first_online_creates_session() {
    let registry = registry();
    let conn = ConnectionId::from_raw(1);

    let session = registry.online(
        addr(5000),
        conn,
        "dev1",
        Some("user".to_string()),
        Some(Bytes::from_static(b"pw")),
        Arc::new(CapturePublisher::default()),
    );

    {
        let s = session.read();
        assert_eq!(s.identity(), "dev1");
        assert_eq!(s.connection(), conn);
        assert_eq!(s.address(), addr(5000));
        assert_eq!(s.username(), Some("user"));
        assert_eq!(s.password().map(|p| &p[..]), Some(&b"pw"[..]));
        assert_eq!(s.extension, 1);
    }

    assert_eq!(registry.len(), 1);
    assert!(Arc::ptr_eq(&registry.lookup("dev1").unwrap(), &session));
    assert!(Arc::ptr_eq(
        &registry.lookup_connection(conn).unwrap(),
        &session
    ));
    assert_eq!(
        *registry.handler().events.lock(),
        vec![Event::Online("dev1".to_string(), conn)]
    );
}

#[test]
fn test_reconnect_rebinds_in_place() {
    let registry = registry();
    let c1 = ConnectionId::from_raw(1);
    let c2 = ConnectionId::from_raw(2);

    let first = online(&registry, c1, "dev1");
    let refreshed = first.read().refreshed_at();
    let second = registry.online(
        addr(6000),
        c2,
        "dev1",
        Some("other".to_string()),
        None,
        Arc::new(CapturePublisher::default()),
    );

    assert!(Arc::ptr_eq(&first, &second));
    let s = second.read();
    assert_eq!(s.connection(), c2);
    assert_eq!(s.address(), addr(6000));
    assert_eq!(s.username(), Some("other"));
    assert!(s.refreshed_at() >= refreshed);
    // Extension survives the rebind
    assert_eq!(s.extension, 2);
    drop(s);

    assert_eq!(registry.len(), 1);
    assert!(registry.lookup_connection(c1).is_none());
    assert!(registry.lookup_connection(c2).is_some());
    assert_consistent(&registry);
}

#[test]
fn test_stale_offline_after_reconnect_is_noop() {
    let registry = registry();
    let c1 = ConnectionId::from_raw(1);
    let c2 = ConnectionId::from_raw(2);

    online(&registry, c1, "dev1");
    online(&registry, c2, "dev1");

    // Old connection's teardown arrives late
    assert!(registry.offline(c1).is_none());

    let session = registry.lookup("dev1").expect("session survives");
    assert_eq!(session.read().connection(), c2);
    assert_eq!(
        *registry.handler().events.lock(),
        vec![
            Event::Online("dev1".to_string(), c1),
            Event::Online("dev1".to_string(), c2),
        ]
    );
}

#[test]
fn test_offline_removes_both_entries_once() {
    let registry = registry();
    let c1 = ConnectionId::from_raw(1);

    online(&registry, c1, "dev1");
    let removed = registry.offline(c1).expect("was online");
    assert_eq!(removed.read().identity(), "dev1");

    assert!(registry.is_empty());
    assert!(registry.lookup("dev1").is_none());
    assert!(registry.lookup_connection(c1).is_none());

    // Second teardown is a no-op
    assert!(registry.offline(c1).is_none());
    let offline_events = registry
        .handler()
        .events
        .lock()
        .iter()
        .filter(|e| matches!(e, Event::Offline(..)))
        .count();
    assert_eq!(offline_events, 1);
}

#[test]
fn test_offline_unknown_connection() {
    let registry = registry();
    assert!(registry.offline(ConnectionId::from_raw(42)).is_none());
    assert!(registry.handler().events.lock().is_empty());
}

#[test]
fn test_repeated_connect_same_connection() {
    let registry = registry();
    let c1 = ConnectionId::from_raw(1);

    let a = online(&registry, c1, "dev1");
    let b = online(&registry, c1, "dev1");

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.connection_count(), 1);
    assert_consistent(&registry);
}

#[test]
fn test_connection_switches_identity() {
    let registry = registry();
    let c1 = ConnectionId::from_raw(1);

    online(&registry, c1, "dev1");
    online(&registry, c1, "dev2");

    assert!(registry.lookup("dev1").is_none());
    assert_eq!(
        registry
            .lookup_connection(c1)
            .unwrap()
            .read()
            .identity(),
        "dev2"
    );
    assert_consistent(&registry);
    assert_eq!(
        *registry.handler().events.lock(),
        vec![
            Event::Online("dev1".to_string(), c1),
            Event::Offline("dev1".to_string(), c1),
            Event::Online("dev2".to_string(), c1),
        ]
    );
}

#[test]
fn test_listener_panic_is_contained() {
    let registry = SessionRegistry::new(Arc::new(RecordingHandler {
        panic_on_online: true,
        ..Default::default()
    }));
    let c1 = ConnectionId::from_raw(1);

    let session = online(&registry, c1, "dev1");
    assert_eq!(session.read().identity(), "dev1");
    assert_eq!(registry.len(), 1);

    assert!(registry.offline(c1).is_some());
}

#[test]
fn test_session_publish_uses_current_connection() {
    let registry = registry();
    let publisher = Arc::new(CapturePublisher::default());
    let c7 = ConnectionId::from_raw(7);

    let session = registry.online(addr(1), c7, "dev1", None, None, publisher.clone());
    session.read().publish("t_reply", "hi").unwrap();

    let sent = publisher.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].connection, c7);
    assert_eq!(sent[0].topic, "t_reply");
    assert_eq!(sent[0].content, "hi");
}

#[test]
fn test_identities() {
    let registry = registry();
    online(&registry, ConnectionId::from_raw(1), "a");
    online(&registry, ConnectionId::from_raw(2), "b");

    let identities: HashSet<String> = registry
        .identities()
        .iter()
        .map(|i| i.to_string())
        .collect();
    assert_eq!(
        identities,
        HashSet::from(["a".to_string(), "b".to_string()])
    );
}

#[test]
fn test_concurrent_reconnect_and_teardown() {
    let registry = Arc::new(registry());
    let threads = 8;
    let rounds = 200;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let registry = registry.clone();
            thread::spawn(move || {
                let identity = format!("dev{}", t);
                let mut previous: Option<ConnectionId> = None;
                for _ in 0..rounds {
                    let conn = ConnectionId::next();
                    online(&registry, conn, &identity);
                    // Teardown of the superseded connection lands after the reconnect
                    if let Some(old) = previous.take() {
                        assert!(registry.offline(old).is_none());
                    }
                    let live = registry.lookup(&identity).expect("session must survive");
                    assert_eq!(live.read().connection(), conn);
                    previous = Some(conn);
                }
                previous
            })
        })
        .collect();

    let last: Vec<ConnectionId> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    assert_eq!(registry.len(), threads);
    assert_consistent(&registry);

    for conn in last {
        assert!(registry.offline(conn).is_some());
    }
    assert!(registry.is_empty());
    assert_eq!(registry.connection_count(), 0);
}

#[derive(Debug, Clone)]
enum Op {
    Online(u64, u8),
    Offline(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..6, 0u8..3).prop_map(|(c, i)| Op::Online(c, i)),
        (0u64..6).prop_map(Op::Offline),
    ]
}

proptest! {
    #[test]
    fn prop_indices_stay_consistent(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let registry = registry();

        for op in ops {
            match op {
                Op::Online(c, i) => {
                    let conn = ConnectionId::from_raw(c);
                    let identity = format!("dev{}", i);
                    online(&registry, conn, &identity);

                    let session = registry.lookup(&identity).unwrap();
                    prop_assert_eq!(session.read().connection(), conn);
                    prop_assert!(Arc::ptr_eq(&registry.lookup_connection(conn).unwrap(), &session));
                }
                Op::Offline(c) => {
                    let conn = ConnectionId::from_raw(c);
                    registry.offline(conn);
                    prop_assert!(registry.lookup_connection(conn).is_none());
                }
            }
            assert_consistent(&registry);
        }
    }
}
