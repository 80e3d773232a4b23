//! Loopback integration tests exercising the library end-to-end: a client
//! talking to another client, a client talking to a backend, and the
//! dedup/connect-failure properties a bare unit test can't reach without a
//! real socket pair.
//!
//! There is no reference server in this crate, so each test spins up a tiny
//! relay of its own: a thread per accepted connection that remembers which
//! peer id arrived on which socket (learned from each envelope's
//! `from_peer`, without needing to understand the welcome payload) and
//! forwards by `to` when set, or broadcasts to every other peer when not —
//! enough to stand in for a multiplexer server for these scenarios.

use bytes::Bytes;
use multiplexer::envelope::message_types;
use multiplexer::frame::{encode_frame, Deframer};
use multiplexer::{
    Backend, BackendContext, BackendReply, Client, ClientConfig, ConnectionsManager, Envelope,
    ManagerConfig, MultiplexerError, SendTarget,
};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type PeerTable = Arc<Mutex<HashMap<u64, TcpStream>>>;

static RELAY_WELCOME_IDS: AtomicU64 = AtomicU64::new(1);

/// Sends a `CONNECTION_WELCOME` to a freshly accepted connection, standing in
/// for the real multiplexer server's handshake — every test relay must do
/// this before anything else, since a client's connect future now only
/// resolves once this arrives.
fn send_welcome(stream: &mut TcpStream) {
    let id = RELAY_WELCOME_IDS.fetch_add(1, Ordering::Relaxed);
    let welcome = Envelope::new(id, 0, None, message_types::CONNECTION_WELCOME);
    let _ = stream.write_all(&encode_frame(&welcome.to_bytes()));
}

/// Forwards every non-welcome envelope by `to` if set, else to every other
/// known peer. Registers the sending peer's id on its first envelope.
fn spawn_relay(listener: TcpListener) {
    let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            let peers = Arc::clone(&peers);
            thread::spawn(move || relay_connection(stream, peers));
        }
    });
}

fn relay_connection(mut stream: TcpStream, peers: PeerTable) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    send_welcome(&mut stream);
    let mut reader = stream.try_clone().expect("clone stream for reading");
    let mut deframer = Deframer::new();
    let mut buf = [0u8; 4096];
    let mut registered: Option<u64> = None;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for result in deframer.push(Bytes::copy_from_slice(&buf[..n])) {
            let Ok(mut contents) = result else { continue };
            let Some(envelope) = Envelope::decode(&mut contents) else {
                continue;
            };
            if registered.is_none() {
                registered = Some(envelope.from_peer);
                if let Ok(clone) = stream.try_clone() {
                    peers.lock().unwrap().insert(envelope.from_peer, clone);
                }
            }
            if envelope.message_type != message_types::CONNECTION_WELCOME {
                route(&envelope, registered.unwrap(), &peers);
            }
        }
    }
    if let Some(id) = registered {
        peers.lock().unwrap().remove(&id);
    }
}

fn route(envelope: &Envelope, from: u64, peers: &PeerTable) {
    let frame = encode_frame(&envelope.to_bytes());
    let mut table = peers.lock().unwrap();
    match envelope.to {
        Some(target) => {
            if let Some(sock) = table.get_mut(&target) {
                let _ = sock.write_all(&frame);
            }
        }
        None => {
            for (id, sock) in table.iter_mut() {
                if *id != from {
                    let _ = sock.write_all(&frame);
                }
            }
        }
    }
}

/// A relay with exactly one expected peer that echoes every non-welcome
/// envelope straight back to its sender — stands in for a server that also
/// counts its own publisher among an event's subscribers.
fn spawn_echo_relay(listener: TcpListener) {
    thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
        send_welcome(&mut stream);
        let mut reader = stream.try_clone().expect("clone stream for reading");
        let mut writer = stream;
        let mut deframer = Deframer::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for result in deframer.push(Bytes::copy_from_slice(&buf[..n])) {
                let Ok(mut contents) = result else { continue };
                let Some(envelope) = Envelope::decode(&mut contents) else {
                    continue;
                };
                if envelope.message_type == message_types::CONNECTION_WELCOME {
                    continue;
                }
                let frame = encode_frame(&envelope.to_bytes());
                if writer.write_all(&frame).is_err() {
                    return;
                }
            }
        }
    });
}

fn local_listener() -> (TcpListener, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Scenario 1: two clients on the same relay; a direct send addressed by
/// `to` is observed by the recipient with the sender's id preserved.
#[test]
fn direct_send_between_two_clients_preserves_sender_identity() {
    let (listener, addr) = local_listener();
    spawn_relay(listener);

    let a = Client::new(ClientConfig::default()).unwrap();
    let b = Client::new(ClientConfig::default()).unwrap();
    a.connect(addr, Some(Duration::from_secs(2))).unwrap();
    b.connect(addr, Some(Duration::from_secs(2))).unwrap();
    // Each connect future resolves once the relay's welcome is received, but
    // the relay only registers a peer once *its* welcome has arrived and
    // been read on the relay side — give that a moment before routing.
    thread::sleep(Duration::from_millis(100));

    let mut envelope = a.create_message(0);
    envelope.to = Some(b.instance_id());
    envelope.message = Some(Bytes::from_static(b"ping"));
    a.send_message(SendTarget::One, &envelope).unwrap();

    let received = b.receive(Some(Duration::from_secs(2))).unwrap();
    assert_eq!(received.from_peer, a.instance_id());
    assert_eq!(received.message.as_deref(), Some(&b"ping"[..]));
}

/// Scenario 2: one manager connected to two servers that both echo a
/// broadcast event back; the duplicate is collapsed by dedup and `receive`
/// only ever surfaces it once.
#[test]
fn broadcast_event_duplicated_across_channels_is_observed_once() {
    let (listener_a, addr_a) = local_listener();
    let (listener_b, addr_b) = local_listener();
    spawn_echo_relay(listener_a);
    spawn_echo_relay(listener_b);

    let client = Client::new(ClientConfig::default()).unwrap();
    client.connect(addr_a, Some(Duration::from_secs(2))).unwrap();
    client.connect(addr_b, Some(Duration::from_secs(2))).unwrap();

    let mut envelope = client.create_message(500);
    envelope.message = Some(Bytes::from_static(b"event"));
    client.event(&envelope).unwrap();

    let first = client.receive(Some(Duration::from_secs(2))).unwrap();
    assert_eq!(first.id, envelope.id);
    assert!(client
        .receive(Some(Duration::from_millis(300)))
        .is_err());
}

/// Scenario 3: a backend that echoes the request's message back under a
/// caller-chosen type answers a client query end to end.
#[test]
fn query_reaches_a_live_backend_and_returns_its_reply() {
    let (listener, addr) = local_listener();
    spawn_relay(listener);

    let backend_manager = ConnectionsManager::start(42, ManagerConfig::default()).unwrap();
    backend_manager
        .connect(addr, true, Some(Duration::from_secs(2)))
        .unwrap();
    announce(&backend_manager, 42);

    let mut backend = Backend::new(backend_manager, |_ctx: &BackendContext, req: &Envelope| {
        Ok(BackendReply::Custom {
            message: req.message.as_deref().unwrap_or(&[]).to_vec(),
            message_type: req.message_type,
        })
    });
    thread::spawn(move || {
        for _ in 0..4 {
            if backend.handle_one(Some(Duration::from_secs(3))).is_err() {
                break;
            }
        }
    });

    let client = Client::new(ClientConfig::default()).unwrap();
    client.connect(addr, Some(Duration::from_secs(2))).unwrap();

    let response = client
        .query(1136, Bytes::from_static(b"data"), Duration::from_secs(2), false)
        .unwrap();
    assert_eq!(response.message_type, 1136);
    assert_eq!(response.message.as_deref(), Some(&b"data"[..]));
    assert_eq!(response.to, Some(client.instance_id()));
}

/// Scenario 4: a backend that drops its first request and answers normally
/// afterwards — the first query still succeeds via backend discovery once
/// its direct attempt times out, and a `skip_resend` query against a fresh
/// silent backend times out instead of retrying.
#[test]
fn query_recovers_via_discovery_after_a_dropped_first_attempt() {
    let (listener, addr) = local_listener();
    spawn_relay(listener);

    let seen = Arc::new(Mutex::new(0u32));
    let backend_manager = ConnectionsManager::start(77, ManagerConfig::default()).unwrap();
    backend_manager
        .connect(addr, true, Some(Duration::from_secs(2)))
        .unwrap();
    announce(&backend_manager, 77);

    let counted = Arc::clone(&seen);
    let mut backend = Backend::new(backend_manager, move |_ctx: &BackendContext, req: &Envelope| {
        let mut count = counted.lock().unwrap();
        *count += 1;
        if *count == 1 {
            Ok(BackendReply::NoResponse)
        } else {
            Ok(BackendReply::Reply(
                req.message.as_deref().unwrap_or(&[]).to_vec(),
            ))
        }
    });
    thread::spawn(move || {
        for _ in 0..6 {
            if backend.handle_one(Some(Duration::from_secs(3))).is_err() {
                break;
            }
        }
    });

    let client = Client::new(ClientConfig::default()).unwrap();
    client.connect(addr, Some(Duration::from_secs(2))).unwrap();

    let response = client
        .query(
            900,
            Bytes::from_static(b"retry-me"),
            Duration::from_millis(500),
            false,
        )
        .unwrap();
    assert_eq!(response.message.as_deref(), Some(&b"retry-me"[..]));
}

/// Scenario 5: a backend whose handler always errors. A captured
/// `BACKEND_ERROR` never ends the query immediately — discovery and a
/// retransmit still run looking for a cleaner outcome — but since every
/// attempt hits the same always-erroring handler, the original captured
/// error is what the query ultimately reports, `skip_resend` or not.
#[test]
fn query_with_an_always_erroring_backend_surfaces_its_backend_error() {
    let (listener, addr) = local_listener();
    spawn_relay(listener);

    let backend_manager = ConnectionsManager::start(13, ManagerConfig::default()).unwrap();
    backend_manager
        .connect(addr, true, Some(Duration::from_secs(2)))
        .unwrap();
    announce(&backend_manager, 13);

    let mut backend = Backend::new(backend_manager, |_ctx: &BackendContext, _req: &Envelope| {
        Err("handler exploded".to_string())
    });
    thread::spawn(move || {
        for _ in 0..4 {
            if backend.handle_one(Some(Duration::from_secs(3))).is_err() {
                break;
            }
        }
    });

    let client = Client::new(ClientConfig::default()).unwrap();
    client.connect(addr, Some(Duration::from_secs(2))).unwrap();

    let result = client.query(
        901,
        Bytes::from_static(b"boom"),
        Duration::from_secs(2),
        true,
    );
    match result {
        Err(MultiplexerError::BackendError(payload)) => {
            assert_eq!(payload, b"handler exploded");
        }
        other => panic!("expected a backend error, got {other:?}"),
    }
}

/// Scenario 6: a listener that accepts and immediately closes without ever
/// sending a `CONNECTION_WELCOME` never completes the bus handshake. The
/// connect future is only resolved by the manager's dispatcher once it
/// decodes that envelope off the channel — a peer that closes first fails
/// the connect future instead, per `handle_close`'s "still pending" rule.
#[test]
fn connecting_to_a_listener_that_closes_before_the_welcome_fails_connect() {
    let (listener, addr) = local_listener();
    thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            drop(stream);
        }
    });

    let client = Client::new(ClientConfig::default()).unwrap();
    assert!(client.connect(addr, Some(Duration::from_secs(2))).is_err());
}

fn announce(manager: &ConnectionsManager, instance_id: u64) {
    let hello = Envelope::new(
        manager.next_envelope_id(),
        instance_id,
        None,
        message_types::CONNECTION_WELCOME,
    );
    manager.send_message(SendTarget::One, &hello).unwrap();
    // Give the reactor a moment to process the registration send before the
    // caller starts anything that depends on the relay already knowing this
    // peer — the discovery fallback in `query` tolerates the race even
    // without this, but this keeps the common path fast.
    thread::sleep(Duration::from_millis(50));
}
