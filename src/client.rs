//! The public facade: peer identity, message construction defaults, and the
//! `send`/`event`/`receive`/`query`/`connect` operations built on top of
//! [`ConnectionsManager`].

use crate::envelope::{message_types, peer_types, Envelope, Welcome};
use crate::error::MultiplexerResult;
use crate::manager::{ConnectionsManager, ManagerConfig, SendTarget};
use crate::query;
use bytes::Bytes;
use mio::Token;
use std::net::SocketAddr;
use std::time::Duration;

fn random_instance_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish()
}

/// Configuration for a [`Client`]: peer identity plus the manager tunables
/// it starts with.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub peer_type: u32,
    pub multiplexer_password: Option<Bytes>,
    pub manager: ManagerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            peer_type: peer_types::MULTIPLEXER,
            multiplexer_password: None,
            manager: ManagerConfig::default(),
        }
    }
}

/// A peer's set of open connections to the bus.
///
/// Holds a random instance id and a peer type, builds the welcome envelope
/// once at construction and hands it to the manager, which enqueues it on
/// every channel the instant its TCP connect succeeds, and exposes the
/// query state machine and the plain send/receive operations.
pub struct Client {
    manager: ConnectionsManager,
    instance_id: u64,
    peer_type: u32,
}

impl Client {
    pub fn new(mut config: ClientConfig) -> MultiplexerResult<Self> {
        let instance_id = random_instance_id();

        let welcome_payload = Welcome {
            peer_type: config.peer_type,
            instance_id,
            multiplexer_password: config.multiplexer_password.take(),
        }
        .to_bytes();
        let mut handshake = Envelope::new(
            random_instance_id(),
            instance_id,
            None,
            message_types::CONNECTION_WELCOME,
        );
        handshake.message = Some(welcome_payload);

        config.manager.welcome = Some(handshake.to_bytes());
        let manager = ConnectionsManager::start(instance_id, config.manager)?;

        Ok(Client {
            manager,
            instance_id,
            peer_type: config.peer_type,
        })
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn peer_type(&self) -> u32 {
        self.peer_type
    }

    /// Builds a fresh envelope with `id`/`from_peer`/`timestamp` filled in,
    /// leaving `message_type`/`to`/`message` for the caller to set.
    pub fn create_message(&self, message_type: u32) -> Envelope {
        Envelope::new(self.manager.next_envelope_id(), self.instance_id, None, message_type)
    }

    /// Opens a connection to `address` and blocks until the peer's
    /// `CONNECTION_WELCOME` is observed or `timeout` elapses — `connect`
    /// only resolves once that reply arrives, not on the bare TCP handshake.
    /// This client's own welcome goes out the instant the manager's reactor
    /// sees the socket connect succeed, independent of waiting on the peer's.
    pub fn connect(&self, address: SocketAddr, timeout: Option<Duration>) -> MultiplexerResult<Token> {
        self.manager.connect(address, true, timeout)
    }

    /// Sends `envelope` toward `target`, resolving to the number of channels
    /// it was enqueued onto.
    pub fn send_message(&self, target: SendTarget, envelope: &Envelope) -> MultiplexerResult<usize> {
        self.manager.send_message(target, envelope)
    }

    /// Broadcasts to every connected channel — a shorthand for
    /// `send_message(SendTarget::All, ...)`.
    pub fn event(&self, envelope: &Envelope) -> MultiplexerResult<usize> {
        self.send_message(SendTarget::All, envelope)
    }

    pub fn receive(&self, timeout: Option<Duration>) -> MultiplexerResult<Envelope> {
        self.manager.receive(timeout).map(|(_token, envelope)| envelope)
    }

    /// Runs the three-phase query state machine described in [`query`].
    pub fn query(
        &self,
        message_type: u32,
        payload: Bytes,
        timeout: Duration,
        skip_resend: bool,
    ) -> MultiplexerResult<Envelope> {
        query::query(&self.manager, message_type, payload, timeout, skip_resend)
    }

    pub fn close(&mut self) {
        self.manager.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_message_fills_identity_defaults() {
        let client = Client::new(ClientConfig::default()).unwrap();
        let msg = client.create_message(message_types::PING);
        assert_eq!(msg.from_peer, client.instance_id());
        assert_eq!(msg.message_type, message_types::PING);
    }

    #[test]
    fn connect_to_nothing_returns_an_error() {
        let client = Client::new(ClientConfig::default()).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(client.connect(addr, Some(Duration::from_secs(1))).is_err());
    }
}
