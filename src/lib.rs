//! A client library for a Multiplexer-style message bus: small framed
//! envelopes routed by id between named peers over a mesh of TCP
//! connections, with deduplication, a three-phase query protocol for
//! request/response traffic, and a backend loop for answering requests.
//!
//! The pieces, roughly bottom-up:
//!
//! - [`frame`] — the wire framing (length + CRC) and the byte FIFO that
//!   reassembles it from arbitrary read chunks.
//! - [`envelope`] — the envelope fields and reserved protocol constants.
//! - [`future`] — a one-shot value used for connect-completion.
//! - [`limitedset`] — the bounded recently-seen-id set used for dedup.
//! - [`timer`] — a delay-ordered callback scheduler.
//! - [`channel`] — one socket's framing and backlog state.
//! - [`manager`] — the reactor thread and the channel table it owns.
//! - [`query`] — the three-phase query algorithm built on the manager.
//! - [`backend`] — the request-handling loop built on the manager.
//! - [`client`] — the public facade tying identity, query, and the manager
//!   together.
//! - [`heartbeat`] — periodic liveness tracking for a connection.

pub mod backend;
pub mod channel;
pub mod client;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod future;
pub mod heartbeat;
pub mod limitedset;
pub mod manager;
pub mod query;
pub mod timer;

pub use backend::{Backend, BackendContext, BackendReply, HandlerResult};
pub use client::{Client, ClientConfig};
pub use envelope::{message_types, peer_types, Envelope, Welcome};
pub use error::{FrameError, MultiplexerError, MultiplexerResult};
pub use manager::{ConnectionsManager, ManagerConfig, SendTarget};
