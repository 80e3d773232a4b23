//! The request-handling loop a backend runs over a [`ConnectionsManager`]:
//! pull one envelope, dispatch the small set of meta-packets internally,
//! and otherwise hand the envelope to a user handler while enforcing that
//! exactly one observable response occurs per request.

use crate::envelope::{message_types, Envelope};
use crate::error::MultiplexerResult;
use crate::manager::{ConnectionsManager, SendTarget};
use bytes::Bytes;
use mio::Token;
use std::cell::Cell;
use tracing::{error, warn};

/// What a handler decided to do with a request it was given.
pub enum BackendReply {
    /// The request warranted no reply at all.
    NoResponse,
    /// Reply with this payload as a `PING` message.
    Reply(Vec<u8>),
    /// Reply with this payload under a caller-chosen message type.
    Custom { message: Vec<u8>, message_type: u32 },
}

/// The outcome of running a handler against one request.
pub type HandlerResult = Result<BackendReply, String>;

/// Per-request handle a handler uses to send replies before returning its
/// final [`BackendReply`] — mirrors the request-scoped `send_message`
/// defaulting a backend gets while a message is being handled. Replies
/// always go out on `origin`, the channel the request itself arrived on,
/// never an arbitrary live channel.
pub struct BackendContext<'a> {
    manager: &'a ConnectionsManager,
    request: &'a Envelope,
    origin: Token,
    responded: Cell<bool>,
}

impl<'a> BackendContext<'a> {
    fn new(manager: &'a ConnectionsManager, request: &'a Envelope, origin: Token) -> Self {
        BackendContext {
            manager,
            request,
            origin,
            responded: Cell::new(false),
        }
    }

    /// Emits an early `REQUEST_RECEIVED` acknowledgement. Does not count as
    /// the request's one required response — a real reply must still
    /// follow, either from here or from the handler's return value.
    pub fn notify_started(&self) {
        self.send(message_types::REQUEST_RECEIVED, Vec::new());
    }

    /// Sends a reply now rather than through the handler's return value.
    pub fn send(&self, message_type: u32, payload: Vec<u8>) {
        if message_type != message_types::REQUEST_RECEIVED {
            self.responded.set(true);
        }
        reply(self.manager, self.request, self.origin, message_type, payload);
    }

    pub fn report_error(&self, message: impl Into<Vec<u8>>) {
        self.send(message_types::BACKEND_ERROR, message.into());
    }

    fn has_responded(&self) -> bool {
        self.responded.get()
    }
}

/// Sends a reply to `request` on the channel it arrived on (`origin`),
/// rather than an arbitrary live channel — a backend reply must go back the
/// way the request came, not to whichever connection happens to be first.
fn reply(
    manager: &ConnectionsManager,
    request: &Envelope,
    origin: Token,
    message_type: u32,
    payload: Vec<u8>,
) {
    let mut envelope = Envelope::reply_to(
        request,
        manager.next_envelope_id(),
        manager.instance_id(),
        message_type,
    );
    envelope.message = Some(Bytes::from(payload));
    if let Err(err) = manager.send_message(SendTarget::Channel(origin), &envelope) {
        error!(%err, "failed to send backend reply");
    }
}

/// Runs a [`ConnectionsManager`]'s incoming queue through `handler`, which
/// receives a [`BackendContext`] (for early replies) alongside the request
/// and returns the final [`BackendReply`] — or an `Err(message)`, treated
/// the way an uncaught exception is in the reference implementation: an
/// automatic `BACKEND_ERROR` reply plus an `on_error` callback.
pub struct Backend<H> {
    manager: ConnectionsManager,
    handler: H,
    working: bool,
}

impl<H> Backend<H>
where
    H: FnMut(&BackendContext, &Envelope) -> HandlerResult,
{
    pub fn new(manager: ConnectionsManager, handler: H) -> Self {
        Backend {
            manager,
            handler,
            working: true,
        }
    }

    pub fn shutdown(&mut self) {
        self.working = false;
    }

    /// Repeatedly handles one request at a time until [`Backend::shutdown`]
    /// is called or the manager closes.
    pub fn serve_forever(&mut self) -> MultiplexerResult<()> {
        while self.working {
            self.handle_one(None)?;
        }
        Ok(())
    }

    pub fn handle_one(&mut self, timeout: Option<std::time::Duration>) -> MultiplexerResult<()> {
        let (origin, request) = self.manager.receive(timeout)?;
        self.handle_message(origin, request);
        Ok(())
    }

    fn handle_message(&mut self, origin: Token, request: Envelope) {
        if request.is_meta() {
            self.handle_internal_message(origin, &request);
            return;
        }

        let ctx = BackendContext::new(&self.manager, &request, origin);
        match (self.handler)(&ctx, &request) {
            Ok(BackendReply::NoResponse) => {
                // nothing to do, this satisfies the response obligation
            }
            Ok(BackendReply::Reply(payload)) => {
                reply(&self.manager, &request, origin, message_types::PING, payload);
            }
            Ok(BackendReply::Custom {
                message,
                message_type,
            }) => {
                reply(&self.manager, &request, origin, message_type, message);
            }
            Err(message) => {
                if !ctx.has_responded() {
                    reply(
                        &self.manager,
                        &request,
                        origin,
                        message_types::BACKEND_ERROR,
                        message.clone().into_bytes(),
                    );
                }
                warn!(error = %message, "backend handler failed");
            }
        }
    }

    fn handle_internal_message(&mut self, origin: Token, request: &Envelope) {
        match request.message_type {
            message_types::BACKEND_FOR_PACKET_SEARCH => {
                reply(&self.manager, request, origin, message_types::PING, Vec::new());
            }
            message_types::PING if request.references.is_none() => {
                let payload = request
                    .message
                    .as_deref()
                    .unwrap_or(&[])
                    .to_vec();
                reply(&self.manager, request, origin, message_types::PING, payload);
            }
            message_types::PING => {
                // a reply to one of our own searches, routed elsewhere already
            }
            other => warn!(message_type = other, "backend received unknown meta-packet"),
        }
    }
}
