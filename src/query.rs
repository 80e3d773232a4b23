//! The three-phase query algorithm: try a direct channel first, fall back to
//! a backend-discovery broadcast if that fails or times out, retransmit to
//! the single backend discovery turns up, and as a last resort give the
//! original direct attempt one more wait in case its answer was merely slow.
//!
//! All three phases share one query context: a single `mpsc` receiver and a
//! running set of ids registered against it (the direct query id, then the
//! discovery search id, then the retransmit id), mirroring the reference
//! client's "a context owns a queue and every id it ever registers" model.
//! Every id that gets registered during a call is unregistered once, when
//! the call returns, not incrementally per phase — a stray late reply for an
//! earlier phase is simply ignored rather than leaking into `receive`.
//!
//! `BACKEND_ERROR` responses encountered before a final answer is found are
//! captured but do not abort the search — they only surface if nothing else
//! ever answers.

use crate::envelope::{message_types, Envelope};
use crate::error::{MultiplexerError, MultiplexerResult};
use crate::manager::{ConnectionsManager, SendTarget};
use bytes::Bytes;
use mio::Token;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

type Inbox = Receiver<(Token, Envelope)>;

/// Runs the three-phase query for `message_type`/`payload` over `manager`,
/// returning the answering envelope or the error that prevented one.
///
/// `skip_resend` disables phases 2 and 3 entirely: a direct failure or
/// timeout is returned immediately, matching a caller that knows retrying
/// via backend discovery would not help. A captured `BACKEND_ERROR` from the
/// direct attempt itself is never skip_resend-gated — it's not a failure to
/// deliver, it's an answer, just an unhappy one.
pub fn query(
    manager: &ConnectionsManager,
    message_type: u32,
    payload: Bytes,
    timeout: Duration,
    skip_resend: bool,
) -> MultiplexerResult<Envelope> {
    let (tx, rx) = mpsc::channel();
    let mut registered_ids = Vec::new();

    let result = run(
        manager,
        &tx,
        &rx,
        &mut registered_ids,
        message_type,
        &payload,
        timeout,
        skip_resend,
    );

    for id in registered_ids {
        let _ = manager.unregister_query_route(id);
    }
    result
}

fn run(
    manager: &ConnectionsManager,
    tx: &Sender<(Token, Envelope)>,
    rx: &Inbox,
    registered_ids: &mut Vec<u64>,
    message_type: u32,
    payload: &Bytes,
    timeout: Duration,
    skip_resend: bool,
) -> MultiplexerResult<Envelope> {
    let query_id = manager.next_envelope_id();
    manager.register_query_route(query_id, tx.clone())?;
    registered_ids.push(query_id);

    let mut captured_backend_error: Option<Envelope> = None;

    let mut direct = Envelope::new(query_id, manager.instance_id(), None, message_type);
    direct.message = Some(payload.clone());
    let sent = manager.send_message(SendTarget::One, &direct);

    if sent.is_err() {
        if skip_resend {
            return Err(MultiplexerError::DeliveryFailure(
                "no channel available for direct delivery".into(),
            ));
        }
    } else {
        match phase1_wait(rx, query_id, timeout) {
            Phase1Outcome::Answered(envelope) => return finalize(envelope),
            Phase1Outcome::DeliveryErrored => {
                if skip_resend {
                    return Err(MultiplexerError::DeliveryFailure(
                        "direct delivery failed".into(),
                    ));
                }
            }
            Phase1Outcome::BackendErrorCaptured(envelope) => {
                captured_backend_error = Some(envelope);
            }
            Phase1Outcome::TimedOut => {
                if skip_resend {
                    return Err(MultiplexerError::Timeout);
                }
            }
        }
    }

    discover_and_retransmit(
        manager,
        tx,
        rx,
        registered_ids,
        query_id,
        message_type,
        payload,
        timeout,
        &mut captured_backend_error,
    )
}

enum Phase1Outcome {
    Answered(Envelope),
    DeliveryErrored,
    BackendErrorCaptured(Envelope),
    TimedOut,
}

/// Waits on the direct query id alone. `REQUEST_RECEIVED` acknowledgements
/// are not an answer and don't consume the wait; a `BACKEND_ERROR` is
/// captured rather than treated as final, so discovery still gets a chance.
fn phase1_wait(rx: &Inbox, query_id: u64, timeout: Duration) -> Phase1Outcome {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Phase1Outcome::TimedOut;
        }
        match rx.recv_timeout(remaining) {
            Ok((_token, reply)) if reply.references.unwrap_or(reply.id) != query_id => continue,
            Ok((_token, reply)) => match reply.message_type {
                message_types::REQUEST_RECEIVED => continue,
                message_types::DELIVERY_ERROR => return Phase1Outcome::DeliveryErrored,
                message_types::BACKEND_ERROR => return Phase1Outcome::BackendErrorCaptured(reply),
                _ => return Phase1Outcome::Answered(reply),
            },
            Err(_) => return Phase1Outcome::TimedOut,
        }
    }
}

/// Phase 2 (broadcast a `BACKEND_FOR_PACKET_SEARCH` and wait for a live
/// backend's `PING`) folded together with phase 3 (retransmit to that one
/// backend) and the final fallback (one more wait on the original query id,
/// in case a direct answer was simply slow).
#[allow(clippy::too_many_arguments)]
fn discover_and_retransmit(
    manager: &ConnectionsManager,
    tx: &Sender<(Token, Envelope)>,
    rx: &Inbox,
    registered_ids: &mut Vec<u64>,
    query_id: u64,
    message_type: u32,
    payload: &Bytes,
    timeout: Duration,
    captured_backend_error: &mut Option<Envelope>,
) -> MultiplexerResult<Envelope> {
    let search_id = manager.next_envelope_id();
    manager.register_query_route(search_id, tx.clone())?;
    registered_ids.push(search_id);

    let search = Envelope::new(
        search_id,
        manager.instance_id(),
        None,
        message_types::BACKEND_FOR_PACKET_SEARCH,
    );
    let mut outstanding = manager.send_message(SendTarget::All, &search).unwrap_or(0);

    if outstanding == 0 {
        return backend_error_or(captured_backend_error.take(), || {
            MultiplexerError::DeliveryFailure("no live backend discovered".into())
        });
    }

    let mut first_delivery_errored = false;
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return backend_error_or(captured_backend_error.take(), || MultiplexerError::Timeout);
        }
        match rx.recv_timeout(remaining) {
            Ok((token, reply)) if reply.references == Some(search_id) => match reply.message_type {
                message_types::PING => {
                    return retransmit(
                        manager,
                        tx,
                        rx,
                        registered_ids,
                        query_id,
                        token,
                        message_type,
                        payload,
                        timeout,
                        captured_backend_error,
                    );
                }
                message_types::DELIVERY_ERROR => {
                    outstanding -= 1;
                    if outstanding == 0 {
                        return fallback_wait(rx, query_id, timeout, captured_backend_error, first_delivery_errored);
                    }
                }
                message_types::BACKEND_ERROR => {
                    if captured_backend_error.is_none() {
                        *captured_backend_error = Some(reply);
                    }
                    outstanding -= 1;
                    if outstanding == 0 {
                        return fallback_wait(rx, query_id, timeout, captured_backend_error, first_delivery_errored);
                    }
                }
                _ => {}
            },
            Ok((_token, reply)) if reply.references.unwrap_or(reply.id) == query_id => {
                match reply.message_type {
                    message_types::REQUEST_RECEIVED => {}
                    message_types::DELIVERY_ERROR => first_delivery_errored = true,
                    message_types::BACKEND_ERROR => {
                        if captured_backend_error.is_none() {
                            *captured_backend_error = Some(reply);
                        }
                    }
                    _ => return finalize(reply),
                }
            }
            Ok(_) => {}
            Err(_) => {
                return backend_error_or(captured_backend_error.take(), || MultiplexerError::Timeout);
            }
        }
    }
}

/// No live backend answered before the search ran out: give the direct
/// query id one more full wait in case the original answer was only slow,
/// rather than failing outright.
fn fallback_wait(
    rx: &Inbox,
    query_id: u64,
    timeout: Duration,
    captured_backend_error: &mut Option<Envelope>,
    first_delivery_errored: bool,
) -> MultiplexerResult<Envelope> {
    if first_delivery_errored {
        return backend_error_or(captured_backend_error.take(), || {
            MultiplexerError::DeliveryFailure("no live backend discovered".into())
        });
    }
    match rx.recv_timeout(timeout) {
        Ok((_token, reply)) if reply.references.unwrap_or(reply.id) == query_id => {
            match reply.message_type {
                message_types::DELIVERY_ERROR => backend_error_or(captured_backend_error.take(), || {
                    MultiplexerError::DeliveryFailure("no live backend discovered".into())
                }),
                _ => finalize(reply),
            }
        }
        _ => backend_error_or(captured_backend_error.take(), || {
            MultiplexerError::DeliveryFailure("no live backend discovered".into())
        }),
    }
}

/// Retransmits the original request to the single backend discovery found,
/// on its own fresh id, and waits for its reply.
#[allow(clippy::too_many_arguments)]
fn retransmit(
    manager: &ConnectionsManager,
    tx: &Sender<(Token, Envelope)>,
    rx: &Inbox,
    registered_ids: &mut Vec<u64>,
    query_id: u64,
    backend: Token,
    message_type: u32,
    payload: &Bytes,
    timeout: Duration,
    captured_backend_error: &mut Option<Envelope>,
) -> MultiplexerResult<Envelope> {
    let retransmit_id = manager.next_envelope_id();
    manager.register_query_route(retransmit_id, tx.clone())?;
    registered_ids.push(retransmit_id);

    let mut envelope = Envelope::new(retransmit_id, manager.instance_id(), None, message_type);
    envelope.message = Some(payload.clone());
    if manager
        .send_message(SendTarget::Channel(backend), &envelope)
        .is_err()
    {
        return backend_error_or(captured_backend_error.take(), || {
            MultiplexerError::DeliveryFailure("retransmit failed".into())
        });
    }

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return backend_error_or(captured_backend_error.take(), || MultiplexerError::Timeout);
        }
        match rx.recv_timeout(remaining) {
            Ok((_token, reply)) if reply.references == Some(retransmit_id) => {
                match reply.message_type {
                    message_types::DELIVERY_ERROR => {
                        return backend_error_or(captured_backend_error.take(), || {
                            MultiplexerError::DeliveryFailure("retransmit delivery failed".into())
                        });
                    }
                    message_types::BACKEND_ERROR => {
                        if captured_backend_error.is_none() {
                            *captured_backend_error = Some(reply);
                        }
                    }
                    _ => return Ok(reply),
                }
            }
            Ok((_token, reply)) if reply.references.unwrap_or(reply.id) == query_id => {
                match reply.message_type {
                    message_types::BACKEND_ERROR if captured_backend_error.is_none() => {
                        *captured_backend_error = Some(reply);
                    }
                    _ if reply.message_type != message_types::DELIVERY_ERROR => {
                        return finalize(reply);
                    }
                    _ => {}
                }
            }
            Ok(_) => {}
            Err(_) => return backend_error_or(captured_backend_error.take(), || MultiplexerError::Timeout),
        }
    }
}

fn backend_error_or(
    captured: Option<Envelope>,
    fallback: impl FnOnce() -> MultiplexerError,
) -> MultiplexerResult<Envelope> {
    match captured {
        Some(envelope) => finalize(envelope),
        None => Err(fallback()),
    }
}

fn finalize(envelope: Envelope) -> MultiplexerResult<Envelope> {
    if envelope.message_type == message_types::BACKEND_ERROR {
        return Err(MultiplexerError::BackendError(
            envelope.message.map(|m| m.to_vec()).unwrap_or_default(),
        ));
    }
    Ok(envelope)
}
