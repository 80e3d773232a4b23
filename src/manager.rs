//! The connections manager: a single reactor thread that owns every socket,
//! a task queue that other threads post work onto, and the routing tables
//! that turn incoming envelopes into either a query response or a delivery
//! to [`ConnectionsManager::receive`].

use crate::channel::{Channel, ChannelState};
use crate::envelope::{message_types, Envelope};
use crate::error::{MultiplexerError, MultiplexerResult};
use crate::future::OneshotFuture;
use crate::heartbeat::HeartbeatConfig;
use crate::limitedset::LimitedSet;
use crate::timer::Scheduler;
use bytes::Bytes;
use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Poll, Token, Waker};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const WAKE_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Which channel(s) a send should go out on.
pub enum SendTarget {
    /// Any single live channel — the manager picks one.
    One,
    /// Every live channel.
    All,
    /// A specific channel, as returned by `connect`.
    Channel(Token),
}

enum Task {
    Connect {
        address: SocketAddr,
        reconnect: bool,
        result: OneshotFuture<Token>,
    },
    Send {
        target: SendTarget,
        contents: Bytes,
        result: OneshotFuture<usize>,
    },
    RegisterQueryRoute {
        id: u64,
        sender: Sender<(Token, Envelope)>,
    },
    UnregisterQueryRoute {
        id: u64,
    },
    Shutdown,
}

/// Configuration tunables for the manager's reactor.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub heartbeat_write_interval: Duration,
    pub dedup_capacity: usize,
    pub incoming_queue_capacity: usize,
    /// Serialized welcome envelope, enqueued automatically on every channel
    /// the instant its TCP-level connect succeeds — spec requires each side
    /// send its welcome immediately on connect, independent of waiting for
    /// the peer's. `None` for a manager with no protocol-level identity of
    /// its own (used directly in tests).
    pub welcome: Option<Bytes>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            heartbeat_write_interval: Duration::from_secs(10),
            dedup_capacity: crate::limitedset::DEFAULT_CAPACITY,
            incoming_queue_capacity: 1024,
            welcome: None,
        }
    }
}

/// Owns the reactor thread and exposes thread-safe connection management.
pub struct ConnectionsManager {
    task_tx: Sender<Task>,
    waker: Arc<Waker>,
    incoming_rx: Mutex<Receiver<(Token, Envelope)>>,
    next_id: AtomicU64,
    instance_id: u64,
    reactor: Option<JoinHandle<()>>,
    closed: AtomicBool,
    // Keeps the heartbeat scheduler's worker thread alive for as long as the
    // manager is; the reactor thread holds its own strong clone for as long
    // as it runs, and scheduled heartbeat ticks only ever hold a `Weak` one.
    _scheduler: Arc<Scheduler>,
}

struct ReactorState {
    poll: Poll,
    channels: HashMap<Token, Channel>,
    next_token: usize,
    query_routes: HashMap<u64, Sender<(Token, Envelope)>>,
    recent_ids: LimitedSet<u64>,
    incoming_tx: Sender<(Token, Envelope)>,
    task_tx: Sender<Task>,
    waker: Arc<Waker>,
    scheduler: Arc<Scheduler>,
    instance_id: u64,
    heartbeat_write_interval: Duration,
    welcome: Option<Bytes>,
}

/// Captures everything a recurring `HEARTBIT` tick needs to send itself and
/// reschedule. Holds only a [`Weak`] scheduler handle so the cycle between a
/// scheduled closure and the scheduler that owns it doesn't keep the
/// scheduler's worker thread alive past the manager's own shutdown.
struct HeartbeatTick {
    token: Token,
    instance_id: u64,
    interval: Duration,
    task_tx: Sender<Task>,
    waker: Arc<Waker>,
    scheduler: Weak<Scheduler>,
}

fn fire_heartbeat(tick: HeartbeatTick) {
    let envelope = Envelope::new(0, tick.instance_id, None, message_types::HEARTBIT);
    let sent = tick.task_tx.send(Task::Send {
        target: SendTarget::Channel(tick.token),
        contents: envelope.to_bytes(),
        result: OneshotFuture::new(),
    });
    if sent.is_err() {
        return;
    }
    let _ = tick.waker.wake();

    let Some(scheduler) = tick.scheduler.upgrade() else {
        return;
    };
    let HeartbeatTick {
        token,
        instance_id,
        interval,
        task_tx,
        waker,
        scheduler: weak,
    } = tick;
    scheduler.schedule(interval, move || {
        fire_heartbeat(HeartbeatTick {
            token,
            instance_id,
            interval,
            task_tx,
            waker,
            scheduler: weak,
        });
    });
}

/// Schedules a replacement connection after `channel`'s reconnect policy's
/// next backoff delay, if it carries one. Posts a fresh `Task::Connect`
/// through the same task channel a caller would use, so the reconnected
/// channel goes through the exact same registration path as any other.
fn schedule_reconnect(state: &ReactorState, channel: &mut Channel) {
    let Some(policy) = channel.reconnect.as_mut() else {
        return;
    };
    let delay = policy.next_delay();
    let address = channel.address;
    let task_tx = state.task_tx.clone();
    let waker = Arc::clone(&state.waker);
    state.scheduler.schedule(delay, move || {
        if task_tx
            .send(Task::Connect {
                address,
                reconnect: true,
                result: OneshotFuture::new(),
            })
            .is_ok()
        {
            let _ = waker.wake();
        }
    });
}

fn start_heartbeat(state: &ReactorState, token: Token) {
    let tick = HeartbeatTick {
        token,
        instance_id: state.instance_id,
        interval: state.heartbeat_write_interval,
        task_tx: state.task_tx.clone(),
        waker: Arc::clone(&state.waker),
        scheduler: Arc::downgrade(&state.scheduler),
    };
    state.scheduler.schedule(state.heartbeat_write_interval, move || fire_heartbeat(tick));
}

impl ConnectionsManager {
    /// Starts the reactor thread and returns a handle to it. `instance_id`
    /// identifies this peer in outbound envelopes it originates.
    pub fn start(instance_id: u64, config: ManagerConfig) -> MultiplexerResult<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (task_tx, task_rx) = mpsc::channel();
        let (incoming_tx, incoming_rx) = mpsc::channel();
        let scheduler = Arc::new(Scheduler::new());

        let state = ReactorState {
            poll,
            channels: HashMap::new(),
            next_token: 0,
            query_routes: HashMap::new(),
            recent_ids: LimitedSet::new(config.dedup_capacity),
            incoming_tx,
            task_tx: task_tx.clone(),
            waker: Arc::clone(&waker),
            scheduler: Arc::clone(&scheduler),
            instance_id,
            heartbeat_write_interval: config.heartbeat_write_interval,
            welcome: config.welcome,
        };

        let reactor = thread::Builder::new()
            .name("multiplexer-reactor".into())
            .spawn(move || reactor_loop(state, task_rx))
            .map_err(MultiplexerError::Io)?;

        Ok(ConnectionsManager {
            task_tx,
            waker,
            incoming_rx: Mutex::new(incoming_rx),
            next_id: AtomicU64::new(1),
            instance_id,
            reactor: Some(reactor),
            closed: AtomicBool::new(false),
            _scheduler: scheduler,
        })
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Allocates a fresh, process-unique envelope id.
    pub fn next_envelope_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn post(&self, task: Task) -> MultiplexerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MultiplexerError::Closed);
        }
        self.task_tx
            .send(task)
            .map_err(|_| MultiplexerError::Closed)?;
        self.waker.wake().map_err(MultiplexerError::Io)
    }

    /// Opens a connection to `address`, blocking until it completes or
    /// `timeout` elapses.
    pub fn connect(
        &self,
        address: SocketAddr,
        reconnect: bool,
        timeout: Option<Duration>,
    ) -> MultiplexerResult<Token> {
        let result: OneshotFuture<Token> = OneshotFuture::new();
        self.post(Task::Connect {
            address,
            reconnect,
            result: result.clone(),
        })?;
        result.wait(timeout).map_err(|_| MultiplexerError::Timeout)
    }

    /// Sends an envelope's serialized bytes toward `target`, resolving to the
    /// number of channels the frame was enqueued onto.
    pub fn send_message(&self, target: SendTarget, envelope: &Envelope) -> MultiplexerResult<usize> {
        self.send_message_raw(target, envelope.to_bytes())
    }

    /// Sends already-serialized envelope bytes toward `target` — used for
    /// the welcome handshake, which is built once and replayed verbatim on
    /// every new channel. `SendTarget::One`/`Channel` fail with
    /// `DeliveryFailure` if no matching channel is currently connected;
    /// `SendTarget::All` resolves to `0` rather than failing when there are
    /// no channels to fan out to.
    pub fn send_message_raw(&self, target: SendTarget, contents: Bytes) -> MultiplexerResult<usize> {
        let result: OneshotFuture<usize> = OneshotFuture::new();
        self.post(Task::Send {
            target,
            contents,
            result: result.clone(),
        })?;
        result.wait(None).map_err(|err| match err {
            crate::future::FutureError::Failed(message) => MultiplexerError::DeliveryFailure(message),
            crate::future::FutureError::TimedOut => MultiplexerError::Timeout,
        })
    }

    /// Blocks until an envelope not claimed by an active query arrives, or
    /// `timeout` elapses. Returns the token of the channel it arrived on
    /// alongside the envelope, so a backend can reply on the same
    /// connection a request came in on.
    pub fn receive(&self, timeout: Option<Duration>) -> MultiplexerResult<(Token, Envelope)> {
        let rx = self.incoming_rx.lock().unwrap();
        match timeout {
            Some(d) => rx.recv_timeout(d).map_err(|_| MultiplexerError::Timeout),
            None => rx.recv().map_err(|_| MultiplexerError::TransportClosed),
        }
    }

    /// Registers a route so envelopes referencing `id` are delivered,
    /// together with the token of the channel they arrived on, to `sender`
    /// instead of the general `receive` queue.
    pub fn register_query_route(
        &self,
        id: u64,
        sender: Sender<(Token, Envelope)>,
    ) -> MultiplexerResult<()> {
        self.post(Task::RegisterQueryRoute { id, sender })
    }

    pub fn unregister_query_route(&self, id: u64) -> MultiplexerResult<()> {
        self.post(Task::UnregisterQueryRoute { id })
    }

    /// Idempotently shuts the reactor down, failing any pending channel
    /// connect futures along the way.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.task_tx.send(Task::Shutdown);
        let _ = self.waker.wake();
        if let Some(handle) = self.reactor.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConnectionsManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn reactor_loop(mut state: ReactorState, task_rx: Receiver<Task>) {
    let mut events = Events::with_capacity(256);
    'outer: loop {
        if let Err(err) = state.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            warn!(%err, "reactor poll failed");
            continue;
        }
        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                while let Ok(task) = task_rx.try_recv() {
                    if matches!(task, Task::Shutdown) {
                        shutdown(&mut state);
                        break 'outer;
                    }
                    handle_task(&mut state, task);
                }
                continue;
            }

            let token = event.token();
            let mut disconnected = false;
            let mut just_connected = false;
            let mut envelopes = Vec::new();
            if let Some(channel) = state.channels.get_mut(&token) {
                if event.is_writable() && !channel.protocol_initialized {
                    match channel.take_connect_error() {
                        Ok(()) => {
                            channel.handle_connect();
                            info!(?token, "channel connected");
                            just_connected = true;
                        }
                        Err(err) => {
                            debug!(?token, %err, "connect failed");
                            channel.handle_close();
                            disconnected = true;
                        }
                    }
                }
                if event.is_readable() {
                    let (read_state, received) = channel.handle_read();
                    envelopes = received;
                    if read_state == ChannelState::Disconnected {
                        disconnected = true;
                    }
                }
            }
            if just_connected {
                if let Some(welcome) = state.welcome.clone() {
                    let registry = state.poll.registry();
                    if let Some(channel) = state.channels.get_mut(&token) {
                        if channel.enqueue(&welcome, registry) == ChannelState::Disconnected {
                            disconnected = true;
                        }
                    }
                }
                start_heartbeat(&state, token);
            }
            for envelope in envelopes {
                dispatch(&mut state, token, envelope);
            }
            if !disconnected && event.is_writable() {
                let registry = state.poll.registry();
                if state
                    .channels
                    .get_mut(&token)
                    .map(|c| c.handle_write(registry))
                    == Some(ChannelState::Disconnected)
                {
                    disconnected = true;
                }
            }
            if disconnected {
                if let Some(mut channel) = state.channels.remove(&token) {
                    let _ = channel.deregister(state.poll.registry());
                    channel.handle_close();
                    schedule_reconnect(&state, &mut channel);
                    debug!(?token, "channel disconnected");
                }
            }
        }
        enforce_heartbeat_liveness(&mut state);
    }
}

/// Disconnects any channel that has gone silent past its heartbeat liveness
/// window. Runs once per poll iteration, so it keys off the same
/// `HeartbeatManager` each channel's `handle_read` feeds on every inbound
/// byte — a channel only goes quiet here if nothing, not even a `HEARTBIT`,
/// has arrived in that long.
fn enforce_heartbeat_liveness(state: &mut ReactorState) {
    let mut dead = Vec::new();
    for (&token, channel) in state.channels.iter_mut() {
        if !channel.protocol_initialized {
            continue;
        }
        if channel.heartbeat.should_ping() {
            channel.heartbeat.on_ping_sent();
            channel.heartbeat.on_ping_failure();
            if channel.heartbeat.is_connection_failed() {
                dead.push(token);
            }
        }
    }
    for token in dead {
        if let Some(mut channel) = state.channels.remove(&token) {
            let _ = channel.deregister(state.poll.registry());
            channel.handle_close();
            schedule_reconnect(state, &mut channel);
            warn!(?token, "channel missed too many heartbeats, disconnecting");
        }
    }
}

fn handle_task(state: &mut ReactorState, task: Task) {
    match task {
        Task::Connect {
            address,
            reconnect,
            result,
        } => match MioTcpStream::connect(address) {
            Ok(stream) => {
                let token = Token(state.next_token);
                state.next_token += 1;
                let heartbeat_config = HeartbeatConfig::new(state.heartbeat_write_interval * 2)
                    .with_max_failures(3);
                let mut channel = Channel::new(stream, address, token, reconnect, heartbeat_config);
                channel.connect_future = result;
                if let Err(err) = channel.register(state.poll.registry()) {
                    channel.connect_future.set_error(err.to_string());
                } else {
                    state.channels.insert(token, channel);
                }
            }
            Err(err) => result.set_error(err.to_string()),
        },
        Task::Send {
            target,
            contents,
            result,
        } => {
            let is_all = matches!(target, SendTarget::All);
            let tokens: Vec<Token> = match target {
                SendTarget::Channel(t) => {
                    if state.channels.contains_key(&t) {
                        vec![t]
                    } else {
                        vec![]
                    }
                }
                SendTarget::All => state.channels.keys().copied().collect(),
                SendTarget::One => state.channels.keys().next().copied().into_iter().collect(),
            };
            if tokens.is_empty() && !is_all {
                result.set_error("no channel available for send");
            } else {
                let registry = state.poll.registry();
                for &token in &tokens {
                    if let Some(channel) = state.channels.get_mut(&token) {
                        channel.enqueue(&contents, registry);
                    }
                }
                result.set(tokens.len());
            }
        }
        Task::RegisterQueryRoute { id, sender } => {
            state.query_routes.insert(id, sender);
        }
        Task::UnregisterQueryRoute { id } => {
            state.query_routes.remove(&id);
        }
        Task::Shutdown => unreachable!("handled by caller"),
    }
}

/// Implements spec's three-step dispatcher: dedup first, consume the two
/// connection-lifecycle meta-packets internally, then route everything else
/// either to a waiting query or to the general incoming queue.
fn dispatch(state: &mut ReactorState, token: Token, envelope: Envelope) {
    if !state.recent_ids.add(envelope.id) {
        return;
    }

    match envelope.message_type {
        message_types::CONNECTION_WELCOME => {
            if let Some(channel) = state.channels.get_mut(&token) {
                if !channel.connect_future.is_set() {
                    channel.connect_future.set(token);
                }
            }
            return;
        }
        message_types::HEARTBIT => return,
        _ => {}
    }

    let route_key = envelope.references.unwrap_or(envelope.id);
    if let Some(sender) = state.query_routes.get(&route_key) {
        let _ = sender.send((token, envelope));
        return;
    }
    let _ = state.incoming_tx.send((token, envelope));
}

fn shutdown(state: &mut ReactorState) {
    for (_, mut channel) in state.channels.drain() {
        channel.handle_close();
    }
}
