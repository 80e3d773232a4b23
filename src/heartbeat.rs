//! Inbound liveness tracking for a connection.
//!
//! This is a polling model: the reactor calls [`HeartbeatManager::should_ping`]
//! on every pass through its loop and records the outcome, which keeps all of
//! the bookkeeping on the reactor thread without its own timer plumbing. A
//! channel feeds [`HeartbeatManager::on_ping_sent`] and
//! [`HeartbeatManager::on_ping_success`] on every byte it reads — so "ping"
//! here means "the liveness window just restarted", not an outbound probe —
//! and the reactor calls [`HeartbeatManager::on_ping_failure`] whenever a
//! channel's window lapses with nothing read. The *sending* of `HEARTBIT`
//! envelopes themselves is scheduled separately, by `manager.rs`'s recurring
//! timer tick.

use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Controls how often `HEARTBIT` envelopes are sent and how many missed
/// replies are tolerated before a channel is considered dead.
///
/// # Example
///
/// ```rust
/// use multiplexer::heartbeat::HeartbeatConfig;
/// use std::time::Duration;
///
/// let config = HeartbeatConfig::default();
/// let config = HeartbeatConfig::new(Duration::from_secs(60))
///     .with_timeout(Duration::from_secs(15))
///     .with_max_failures(5);
/// let config = HeartbeatConfig::disabled();
/// ```
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between `HEARTBIT` envelopes sent during idle periods.
    pub interval: Duration,

    /// Maximum time to wait for a reply before counting a failure.
    pub timeout: Duration,

    /// Consecutive failures tolerated before the channel is deemed dead.
    pub max_failures: u32,

    /// Whether heartbeats are emitted at all.
    pub enabled: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            max_failures: 3,
            enabled: true,
        }
    }
}

impl HeartbeatConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// A snapshot of a [`HeartbeatManager`]'s current health and statistics.
#[derive(Debug, Clone)]
pub struct HeartbeatStatus {
    pub running: bool,
    pub consecutive_failures: u32,
    pub total_pings: u32,
    pub total_pongs: u32,
}

/// Tracks when the next `HEARTBIT` is due and how healthy a channel has
/// been recently.
#[derive(Debug)]
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    last_ping: Option<Instant>,
    consecutive_failures: u32,
    total_pings: u32,
    total_pongs: u32,
    enabled: bool,
}

impl HeartbeatManager {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            enabled: config.enabled,
            config,
            last_ping: None,
            consecutive_failures: 0,
            total_pings: 0,
            total_pongs: 0,
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// True if enough time has passed since the last heartbeat, heartbeats
    /// are enabled, and the failure ceiling hasn't been hit.
    pub fn should_ping(&self) -> bool {
        if !self.enabled {
            return false;
        }
        if self.consecutive_failures >= self.config.max_failures {
            debug!("heartbeat: max failures reached, withholding further pings");
            return false;
        }
        match self.last_ping {
            None => true,
            Some(last) => last.elapsed() >= self.config.interval,
        }
    }

    pub fn on_ping_sent(&mut self) {
        self.last_ping = Some(Instant::now());
        self.total_pings += 1;
    }

    pub fn on_ping_success(&mut self) {
        self.consecutive_failures = 0;
        self.total_pongs += 1;
    }

    pub fn on_ping_failure(&mut self) {
        self.consecutive_failures += 1;
        warn!(
            consecutive_failures = self.consecutive_failures,
            "heartbeat failed"
        );
    }

    /// Resets the failure counter, e.g. after unrelated traffic proves the
    /// channel is actually still alive.
    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn is_connection_failed(&self) -> bool {
        self.consecutive_failures >= self.config.max_failures
    }

    pub fn status(&self) -> HeartbeatStatus {
        HeartbeatStatus {
            running: self.enabled,
            consecutive_failures: self.consecutive_failures,
            total_pings: self.total_pings,
            total_pongs: self.total_pongs,
        }
    }

    pub fn is_running(&self) -> bool {
        self.enabled
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }
}
