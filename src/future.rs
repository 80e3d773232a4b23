//! A one-shot, terminal future: pending until `set` or `set_error` is called
//! exactly once, then fixed forever. Used for cross-thread completions such
//! as a channel's connect handshake.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Slot<T> {
    Pending,
    Value(T),
    Error(String),
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

/// A value that is set at most once, from any thread, and can be awaited
/// with a timeout from any other thread.
pub struct OneshotFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for OneshotFuture<T> {
    fn clone(&self) -> Self {
        OneshotFuture {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Error raised by a [`OneshotFuture`] that was resolved with an error, or
/// that timed out while waiting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FutureError {
    #[error("{0}")]
    Failed(String),
    #[error("future wait timed out")]
    TimedOut,
}

impl<T: Clone> OneshotFuture<T> {
    pub fn new() -> Self {
        OneshotFuture {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Pending),
                ready: Condvar::new(),
            }),
        }
    }

    /// Resolves the future with a value. Panics if already resolved — a
    /// future is set at most once, same as its reference implementation.
    pub fn set(&self, value: T) {
        let mut slot = self.inner.slot.lock().unwrap();
        assert!(matches!(*slot, Slot::Pending), "future already resolved");
        *slot = Slot::Value(value);
        self.inner.ready.notify_all();
    }

    /// Resolves the future with an error. Panics if already resolved.
    pub fn set_error(&self, message: impl Into<String>) {
        let mut slot = self.inner.slot.lock().unwrap();
        assert!(matches!(*slot, Slot::Pending), "future already resolved");
        *slot = Slot::Error(message.into());
        self.inner.ready.notify_all();
    }

    pub fn is_set(&self) -> bool {
        !matches!(*self.inner.slot.lock().unwrap(), Slot::Pending)
    }

    /// Blocks until resolved or `timeout` elapses. `None` blocks forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<T, FutureError> {
        let mut slot = self.inner.slot.lock().unwrap();
        loop {
            match &*slot {
                Slot::Value(v) => return Ok(v.clone()),
                Slot::Error(msg) => return Err(FutureError::Failed(msg.clone())),
                Slot::Pending => {}
            }
            match timeout {
                None => slot = self.inner.ready.wait(slot).unwrap(),
                Some(d) => {
                    let (guard, result) = self.inner.ready.wait_timeout(slot, d).unwrap();
                    slot = guard;
                    if result.timed_out() {
                        if let Slot::Pending = &*slot {
                            return Err(FutureError::TimedOut);
                        }
                    }
                }
            }
        }
    }
}

impl<T: Clone> Default for OneshotFuture<T> {
    fn default() -> Self {
        OneshotFuture::new()
    }
}

/// Waits for every future in `futures` to resolve, returning their values in
/// order, or the first error/timeout encountered.
pub fn wait_all<T: Clone>(
    futures: &[OneshotFuture<T>],
    timeout: Option<Duration>,
) -> Result<Vec<T>, FutureError> {
    let deadline = timeout.map(|d| std::time::Instant::now() + d);
    let mut out = Vec::with_capacity(futures.len());
    for f in futures {
        let remaining = deadline.map(|d| d.saturating_duration_since(std::time::Instant::now()));
        out.push(f.wait(remaining)?);
    }
    Ok(out)
}
