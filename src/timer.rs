//! A delay-ordered callback scheduler backed by a single dedicated worker
//! thread, used for heartbeat emission and channel reconnect backoff.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct ScheduledTask {
    due: Instant,
    sequence: u64,
    callback: Callback,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}
impl Eq for ScheduledTask {}
impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.sequence).cmp(&(other.due, other.sequence))
    }
}

struct State {
    tasks: BinaryHeap<Reverse<ScheduledTask>>,
    closing: bool,
    complete_pending: bool,
}

/// A heap-ordered, single-worker-thread delay scheduler.
///
/// Mirrors a condition-variable worker loop: the worker blocks until the
/// earliest task is due or the scheduler is asked to stop, then invokes the
/// callback outside the lock so scheduling more work from inside a callback
/// does not deadlock.
pub struct Scheduler {
    state: Arc<Mutex<State>>,
    waiter: Arc<Condvar>,
    sequence: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(State {
            tasks: BinaryHeap::new(),
            closing: false,
            complete_pending: true,
        }));
        let waiter = Arc::new(Condvar::new());
        let worker = {
            let state = Arc::clone(&state);
            let waiter = Arc::clone(&waiter);
            thread::spawn(move || Scheduler::worker_loop(state, waiter))
        };
        Scheduler {
            state,
            waiter,
            sequence: AtomicU64::new(0),
            worker: Some(worker),
        }
    }

    /// Schedules `callback` to run after `delay`. Panics if the scheduler is
    /// already shutting down.
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        assert!(!state.closing, "scheduler is closing");
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        state.tasks.push(Reverse(ScheduledTask {
            due: Instant::now() + delay,
            sequence,
            callback: Box::new(callback),
        }));
        drop(state);
        self.waiter.notify_all();
    }

    fn worker_should_stop(state: &State) -> bool {
        state.closing && (!state.complete_pending || state.tasks.is_empty())
    }

    fn worker_loop(state: Arc<Mutex<State>>, waiter: Arc<Condvar>) {
        loop {
            let due_callback = {
                let mut guard = state.lock().unwrap();
                loop {
                    if Scheduler::worker_should_stop(&guard) {
                        return;
                    }
                    let next_due = guard.tasks.peek().map(|Reverse(task)| task.due);
                    match next_due {
                        None => {
                            guard = waiter.wait(guard).unwrap();
                        }
                        Some(due) => {
                            let now = Instant::now();
                            if due <= now {
                                break;
                            }
                            let (g, _) = waiter.wait_timeout(guard, due - now).unwrap();
                            guard = g;
                        }
                    }
                }
                guard.tasks.pop().map(|Reverse(task)| task.callback)
            };
            if let Some(callback) = due_callback {
                callback();
            }
        }
    }

    /// Signals shutdown and joins the worker thread. If `complete_pending`
    /// is true, already-scheduled tasks still run before the thread exits;
    /// otherwise the worker exits immediately.
    pub fn close(&mut self, complete_pending: bool) {
        {
            let mut state = self.state.lock().unwrap();
            state.closing = true;
            state.complete_pending = complete_pending;
        }
        self.waiter.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.close(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_callback_after_delay() {
        let scheduler = Scheduler::new();
        let (tx, rx) = mpsc::channel();
        scheduler.schedule(Duration::from_millis(10), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn runs_tasks_in_due_order() {
        let scheduler = Scheduler::new();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        scheduler.schedule(Duration::from_millis(40), move || tx2.send(2).unwrap());
        scheduler.schedule(Duration::from_millis(5), move || tx.send(1).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
    }

    #[test]
    fn close_with_complete_pending_runs_remaining_tasks() {
        let mut scheduler = Scheduler::new();
        let (tx, rx) = mpsc::channel();
        scheduler.schedule(Duration::from_millis(5), move || tx.send(()).unwrap());
        scheduler.close(true);
        assert!(rx.try_recv().is_ok());
    }
}
