//! Timer thread driving `Effect::sleep` and everything built on it.
//!
//! A single thread owns a min-heap of deadlines. Commands arrive over a
//! crossbeam channel; the thread blocks on the channel until the earliest
//! deadline, fires due actions, and goes back to waiting.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::defect::Defect;
use crate::error::RuntimeError;

type Action = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Schedule {
        id: u64,
        deadline: Instant,
        action: Action,
    },
    Cancel(u64),
    Shutdown,
}

#[derive(Clone)]
pub(crate) struct TimerHandle {
    tx: Sender<Command>,
    next_id: Arc<AtomicU64>,
    /// Actions scheduled and neither fired nor cancelled yet.
    armed: Arc<AtomicUsize>,
}

impl TimerHandle {
    /// Run `action` on the timer thread once `delay` has elapsed. Returns an
    /// id usable with [`TimerHandle::cancel`].
    pub(crate) fn schedule(&self, delay: Duration, action: impl FnOnce() + Send + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        let command = Command::Schedule {
            id,
            deadline,
            action: Box::new(action),
        };
        self.armed.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(command).is_err() {
            self.armed.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(id, "timer stopped; sleep will never complete");
        }
        id
    }

    pub(crate) fn cancel(&self, id: u64) {
        // A stopped timer has nothing left to cancel.
        let _ = self.tx.send(Command::Cancel(id));
    }

    pub(crate) fn armed(&self) -> usize {
        self.armed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle").finish_non_exhaustive()
    }
}

pub(crate) struct Timer {
    handle: TimerHandle,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl Timer {
    pub(crate) fn start(name: String) -> Result<Self, RuntimeError> {
        let (tx, rx) = unbounded();
        let armed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&armed);
        let join_handle = thread::Builder::new()
            .name(name)
            .spawn(move || timer_loop(rx, &counter))
            .map_err(RuntimeError::TimerSpawn)?;
        Ok(Self {
            handle: TimerHandle {
                tx,
                next_id: Arc::new(AtomicU64::new(1)),
                armed,
            },
            join_handle: Some(join_handle),
        })
    }

    pub(crate) fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    /// Stop the timer thread. Pending actions are dropped unfired.
    pub(crate) fn shutdown(&mut self) {
        if let Some(jh) = self.join_handle.take() {
            let _ = self.handle.tx.send(Command::Shutdown);
            if jh.thread().id() != thread::current().id() {
                let _ = jh.join();
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(rx: Receiver<Command>, armed: &AtomicUsize) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut pending: HashMap<u64, Action> = HashMap::new();

    loop {
        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            deadlines.pop();
            if let Some(action) = pending.remove(&id) {
                armed.fetch_sub(1, Ordering::AcqRel);
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
                    let defect = Defect::from_panic(payload);
                    tracing::warn!(id, %defect, "timer action panicked");
                }
            }
        }

        let command = match deadlines.peek() {
            Some(Reverse((deadline, _))) => rx.recv_timeout(deadline.saturating_duration_since(now)),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match command {
            Ok(Command::Schedule {
                id,
                deadline,
                action,
            }) => {
                deadlines.push(Reverse((deadline, id)));
                pending.insert(id, action);
            }
            Ok(Command::Cancel(id)) => {
                if pending.remove(&id).is_some() {
                    armed.fetch_sub(1, Ordering::AcqRel);
                }
            }
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    if !pending.is_empty() {
        tracing::debug!(pending = pending.len(), "timer stopped with pending actions");
    }
}
