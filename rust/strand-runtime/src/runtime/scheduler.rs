//! Worker pool that runs fiber steps.
//!
//! Every worker owns a FIFO deque. Steps submitted from outside a worker
//! land in a shared injector. An idle worker looks for work in this order:
//! its own deque, a batch from the injector, a batch from a peer chosen at
//! random. Finding nothing, it parks for up to a millisecond; `spawn`
//! unparks workers round-robin.

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Duration;

use crate::defect::Defect;
use crate::error::RuntimeError;
use crate::fiber::FiberId;

/// A schedulable slice of a fiber's execution.
pub(crate) struct Task {
    pub(crate) fiber_id: FiberId,
    work: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Task {
    pub(crate) fn new<F>(fiber_id: FiberId, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            fiber_id,
            work: Some(Box::new(f)),
        }
    }

    /// Run the step. A second call does nothing.
    pub(crate) fn run(&mut self) {
        if let Some(f) = self.work.take() {
            f();
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("fiber_id", &self.fiber_id)
            .field("has_work", &self.work.is_some())
            .finish()
    }
}

/// Cheap handle used to submit tasks from any thread.
#[derive(Clone)]
pub(crate) struct SchedulerHandle {
    global_queue: Arc<Injector<Task>>,
    threads: Arc<Vec<Thread>>,
    next_unpark: Arc<AtomicUsize>,
}

impl SchedulerHandle {
    /// Push a task onto the global injection queue and nudge a worker.
    pub(crate) fn spawn(&self, task: Task) {
        self.global_queue.push(task);
        if !self.threads.is_empty() {
            let idx = self.next_unpark.fetch_add(1, Ordering::Relaxed) % self.threads.len();
            self.threads[idx].unpark();
        }
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("workers", &self.threads.len())
            .finish()
    }
}

pub(crate) struct Scheduler {
    global_queue: Arc<Injector<Task>>,
    join_handles: Vec<Option<thread::JoinHandle<()>>>,
    handle: SchedulerHandle,
    shutdown: Arc<AtomicBool>,
    worker_count: usize,
    completed_count: Arc<AtomicUsize>,
}

impl Scheduler {
    /// Start `num_workers` OS threads (`0` means one per CPU), named
    /// `{prefix}-{index}`.
    pub(crate) fn new(num_workers: usize, prefix: &str) -> Result<Self, RuntimeError> {
        let num_workers = if num_workers == 0 {
            num_cpus::get().max(1)
        } else {
            num_workers
        };

        let global_queue = Arc::new(Injector::<Task>::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let completed_count = Arc::new(AtomicUsize::new(0));

        let deques: Vec<Worker<Task>> = (0..num_workers).map(|_| Worker::new_fifo()).collect();
        let stealers: Arc<Vec<Stealer<Task>>> = Arc::new(deques.iter().map(Worker::stealer).collect());

        let mut join_handles: Vec<Option<thread::JoinHandle<()>>> = Vec::with_capacity(num_workers);
        let mut threads: Vec<Thread> = Vec::with_capacity(num_workers);
        for (idx, local) in deques.into_iter().enumerate() {
            let global = Arc::clone(&global_queue);
            let shutdown_flag = Arc::clone(&shutdown);
            let peer_stealers = Arc::clone(&stealers);
            let completed = Arc::clone(&completed_count);

            let spawned = thread::Builder::new()
                .name(format!("{}-{}", prefix, idx))
                .spawn(move || {
                    worker_loop(idx, local, global, peer_stealers, shutdown_flag, completed);
                });
            let jh = match spawned {
                Ok(jh) => jh,
                Err(source) => {
                    // Stop the workers already started before reporting.
                    shutdown.store(true, Ordering::Release);
                    for jh in join_handles.into_iter().flatten() {
                        let _ = jh.join();
                    }
                    return Err(RuntimeError::WorkerSpawn { index: idx, source });
                }
            };
            threads.push(jh.thread().clone());
            join_handles.push(Some(jh));
        }

        let handle = SchedulerHandle {
            global_queue: Arc::clone(&global_queue),
            threads: Arc::new(threads),
            next_unpark: Arc::new(AtomicUsize::new(0)),
        };

        Ok(Self {
            global_queue,
            join_handles,
            handle,
            shutdown,
            worker_count: num_workers,
            completed_count,
        })
    }

    pub(crate) fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub(crate) fn completed_count(&self) -> usize {
        self.completed_count.load(Ordering::Acquire)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop the workers and wait for them to exit. Tasks still queued are
    /// dropped without running.
    pub(crate) fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let current = thread::current().id();
        for slot in &mut self.join_handles {
            if let Some(jh) = slot.take() {
                jh.thread().unpark();
                // A worker cannot join itself.
                if jh.thread().id() != current {
                    let _ = jh.join();
                }
            }
        }
        let mut dropped = 0usize;
        loop {
            match self.global_queue.steal() {
                Steal::Success(_) => dropped += 1,
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        if dropped > 0 {
            tracing::debug!(dropped, "discarded queued fiber steps at shutdown");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            self.shutdown();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_count", &self.worker_count)
            .field("completed_count", &self.completed_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Small per-worker PRNG (xorshift32) used to pick a steal victim.
fn xorshift32(state: &mut u32) -> u32 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *state = x;
    x
}

fn run_task(mut task: Task, completed: &AtomicUsize) {
    let fiber_id = task.fiber_id;
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
        let defect = Defect::from_panic(payload);
        tracing::error!(fiber = %fiber_id, %defect, "task panicked outside the fiber boundary");
    }
    completed.fetch_add(1, Ordering::Release);
}

/// Next step for worker `idx`, or `None` when every queue looked empty.
fn find_task(
    idx: usize,
    local: &Worker<Task>,
    global: &Injector<Task>,
    stealers: &[Stealer<Task>],
    rng_state: &mut u32,
) -> Option<Task> {
    if let Some(task) = local.pop() {
        return Some(task);
    }
    loop {
        match global.steal_batch_and_pop(local) {
            Steal::Success(task) => return Some(task),
            Steal::Retry => thread::yield_now(),
            Steal::Empty => break,
        }
    }
    let peers = stealers.len();
    if peers < 2 {
        return None;
    }
    let start = xorshift32(rng_state) as usize % peers;
    (0..peers)
        .map(|offset| (start + offset) % peers)
        .filter(|&victim| victim != idx)
        .find_map(|victim| stealers[victim].steal_batch_and_pop(local).success())
}

fn worker_loop(
    idx: usize,
    local: Worker<Task>,
    global: Arc<Injector<Task>>,
    stealers: Arc<Vec<Stealer<Task>>>,
    shutdown: Arc<AtomicBool>,
    completed: Arc<AtomicUsize>,
) {
    // xorshift32 is stuck at zero.
    let mut rng_state: u32 = (idx as u32).wrapping_mul(2_654_435_761).max(1);
    while !shutdown.load(Ordering::Acquire) {
        match find_task(idx, &local, &global, &stealers, &mut rng_state) {
            Some(task) => run_task(task, &completed),
            None => thread::park_timeout(Duration::from_millis(1)),
        }
    }
}
