//! The runtime: worker pool, timer, and fiber registry.
//!
//! [`Runtime`] is the boundary between ordinary threads and effects. It
//! owns the worker threads and the timer thread; every fiber holds a
//! reference to the [`Shared`] state to schedule itself and to look up other
//! fibers by id.

pub(crate) mod scheduler;
pub(crate) mod timer;

use crossbeam_channel::bounded;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cause::{Cause, Exit};
use crate::cell::SyncCell;
use crate::config::RuntimeConfig;
use crate::defect::Defect;
use crate::effect::primitive::{unerase_exit, AnyExit, Payload};
use crate::effect::Effect;
use crate::error::RuntimeError;
use crate::fiber::runtime::{FiberRuntime, RunState, Step};
use crate::fiber::{Fiber, FiberId};
use scheduler::{Scheduler, SchedulerHandle, Task};
use timer::{Timer, TimerHandle};

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

/// State shared by every fiber of one runtime.
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) timer: TimerHandle,
    queue: SchedulerHandle,
    /// Arena of live fibers keyed by id.
    registry: SyncCell<HashMap<FiberId, Arc<FiberRuntime>>>,
    fibers_started: AtomicU64,
    fibers_finished: AtomicU64,
}

impl Shared {
    pub(crate) fn schedule(&self, fiber: Arc<FiberRuntime>, run: RunState, step: Step) {
        let id = fiber.id();
        self.queue.spawn(Task::new(id, move || fiber.run(run, step)));
    }

    pub(crate) fn register(&self, fiber: Arc<FiberRuntime>) {
        self.fibers_started.fetch_add(1, Ordering::Relaxed);
        self.registry.modify(|r| {
            r.insert(fiber.id(), fiber);
        });
    }

    pub(crate) fn unregister(&self, id: FiberId) {
        self.fibers_finished.fetch_add(1, Ordering::Relaxed);
        self.registry.modify(|r| {
            r.remove(&id);
        });
    }

    pub(crate) fn lookup(&self, id: FiberId) -> Option<Arc<FiberRuntime>> {
        self.registry.with(|r| r.get(&id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Counters describing a runtime's activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStats {
    pub workers: usize,
    pub fibers_started: u64,
    pub fibers_finished: u64,
    /// Fibers registered and not yet done.
    pub fibers_live: usize,
    /// Fiber steps executed by the worker pool.
    pub steps_completed: usize,
    /// Timer entries (sleeps, timeouts) neither fired nor cancelled.
    pub timers_armed: usize,
}

pub struct Runtime {
    shared: Arc<Shared>,
    scheduler: Scheduler,
    timer: Timer,
}

impl Runtime {
    /// Start a runtime configured from `strand.toml` and the environment.
    pub fn new() -> Result<Self, RuntimeError> {
        Self::with_config(RuntimeConfig::load())
    }

    /// Start a runtime configured from the TOML file at `path`, plus
    /// environment overrides.
    pub fn from_config_file(path: &Path) -> Result<Self, RuntimeError> {
        Self::with_config(RuntimeConfig::load_from(path)?.with_env_overrides())
    }

    pub fn with_config(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let scheduler = Scheduler::new(config.workers, &config.thread_name_prefix)?;
        let timer = Timer::start(format!("{}-timer", config.thread_name_prefix))?;
        tracing::info!(
            workers = scheduler.worker_count(),
            max_ops_before_yield = config.max_ops_before_yield,
            "runtime started"
        );
        let shared = Arc::new(Shared {
            config,
            timer: timer.handle(),
            queue: scheduler.handle(),
            registry: SyncCell::new(HashMap::new()),
            fibers_started: AtomicU64::new(0),
            fibers_finished: AtomicU64::new(0),
        });
        Ok(Self {
            shared,
            scheduler,
            timer,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Start `effect` on a new root fiber and return its handle immediately.
    pub fn fork<A: Payload, E: Payload>(&self, effect: Effect<A, E>) -> Fiber<A, E> {
        let fiber = FiberRuntime::new(Arc::clone(&self.shared), None, true);
        fiber.start(effect.node, true);
        Fiber::from_runtime(fiber)
    }

    /// Run `effect` on a new root fiber and block the calling thread until it
    /// is done.
    ///
    /// Must not be called from inside a fiber: it would block a worker.
    pub fn run<A: Payload, E: Payload>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        let fiber = self.fork(effect);
        let (tx, rx) = bounded::<AnyExit>(1);
        fiber.runtime().observe(Box::new(move |exit: &AnyExit| {
            // The receiver only goes away if the caller stopped waiting.
            let _ = tx.send(exit.clone());
        }));
        match rx.recv() {
            Ok(exit) => unerase_exit(exit),
            Err(_) => Exit::Failure(Cause::Die(Defect::new(
                "runtime shut down before the fiber completed",
            ))),
        }
    }

    pub fn run_result<A: Payload, E: Payload>(&self, effect: Effect<A, E>) -> Result<A, Cause<E>> {
        self.run(effect).into_result()
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            workers: self.scheduler.worker_count(),
            fibers_started: self.shared.fibers_started.load(Ordering::Relaxed),
            fibers_finished: self.shared.fibers_finished.load(Ordering::Relaxed),
            fibers_live: self.shared.registry.with(|r| r.len()),
            steps_completed: self.scheduler.completed_count(),
            timers_armed: self.shared.timer.armed(),
        }
    }

    /// Stop the worker and timer threads. Fibers still running are
    /// abandoned; blocked [`Runtime::run`] callers observe a defect.
    pub fn shutdown(&mut self) {
        if self.scheduler.is_shutdown() {
            return;
        }
        self.scheduler.shutdown();
        self.timer.shutdown();
        // Live fibers reference the shared state; dropping them breaks the
        // cycle and releases anyone still waiting on them.
        let abandoned = self.shared.registry.modify(std::mem::take);
        if !abandoned.is_empty() {
            tracing::warn!(fibers = abandoned.len(), "runtime shut down with live fibers");
        }
        drop(abandoned);
        tracing::info!("runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.shared.config)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::with_config(RuntimeConfig {
            workers: 2,
            thread_name_prefix: "rt-test".to_string(),
            ..RuntimeConfig::default()
        })
        .expect("runtime")
    }

    #[test]
    fn run_blocks_until_done() {
        let rt = runtime();
        let effect: Effect<i32, String> = Effect::sleep(Duration::from_millis(5)).as_(3);
        assert_eq!(rt.run(effect), Exit::succeed(3));
        assert_eq!(
            rt.run_result(Effect::<i32, String>::fail("no".into())),
            Err(Cause::fail("no".to_string()))
        );
    }

    #[test]
    fn panics_become_defects() {
        let rt = runtime();
        let effect: Effect<i32> = Effect::sync(|| panic!("kaboom"));
        match rt.run(effect) {
            Exit::Failure(Cause::Die(defect)) => assert_eq!(defect.message(), "kaboom"),
            other => panic!("unexpected exit {other:?}"),
        }
    }

    #[test]
    fn long_loops_yield_to_other_fibers() {
        let rt = Runtime::with_config(RuntimeConfig {
            workers: 1,
            max_ops_before_yield: 16,
            ..RuntimeConfig::default()
        })
        .expect("runtime");
        let spin: Effect<u64> = (0..2_000u64).fold(Effect::succeed(0), |acc, _| acc.map(|n| n + 1));
        let background = rt.fork(spin.clone());
        assert_eq!(rt.run(spin), Exit::succeed(2_000));
        assert_eq!(rt.run(background.join()), Exit::succeed(2_000));
    }

    #[test]
    fn stats_track_fibers() {
        let rt = runtime();
        let before = rt.stats();
        assert_eq!(before.workers, 2);
        rt.run(Effect::<(), String>::unit());
        let after = rt.stats();
        assert!(after.fibers_started > before.fibers_started);
        assert_eq!(after.fibers_live, 0);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let path = std::env::temp_dir().join("strand-runtime-missing.toml");
        match Runtime::from_config_file(&path) {
            Err(RuntimeError::Config(ConfigError::Io { .. })) => {}
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut rt = runtime();
        rt.shutdown();
        rt.shutdown();
    }
}
