//! Fiber records and the run loop.
//!
//! A fiber is a trampolined continuation machine: an explicit stack of
//! [`Frame`]s plus the current [`Step`]. The loop never recurses on the
//! native stack; every instruction either produces a value, pushes a frame,
//! or parks the fiber until a [`Waker`] reschedules it on the worker pool.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::id::FiberId;
use super::waker::Waker;
use crate::cause::{Cause, Exit};
use crate::cell::SyncCell;
use crate::config::RuntimeConfig;
use crate::defect::catch_defect;
use crate::effect::primitive::{
    async_node, flat_map_node, result_node, set_interruptible_node, succeed_node, sync_node,
    unit_node, AnyCause, AnyExit, AnyValue, Cont, Handler, Node, Primitive, Register,
};
use crate::runtime::Shared;

pub(crate) type Observer = Box<dyn FnOnce(&AnyExit) + Send>;

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

pub(crate) enum Frame {
    OnSuccess(Cont),
    Fold(Handler, Cont),
    RestoreInterrupt(bool),
}

pub(crate) struct RunState {
    stack: Vec<Frame>,
    interruptible: bool,
}

impl RunState {
    pub(crate) fn new(interruptible: bool) -> Self {
        Self {
            stack: Vec::new(),
            interruptible,
        }
    }
}

pub(crate) enum Step {
    Eval(Node),
    Done(Result<AnyValue, AnyCause>),
}

/// Externally visible lifecycle of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    Running,
    Suspended,
    Done,
}

enum Status {
    Running,
    /// Inside an `Async` registration; a wake-up arriving now is parked in
    /// `resumed` and picked up by the registering worker.
    Suspending {
        resumed: Option<Node>,
    },
    Suspended {
        run: RunState,
        canceler: Option<Node>,
    },
    Done(AnyExit),
}

struct FiberState {
    status: Status,
    /// Bumped on every suspension and resumption; wakers carry the epoch they
    /// were issued for.
    epoch: u64,
    interrupt_cause: Option<AnyCause>,
    children: BTreeSet<FiberId>,
    observers: BTreeMap<u64, Observer>,
    next_observer: u64,
}

/// What an instruction sees of the fiber evaluating it.
pub(crate) struct FiberContext<'a> {
    pub(crate) fiber: &'a Arc<FiberRuntime>,
    pub(crate) interruptible: bool,
}

// ---------------------------------------------------------------------------
// FiberRuntime
// ---------------------------------------------------------------------------

pub(crate) struct FiberRuntime {
    id: FiberId,
    parent: Option<FiberId>,
    daemon: bool,
    shared: Arc<Shared>,
    interrupt_requested: AtomicBool,
    state: SyncCell<FiberState>,
}

impl FiberRuntime {
    pub(crate) fn new(shared: Arc<Shared>, parent: Option<FiberId>, daemon: bool) -> Arc<Self> {
        Arc::new(Self {
            id: FiberId::next(),
            parent,
            daemon,
            shared,
            interrupt_requested: AtomicBool::new(false),
            state: SyncCell::new(FiberState {
                status: Status::Running,
                epoch: 0,
                interrupt_cause: None,
                children: BTreeSet::new(),
                observers: BTreeMap::new(),
                next_observer: 0,
            }),
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Register the fiber and schedule its first step.
    pub(crate) fn start(self: &Arc<Self>, node: Node, interruptible: bool) {
        self.shared.register(Arc::clone(self));
        tracing::trace!(fiber = %self.id, parent = ?self.parent, daemon = self.daemon, "fiber started");
        self.shared
            .schedule(Arc::clone(self), RunState::new(interruptible), Step::Eval(node));
    }

    /// Fork `node` as a new fiber. Non-daemon children are supervised by
    /// this fiber; they inherit its current interrupt status either way.
    pub(crate) fn fork_child(
        self: &Arc<Self>,
        node: Node,
        interruptible: bool,
        daemon: bool,
    ) -> Arc<FiberRuntime> {
        let parent = if daemon { None } else { Some(self.id) };
        let child = FiberRuntime::new(Arc::clone(&self.shared), parent, daemon);
        if !daemon {
            self.state.modify(|s| {
                s.children.insert(child.id);
            });
        }
        child.start(node, interruptible);
        child
    }

    pub(crate) fn status(&self) -> FiberStatus {
        self.state.with(|s| match s.status {
            Status::Running | Status::Suspending { .. } => FiberStatus::Running,
            Status::Suspended { .. } => FiberStatus::Suspended,
            Status::Done(_) => FiberStatus::Done,
        })
    }

    pub(crate) fn poll(&self) -> Option<AnyExit> {
        self.state.with(|s| match &s.status {
            Status::Done(exit) => Some(exit.clone()),
            _ => None,
        })
    }

    pub(crate) fn children(&self) -> Vec<FiberId> {
        self.state.with(|s| s.children.iter().copied().collect())
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupt_requested.load(Ordering::Acquire)
    }

    fn interrupt_cause(&self) -> AnyCause {
        self.state
            .with(|s| s.interrupt_cause.clone())
            .unwrap_or(Cause::Interrupt(FiberId::NONE))
    }

    /// Run `observer` with the exit once the fiber is done (immediately if
    /// it already is). Returns a key for [`FiberRuntime::unobserve`] while
    /// the fiber is still running.
    pub(crate) fn observe(&self, observer: Observer) -> Option<u64> {
        let registered = self.state.modify(|s| match &s.status {
            Status::Done(exit) => Err((exit.clone(), observer)),
            _ => {
                let key = s.next_observer;
                s.next_observer += 1;
                s.observers.insert(key, observer);
                Ok(key)
            }
        });
        match registered {
            Ok(key) => Some(key),
            Err((exit, observer)) => {
                observer(&exit);
                None
            }
        }
    }

    pub(crate) fn unobserve(&self, key: u64) {
        self.state.modify(|s| {
            s.observers.remove(&key);
        });
    }

    fn remove_child(&self, child: FiberId) {
        self.state.modify(|s| {
            s.children.remove(&child);
        });
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    pub(crate) fn run(self: Arc<Self>, mut run: RunState, mut step: Step) {
        let budget = self.shared.config.max_ops_before_yield.max(1);
        let mut ops = 0usize;
        loop {
            // Interruption checkpoint.
            if run.interruptible
                && !matches!(step, Step::Done(Err(_)))
                && self.interrupt_requested.load(Ordering::Acquire)
            {
                step = Step::Done(Err(self.interrupt_cause()));
            }

            ops += 1;
            if ops > budget {
                let shared = Arc::clone(&self.shared);
                shared.schedule(self, run, step);
                return;
            }

            step = match step {
                Step::Eval(node) => match &*node {
                    Primitive::Succeed(value) => Step::Done(Ok(Arc::clone(value))),
                    Primitive::Failure(cause) => Step::Done(Err(cause.clone())),
                    Primitive::Sync(f) => match catch_defect(|| f()) {
                        Ok(result) => Step::Done(result),
                        Err(defect) => Step::Done(Err(Cause::Die(defect))),
                    },
                    Primitive::Suspend(f) => guarded(|| f()),
                    Primitive::FlatMap(inner, k) => {
                        run.stack.push(Frame::OnSuccess(Arc::clone(k)));
                        Step::Eval(Arc::clone(inner))
                    }
                    Primitive::Fold(inner, on_failure, on_success) => {
                        run.stack
                            .push(Frame::Fold(Arc::clone(on_failure), Arc::clone(on_success)));
                        Step::Eval(Arc::clone(inner))
                    }
                    Primitive::SetInterruptible(inner, flag) => {
                        if *flag != run.interruptible {
                            run.stack.push(Frame::RestoreInterrupt(run.interruptible));
                            run.interruptible = *flag;
                        }
                        Step::Eval(Arc::clone(inner))
                    }
                    Primitive::WithStatus(f) => {
                        let status = run.interruptible;
                        guarded(|| f(status))
                    }
                    Primitive::WithFiber(f) => {
                        let ctx = FiberContext {
                            fiber: &self,
                            interruptible: run.interruptible,
                        };
                        guarded(|| f(&ctx))
                    }
                    Primitive::Yield => {
                        let shared = Arc::clone(&self.shared);
                        let unit: AnyValue = Arc::new(());
                        shared.schedule(self, run, Step::Done(Ok(unit)));
                        return;
                    }
                    Primitive::Async(register) => {
                        let register = Arc::clone(register);
                        match self.suspend(run, &register) {
                            Some((resumed, next)) => {
                                run = resumed;
                                next
                            }
                            None => return,
                        }
                    }
                },
                Step::Done(result) => match run.stack.pop() {
                    Some(frame) => self.unwind(frame, result, &mut run),
                    None => match self.children_cleanup(&result) {
                        Some(node) => Step::Eval(node),
                        None => {
                            self.finish(result);
                            return;
                        }
                    },
                },
            };
        }
    }

    fn unwind(&self, frame: Frame, result: Result<AnyValue, AnyCause>, run: &mut RunState) -> Step {
        match (frame, result) {
            (Frame::RestoreInterrupt(flag), result) => {
                run.interruptible = flag;
                Step::Done(result)
            }
            (Frame::OnSuccess(k) | Frame::Fold(_, k), Ok(value)) => guarded(|| k(value)),
            (Frame::OnSuccess(_), Err(cause)) => Step::Done(Err(cause)),
            (Frame::Fold(on_failure, _), Err(cause)) => {
                // An interrupted fiber only runs uninterruptible handlers.
                if run.interruptible && self.is_interrupted() {
                    Step::Done(Err(cause))
                } else {
                    guarded(|| on_failure(cause))
                }
            }
        }
    }

    /// Park the fiber inside an `Async` registration. Returns the state to
    /// continue with when the fiber can keep running on this worker.
    fn suspend(self: &Arc<Self>, run: RunState, register: &Register) -> Option<(RunState, Step)> {
        let epoch = self.state.modify(|s| {
            s.epoch += 1;
            s.status = Status::Suspending { resumed: None };
            s.epoch
        });

        let canceler = match catch_defect(|| register(Waker::new(Arc::clone(self), epoch))) {
            Ok(canceler) => canceler,
            Err(defect) => {
                self.state.modify(|s| {
                    s.epoch += 1;
                    s.status = Status::Running;
                });
                return Some((run, Step::Done(Err(Cause::Die(defect)))));
            }
        };

        let interruptible = run.interruptible;
        let next = self.state.modify(move |s| {
            match std::mem::replace(&mut s.status, Status::Running) {
                Status::Suspending {
                    resumed: Some(node),
                } => {
                    s.epoch += 1;
                    Some((run, Step::Eval(node)))
                }
                _ if interruptible && s.interrupt_cause.is_some() => {
                    s.epoch += 1;
                    let mut run = run;
                    let step = enter_canceler(&mut run, canceler);
                    Some((run, step))
                }
                _ => {
                    s.status = Status::Suspended { run, canceler };
                    None
                }
            }
        });
        if next.is_none() {
            tracing::trace!(fiber = %self.id, "fiber suspended");
        }
        next
    }

    /// Continue a suspension identified by `epoch` with `node`.
    pub(crate) fn resume(self: &Arc<Self>, epoch: u64, node: Node) -> bool {
        enum Wake {
            Stale,
            Parked,
            Reschedule(RunState, Node),
        }

        let wake = self.state.modify(move |s| {
            if s.epoch != epoch {
                return Wake::Stale;
            }
            match std::mem::replace(&mut s.status, Status::Running) {
                Status::Suspending { resumed: None } => {
                    s.status = Status::Suspending {
                        resumed: Some(node),
                    };
                    Wake::Parked
                }
                Status::Suspended { run, .. } => {
                    s.epoch += 1;
                    Wake::Reschedule(run, node)
                }
                other => {
                    s.status = other;
                    Wake::Stale
                }
            }
        });

        match wake {
            Wake::Stale => false,
            Wake::Parked => true,
            Wake::Reschedule(run, node) => {
                self.shared.schedule(Arc::clone(self), run, Step::Eval(node));
                true
            }
        }
    }

    /// Request interruption on behalf of `by`. A fiber parked in an
    /// interruptible region is woken to run its canceler; otherwise the
    /// request is picked up at the next checkpoint.
    pub(crate) fn interrupt_as(self: &Arc<Self>, by: FiberId) {
        let parked = self.state.modify(|s| {
            if matches!(s.status, Status::Done(_)) {
                return None;
            }
            let cause = match s.interrupt_cause.take() {
                Some(prev) if prev.interruptors().contains(&by) => prev,
                Some(prev) => prev.both(Cause::Interrupt(by)),
                None => Cause::Interrupt(by),
            };
            s.interrupt_cause = Some(cause);
            self.interrupt_requested.store(true, Ordering::Release);
            match std::mem::replace(&mut s.status, Status::Running) {
                Status::Suspended { run, canceler } if run.interruptible => {
                    s.epoch += 1;
                    Some((run, canceler))
                }
                other => {
                    s.status = other;
                    None
                }
            }
        });

        tracing::trace!(fiber = %self.id, by = %by, "interrupt requested");
        if let Some((mut run, canceler)) = parked {
            let step = enter_canceler(&mut run, canceler);
            self.shared.schedule(Arc::clone(self), run, step);
        }
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Interrupt and await live children before the exit is published.
    fn children_cleanup(&self, result: &Result<AnyValue, AnyCause>) -> Option<Node> {
        let ids = self.state.modify(|s| std::mem::take(&mut s.children));
        let live: Vec<Arc<FiberRuntime>> = ids
            .into_iter()
            .filter_map(|id| self.shared.lookup(id))
            .collect();
        if live.is_empty() {
            return None;
        }
        tracing::trace!(fiber = %self.id, children = live.len(), "interrupting children");
        let result = result.clone();
        let node = flat_map_node(interrupt_all_node(live, self.id), move |_| {
            result_node(result.clone())
        });
        Some(set_interruptible_node(node, false))
    }

    fn finish(self: &Arc<Self>, result: Result<AnyValue, AnyCause>) {
        let exit = match result {
            Ok(value) => Exit::Success(value),
            Err(cause) => Exit::Failure(cause),
        };
        let observers = self.state.modify(|s| {
            s.status = Status::Done(exit.clone());
            s.epoch += 1;
            std::mem::take(&mut s.observers)
        });
        self.shared.unregister(self.id);
        if let Some(parent) = self.parent.and_then(|id| self.shared.lookup(id)) {
            parent.remove_child(self.id);
        }
        self.report(&exit, observers.is_empty());
        for (_, observer) in observers {
            observer(&exit);
        }
    }

    fn report(&self, exit: &AnyExit, unobserved: bool) {
        match exit {
            Exit::Success(_) => tracing::debug!(fiber = %self.id, "fiber succeeded"),
            Exit::Failure(cause)
                if self.daemon
                    && unobserved
                    && cause.is_die()
                    && self.shared.config.log_daemon_defects =>
            {
                tracing::warn!(fiber = %self.id, cause = %cause, "daemon fiber died with an unobserved defect");
            }
            Exit::Failure(cause) => tracing::debug!(
                fiber = %self.id,
                interrupted = cause.is_interrupted(),
                "fiber failed"
            ),
        }
    }
}

fn guarded(f: impl FnOnce() -> Node) -> Step {
    match catch_defect(f) {
        Ok(node) => Step::Eval(node),
        Err(defect) => Step::Done(Err(Cause::Die(defect))),
    }
}

/// Step into the canceler of an interrupted suspension. The run state is
/// made uninterruptible up front so the checkpoint cannot skip the
/// canceler; once its frame pops, the checkpoint delivers the interruption.
fn enter_canceler(run: &mut RunState, canceler: Option<Node>) -> Step {
    run.stack.push(Frame::RestoreInterrupt(run.interruptible));
    run.interruptible = false;
    Step::Eval(canceler.unwrap_or_else(unit_node))
}

/// Suspend until `fiber` is done; succeeds with its erased [`AnyExit`].
pub(crate) fn await_node(fiber: Arc<FiberRuntime>) -> Node {
    async_node(move |waker: Waker| {
        let key = fiber.observe(Box::new(move |exit: &AnyExit| {
            waker.wake(succeed_node(Arc::new(exit.clone())));
        }))?;
        let fiber = Arc::clone(&fiber);
        Some(sync_node(move || fiber.unobserve(key)))
    })
}

/// Send interruption to every fiber, then await each of them in turn.
pub(crate) fn interrupt_all_node(fibers: Vec<Arc<FiberRuntime>>, by: FiberId) -> Node {
    let targets = fibers.clone();
    let send = sync_node(move || {
        for fiber in &targets {
            fiber.interrupt_as(by);
        }
    });
    fibers.into_iter().fold(send, |acc, fiber| {
        flat_map_node(acc, move |_| await_node(Arc::clone(&fiber)))
    })
}
