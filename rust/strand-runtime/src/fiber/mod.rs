//! Fibers: lightweight, cooperatively scheduled units of execution.
//!
//! A [`Fiber`] is a handle to a running (or finished) effect. Fibers forked
//! with [`Effect::fork`] are supervised by their parent: when the parent
//! finishes, any child still running is interrupted and awaited before the
//! parent's exit is published. Daemon fibers ([`Effect::fork_daemon`]) have
//! no parent.

mod id;
pub(crate) mod runtime;
pub(crate) mod waker;

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

pub use id::FiberId;
pub use runtime::FiberStatus;
pub use waker::Resume;

use crate::cause::Exit;
use crate::effect::primitive::{sync_node, unerase_exit, unit_node, with_fiber_node, AnyExit, Payload};
use crate::effect::Effect;
use runtime::{await_node, FiberRuntime};

pub struct Fiber<A, E> {
    runtime: Arc<FiberRuntime>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.runtime.id())
            .field("status", &self.runtime.status())
            .finish()
    }
}

impl<A: Payload, E: Payload> Fiber<A, E> {
    pub(crate) fn from_runtime(runtime: Arc<FiberRuntime>) -> Self {
        Self {
            runtime,
            _marker: PhantomData,
        }
    }

    pub(crate) fn runtime(&self) -> &Arc<FiberRuntime> {
        &self.runtime
    }

    pub fn id(&self) -> FiberId {
        self.runtime.id()
    }

    pub fn status(&self) -> FiberStatus {
        self.runtime.status()
    }

    /// Ids of supervised children that are still running.
    pub fn children(&self) -> Vec<FiberId> {
        self.runtime.children()
    }

    /// Suspend until the fiber is done and succeed with its exit.
    pub fn await_exit<X: Payload>(&self) -> Effect<Exit<A, E>, X> {
        Effect::<AnyExit, X>::from_node(await_node(Arc::clone(&self.runtime)))
            .map(unerase_exit::<A, E>)
    }

    /// Suspend until the fiber is done; its failure becomes ours.
    pub fn join(&self) -> Effect<A, E> {
        self.await_exit().flat_map(Effect::from_exit)
    }

    /// Interrupt the fiber on behalf of the current one and wait until it
    /// has fully finished, finalizers included.
    pub fn interrupt<X: Payload>(&self) -> Effect<Exit<A, E>, X> {
        let target = Arc::clone(&self.runtime);
        let send = Effect::<(), X>::from_node(with_fiber_node(move |ctx| {
            target.interrupt_as(ctx.fiber.id());
            unit_node()
        }));
        let this = self.clone();
        send.flat_map(move |()| this.await_exit())
    }

    /// Interrupt the fiber on behalf of `by` and wait for it.
    pub fn interrupt_as<X: Payload>(&self, by: FiberId) -> Effect<Exit<A, E>, X> {
        let this = self.clone();
        self.interrupt_as_fork::<X>(by)
            .flat_map(move |()| this.await_exit())
    }

    /// Send an interruption without waiting for the fiber to finish.
    pub fn interrupt_fork<X: Payload>(&self) -> Effect<(), X> {
        let target = Arc::clone(&self.runtime);
        Effect::from_node(with_fiber_node(move |ctx| {
            target.interrupt_as(ctx.fiber.id());
            unit_node()
        }))
    }

    /// Send an interruption on behalf of `by` without waiting.
    pub fn interrupt_as_fork<X: Payload>(&self, by: FiberId) -> Effect<(), X> {
        let target = Arc::clone(&self.runtime);
        Effect::from_node(sync_node(move || target.interrupt_as(by)))
    }

    /// The exit if the fiber is done; never suspends.
    pub fn poll<X: Payload>(&self) -> Effect<Option<Exit<A, E>>, X> {
        let this = self.clone();
        Effect::sync(move || this.poll_now())
    }

    pub fn poll_now(&self) -> Option<Exit<A, E>> {
        self.runtime.poll().map(unerase_exit::<A, E>)
    }
}
