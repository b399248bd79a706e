use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::id::FiberId;
use super::runtime::FiberRuntime;
use crate::effect::primitive::{erase, fail_node, succeed_node, Node, Payload};
use crate::effect::Effect;
use crate::cause::Cause;
use crate::runtime::timer::TimerHandle;

/// One-shot wake-up handle for a fiber suspended in an `Async` instruction.
///
/// Tied to a single suspension: once the fiber has been resumed (or has
/// moved on after an interruption) further wake-ups are ignored.
#[derive(Clone)]
pub(crate) struct Waker {
    fiber: Arc<FiberRuntime>,
    epoch: u64,
}

impl Waker {
    pub(crate) fn new(fiber: Arc<FiberRuntime>, epoch: u64) -> Self {
        Self { fiber, epoch }
    }

    /// Continue the suspended fiber with `node`. Returns `false` if the
    /// suspension is no longer current.
    pub(crate) fn wake(&self, node: Node) -> bool {
        self.fiber.resume(self.epoch, node)
    }

    pub(crate) fn fiber_id(&self) -> FiberId {
        self.fiber.id()
    }

    pub(crate) fn timer(&self) -> TimerHandle {
        self.fiber.shared().timer.clone()
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waker")
            .field("fiber", &self.fiber.id())
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Typed callback handed to [`Effect::async_`] registrations.
pub struct Resume<A, E = Infallible> {
    waker: Waker,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Resume<A, E> {
    fn clone(&self) -> Self {
        Self {
            waker: self.waker.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Resume<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Resume").field(&self.waker).finish()
    }
}

impl<A: Payload, E: Payload> Resume<A, E> {
    pub(crate) fn new(waker: Waker) -> Self {
        Self {
            waker,
            _marker: PhantomData,
        }
    }

    /// Continue the suspended fiber with `effect`. Returns `false` if the
    /// fiber was already resumed or has been interrupted meanwhile.
    pub fn resume(&self, effect: Effect<A, E>) -> bool {
        self.waker.wake(effect.node)
    }

    pub fn succeed(&self, value: A) -> bool {
        self.waker.wake(succeed_node(erase(value)))
    }

    pub fn fail(&self, error: E) -> bool {
        self.waker.wake(fail_node(Cause::Fail(erase(error))))
    }

    /// The fiber this callback resumes.
    pub fn fiber_id(&self) -> FiberId {
        self.waker.fiber_id()
    }
}
