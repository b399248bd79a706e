//! Effects: lazy, immutable, re-runnable descriptions of computations.
//!
//! An [`Effect<A, E>`] succeeds with an `A`, fails with a typed `E`, dies
//! with a [`Defect`], or is interrupted. Nothing happens until the effect is
//! handed to a [`Runtime`](crate::runtime::Runtime) or forked from another
//! effect; the same value can be run any number of times.
//!
//! Effects are `Arc`-backed trees of instructions, so cloning is cheap and
//! composition never copies the composed parts.

mod concurrent;
pub(crate) mod primitive;
mod resource;

use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

pub use primitive::Payload;

use crate::cause::{Cause, Exit};
use crate::cell::SyncCell;
use crate::defect::Defect;
use crate::fiber::waker::Waker;
use crate::fiber::{FiberId, Resume};
use primitive::{
    async_node, die_node, erase, erase_cause, fail_node, fold_node, set_interruptible_node,
    succeed_node, suspend_node, sync_node, unerase, unerase_cause, unit_node, with_fiber_node,
    with_status_node, yield_node, AnyCause, AnyValue, Node, Primitive,
};

pub struct Effect<A, E = Infallible> {
    pub(crate) node: Node,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }
}

impl<A, E> Clone for Effect<A, E> {
    fn clone(&self) -> Self {
        Self::from_node(Arc::clone(&self.node))
    }
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Effect { .. }")
    }
}

/// Reinstates the interrupt status that was in effect outside a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restore {
    interruptible: bool,
}

impl Restore {
    pub fn apply<A, E>(self, effect: Effect<A, E>) -> Effect<A, E> {
        Effect::from_node(set_interruptible_node(effect.node, self.interruptible))
    }
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

impl<A: Payload, E: Payload> Effect<A, E> {
    pub fn succeed(value: A) -> Self {
        Self::from_node(succeed_node(erase(value)))
    }

    pub fn fail(error: E) -> Self {
        Self::from_node(fail_node(Cause::Fail(erase(error))))
    }

    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_node(fail_node(erase_cause(cause)))
    }

    pub fn die(defect: Defect) -> Self {
        Self::from_node(die_node(defect))
    }

    pub fn die_message(message: impl Into<String>) -> Self {
        Self::die(Defect::new(message))
    }

    /// Fail with an interruption caused by the running fiber itself.
    pub fn interrupt() -> Self {
        Self::from_node(with_fiber_node(|ctx| {
            fail_node(Cause::Interrupt(ctx.fiber.id()))
        }))
    }

    /// Run a side effect each time the effect runs. A panic becomes a defect.
    pub fn sync(f: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Self::from_node(Arc::new(Primitive::Sync(Arc::new(
            move || -> Result<AnyValue, AnyCause> { Ok(erase(f())) },
        ))))
    }

    pub fn try_sync(f: impl Fn() -> Result<A, E> + Send + Sync + 'static) -> Self {
        Self::from_node(Arc::new(Primitive::Sync(Arc::new(move || {
            f().map(erase).map_err(|e| Cause::Fail(erase(e)))
        }))))
    }

    /// Build the effect lazily, each time it runs.
    pub fn suspend(f: impl Fn() -> Effect<A, E> + Send + Sync + 'static) -> Self {
        Self::from_node(suspend_node(move || f().node))
    }

    pub fn from_exit(exit: Exit<A, E>) -> Self {
        match exit {
            Exit::Success(a) => Self::succeed(a),
            Exit::Failure(cause) => Self::fail_cause(cause),
        }
    }

    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Self::succeed(a),
            Err(e) => Self::fail(e),
        }
    }

    /// Suspend the fiber until `register`'s callback is invoked.
    ///
    /// `register` may call the [`Resume`] synchronously. It may return a
    /// canceler that runs, uninterruptibly, if the fiber is interrupted
    /// while suspended.
    pub fn async_(
        register: impl Fn(Resume<A, E>) -> Option<Effect<(), Infallible>> + Send + Sync + 'static,
    ) -> Self {
        Self::from_node(async_node(move |waker: Waker| {
            register(Resume::new(waker)).map(|canceler| canceler.node)
        }))
    }

    /// Suspend forever (until interrupted).
    pub fn never() -> Self {
        Self::from_node(async_node(|_| None))
    }
}

impl<E: Payload> Effect<(), E> {
    pub fn unit() -> Self {
        Self::from_node(unit_node())
    }

    /// Give up the worker; the fiber is rescheduled behind queued work.
    pub fn yield_now() -> Self {
        Self::from_node(yield_node())
    }

    pub fn sleep(duration: Duration) -> Self {
        if duration.is_zero() {
            return Self::yield_now();
        }
        Self::from_node(async_node(move |waker: Waker| {
            let timer = waker.timer();
            let id = timer.schedule(duration, move || {
                waker.wake(unit_node());
            });
            Some(sync_node(move || timer.cancel(id)))
        }))
    }
}

impl<E: Payload> Effect<FiberId, E> {
    /// Id of the fiber running the effect.
    pub fn fiber_id() -> Self {
        Self::from_node(with_fiber_node(|ctx| succeed_node(erase(ctx.fiber.id()))))
    }
}

impl<A: Payload> Effect<A, Infallible> {
    /// View an effect that cannot fail as one with any error type.
    pub fn widen<E2: Payload>(self) -> Effect<A, E2> {
        Effect::from_node(self.node)
    }
}

// ---------------------------------------------------------------------------
// Sequencing
// ---------------------------------------------------------------------------

impl<A: Payload, E: Payload> Effect<A, E> {
    pub fn map<B: Payload>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Effect<B, E> {
        Effect::from_node(Arc::new(Primitive::FlatMap(
            self.node,
            Arc::new(move |value: AnyValue| match unerase::<A>(value) {
                Ok(a) => succeed_node(erase(f(a))),
                Err(defect) => die_node(defect),
            }),
        )))
    }

    pub fn flat_map<B: Payload>(
        self,
        f: impl Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    ) -> Effect<B, E> {
        Effect::from_node(Arc::new(Primitive::FlatMap(
            self.node,
            Arc::new(move |value: AnyValue| match unerase::<A>(value) {
                Ok(a) => f(a).node,
                Err(defect) => die_node(defect),
            }),
        )))
    }

    /// Run `that` after `self`, keeping `that`'s value.
    pub fn and_then<B: Payload>(self, that: Effect<B, E>) -> Effect<B, E> {
        self.flat_map(move |_| that.clone())
    }

    /// Run `that` after `self`, keeping `self`'s value.
    pub fn zip_left<B: Payload>(self, that: Effect<B, E>) -> Self {
        self.flat_map(move |a| that.clone().as_(a))
    }

    pub fn zip<B: Payload>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.zip_with(that, |a, b| (a, b))
    }

    pub fn zip_with<B: Payload, C: Payload>(
        self,
        that: Effect<B, E>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Effect<C, E> {
        let f = Arc::new(f);
        self.flat_map(move |a| {
            let f = Arc::clone(&f);
            that.clone().map(move |b| f(a.clone(), b))
        })
    }

    pub fn as_<B: Payload>(self, value: B) -> Effect<B, E> {
        self.map(move |_| value.clone())
    }

    pub fn as_unit(self) -> Effect<(), E> {
        self.map(|_| ())
    }

    /// Run an effect on the success value, keeping the value.
    pub fn tap(self, f: impl Fn(&A) -> Effect<(), E> + Send + Sync + 'static) -> Self {
        self.flat_map(move |a| f(&a).as_(a))
    }

    /// Wait `duration` before running.
    pub fn delay(self, duration: Duration) -> Self {
        Effect::sleep(duration).and_then(self)
    }

    /// Repeat until the first failure.
    pub fn forever(self) -> Self {
        let again = self.clone();
        self.flat_map(move |_| again.clone().forever())
    }

    /// Run every effect in order, collecting the values.
    pub fn collect_all(effects: impl IntoIterator<Item = Effect<A, E>>) -> Effect<Vec<A>, E> {
        let effects: Vec<Effect<A, E>> = effects.into_iter().collect();
        Effect::suspend(move || {
            let acc = Arc::new(SyncCell::new(Vec::with_capacity(effects.len())));
            let chain = effects.iter().fold(Effect::<(), E>::unit(), |chain, effect| {
                let acc = Arc::clone(&acc);
                chain.and_then(effect.clone().map(move |a| acc.modify(|values| values.push(a))))
            });
            chain.map(move |()| acc.modify(std::mem::take))
        })
    }

    /// Apply `f` to every item in order, collecting the values.
    pub fn for_each<T: Payload>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Effect<Vec<A>, E> {
        let items: Vec<T> = items.into_iter().collect();
        Effect::suspend(move || Effect::collect_all(items.iter().cloned().map(&f)))
    }
}

// ---------------------------------------------------------------------------
// Error channel
// ---------------------------------------------------------------------------

impl<A: Payload, E: Payload> Effect<A, E> {
    /// Continue with `on_failure` or `on_success` depending on the outcome.
    /// Defects and interruptions reach `on_failure` too.
    pub fn fold_cause_effect<B: Payload, E2: Payload>(
        self,
        on_failure: impl Fn(Cause<E>) -> Effect<B, E2> + Send + Sync + 'static,
        on_success: impl Fn(A) -> Effect<B, E2> + Send + Sync + 'static,
    ) -> Effect<B, E2> {
        Effect::from_node(fold_node(
            self.node,
            move |cause: AnyCause| on_failure(unerase_cause::<E>(cause)).node,
            move |value: AnyValue| match unerase::<A>(value) {
                Ok(a) => on_success(a).node,
                Err(defect) => die_node(defect),
            },
        ))
    }

    pub fn fold_cause<B: Payload, X: Payload>(
        self,
        on_failure: impl Fn(Cause<E>) -> B + Send + Sync + 'static,
        on_success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Effect<B, X> {
        self.fold_cause_effect(
            move |cause| Effect::succeed(on_failure(cause)),
            move |a| Effect::succeed(on_success(a)),
        )
    }

    /// Recover from typed failures only.
    pub fn fold<B: Payload, X: Payload>(
        self,
        on_failure: impl Fn(E) -> B + Send + Sync + 'static,
        on_success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Effect<B, X> {
        self.fold_cause_effect(
            move |cause: Cause<E>| match cause.failure_or_cause() {
                Ok(e) => Effect::succeed(on_failure(e)),
                Err(other) => Effect::fail_cause(other.strip_failures()),
            },
            move |a| Effect::succeed(on_success(a)),
        )
    }

    pub fn catch_all_cause<E2: Payload>(
        self,
        f: impl Fn(Cause<E>) -> Effect<A, E2> + Send + Sync + 'static,
    ) -> Effect<A, E2> {
        self.fold_cause_effect(f, Effect::succeed)
    }

    /// Recover from typed failures; defects and interruptions pass through.
    pub fn catch_all<E2: Payload>(
        self,
        f: impl Fn(E) -> Effect<A, E2> + Send + Sync + 'static,
    ) -> Effect<A, E2> {
        self.catch_all_cause(move |cause| match cause.failure_or_cause() {
            Ok(e) => f(e),
            Err(other) => Effect::fail_cause(other.strip_failures()),
        })
    }

    pub fn or_else<E2: Payload>(self, that: Effect<A, E2>) -> Effect<A, E2> {
        self.catch_all(move |_| that.clone())
    }

    pub fn map_error<E2: Payload>(
        self,
        f: impl Fn(E) -> E2 + Send + Sync + 'static,
    ) -> Effect<A, E2> {
        self.fold_cause_effect(
            move |cause: Cause<E>| Effect::fail_cause(cause.map(|e| f(e))),
            Effect::succeed,
        )
    }

    /// Succeed with the exit, whatever it is.
    pub fn exit<X: Payload>(self) -> Effect<Exit<A, E>, X> {
        self.fold_cause(Exit::Failure, Exit::Success)
    }

    /// Typed failures as `Err`; defects and interruptions pass through.
    pub fn either<X: Payload>(self) -> Effect<Result<A, E>, X> {
        self.fold(Err, Ok)
    }

    /// Turn typed failures into defects.
    pub fn or_die<X: Payload>(self) -> Effect<A, X>
    where
        E: fmt::Debug,
    {
        self.fold_cause_effect(
            |cause: Cause<E>| {
                Effect::fail_cause(
                    cause.flat_map(&mut |e| Cause::Die(Defect::new(format!("{e:?}")))),
                )
            },
            Effect::succeed,
        )
    }
}

// ---------------------------------------------------------------------------
// Interrupt status
// ---------------------------------------------------------------------------

impl<A: Payload, E: Payload> Effect<A, E> {
    pub fn interruptible(self) -> Self {
        Self::from_node(set_interruptible_node(self.node, true))
    }

    /// Defer interruption until the effect has finished.
    pub fn uninterruptible(self) -> Self {
        Self::from_node(set_interruptible_node(self.node, false))
    }

    /// Run `f` interruptibly; its [`Restore`] reinstates the outer status.
    pub fn interruptible_mask(f: impl Fn(Restore) -> Self + Send + Sync + 'static) -> Self {
        Self::from_node(with_status_node(move |status| {
            set_interruptible_node(f(Restore { interruptible: status }).node, true)
        }))
    }

    /// Run `f` uninterruptibly; its [`Restore`] reinstates the outer status.
    pub fn uninterruptible_mask(f: impl Fn(Restore) -> Self + Send + Sync + 'static) -> Self {
        Self::from_node(with_status_node(move |status| {
            set_interruptible_node(f(Restore { interruptible: status }).node, false)
        }))
    }
}

/// Combine an effect's exit with the exit of a finalizer run after it.
pub(crate) fn then_finalizer<A, E>(exit: Exit<A, E>, finalizer: Exit<(), Infallible>) -> Exit<A, E> {
    match (exit, finalizer) {
        (exit, Exit::Success(())) => exit,
        (Exit::Success(_), Exit::Failure(f)) => Exit::Failure(f.flat_map(&mut |never| match never {})),
        (Exit::Failure(c), Exit::Failure(f)) => {
            Exit::Failure(c.then(f.flat_map(&mut |never| match never {})))
        }
    }
}
