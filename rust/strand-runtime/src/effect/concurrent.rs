//! Forking and parallel composition.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::primitive::{erase, succeed_node, with_fiber_node};
use super::{Effect, Payload};
use crate::cause::{Cause, Exit};
use crate::cell::SyncCell;
use crate::deferred::Deferred;
use crate::fiber::{Fiber, FiberId};
use crate::scope::Scope;

impl<A: Payload, E: Payload> Effect<A, E> {
    /// Start the effect on a child fiber supervised by the current one.
    pub fn fork<X: Payload>(self) -> Effect<Fiber<A, E>, X> {
        self.fork_with(false)
    }

    /// Start the effect on a fiber with no parent.
    pub fn fork_daemon<X: Payload>(self) -> Effect<Fiber<A, E>, X> {
        self.fork_with(true)
    }

    fn fork_with<X: Payload>(self, daemon: bool) -> Effect<Fiber<A, E>, X> {
        let node = self.node;
        Effect::from_node(with_fiber_node(move |ctx| {
            let child = ctx
                .fiber
                .fork_child(Arc::clone(&node), ctx.interruptible, daemon);
            succeed_node(erase(Fiber::<A, E>::from_runtime(child)))
        }))
    }

    /// Start the effect on a daemon fiber that is interrupted when `scope`
    /// closes.
    pub fn fork_in<X: Payload>(self, scope: &Scope) -> Effect<Fiber<A, E>, X> {
        let scope = scope.clone();
        let effect = self;
        Effect::uninterruptible_mask(move |restore| {
            let scope = scope.clone();
            restore
                .apply(effect.clone())
                .fork_daemon()
                .flat_map(move |fiber: Fiber<A, E>| {
                    let target = fiber.clone();
                    scope
                        .add_finalizer(move |_| target.interrupt().as_unit())
                        .as_(fiber)
                })
        })
    }

    /// Run the effect on a daemon fiber. If the caller is interrupted, the
    /// daemon is interrupted too but the caller does not wait for it.
    pub fn disconnect(self) -> Self {
        Effect::uninterruptible_mask(move |restore| {
            let effect = restore.apply(self.clone());
            Effect::<FiberId, E>::fiber_id().flat_map(move |me| {
                effect
                    .clone()
                    .fork_daemon()
                    .flat_map(move |fiber: Fiber<A, E>| {
                        let target = fiber.clone();
                        restore
                            .apply(fiber.join())
                            .on_interrupt(move |_| target.interrupt_as_fork(me))
                    })
            })
        })
    }

    /// Run both effects concurrently; the first to succeed wins and the
    /// other is interrupted and awaited. Fails only if both fail, with both
    /// causes combined.
    pub fn race(self, that: Effect<A, E>) -> Self {
        Effect::uninterruptible_mask(move |restore| {
            let winner: Deferred<A, E> = Deferred::new();
            let failures: Arc<SyncCell<Option<Cause<E>>>> = Arc::new(SyncCell::new(None));
            let arm = |effect: Effect<A, E>| {
                let winner = winner.clone();
                let failures = Arc::clone(&failures);
                restore
                    .apply(effect)
                    .on_exit(move |exit: &Exit<A, E>| match exit {
                        Exit::Success(a) => winner.succeed(a.clone()).as_unit(),
                        Exit::Failure(cause) => {
                            let both = failures.modify(|first| match first.take() {
                                Some(prev) => Some(prev.both(cause.clone())),
                                None => {
                                    *first = Some(cause.clone());
                                    None
                                }
                            });
                            match both {
                                Some(all) => winner.fail_cause(all).as_unit(),
                                None => Effect::unit(),
                            }
                        }
                    })
                    .fork::<E>()
            };
            let left = arm(self.clone());
            let right = arm(that.clone());
            left.zip(right).flat_map(move |(l, r): (Fiber<A, E>, Fiber<A, E>)| {
                restore
                    .apply(winner.wait())
                    .exit()
                    .flat_map(move |exit: Exit<A, E>| {
                        interrupt_all(vec![l.clone(), r.clone()])
                            .widen()
                            .and_then(Effect::from_exit(exit.clone()))
                    })
            })
        })
    }

    /// `None` if the effect does not finish within `duration`; it is then
    /// interrupted and awaited before the result is produced. A failure
    /// before the deadline is reported as is.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        let timer: Effect<Exit<Option<A>, E>, E> =
            Effect::<(), E>::sleep(duration).as_(Exit::Success(None));
        self.map(Some).exit().race(timer).flat_map(Effect::from_exit)
    }

    /// Fail with `error` if the effect does not finish within `duration`.
    pub fn timeout_fail(self, duration: Duration, error: E) -> Self {
        self.timeout(duration).flat_map(move |outcome| match outcome {
            Some(a) => Effect::succeed(a),
            None => Effect::fail(error.clone()),
        })
    }

    /// Run both effects concurrently. If either fails, the other is
    /// interrupted; failures of both are combined with `Both`.
    pub fn zip_par<B: Payload>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        let left: Effect<Pair<A, B>, E> = self.map(Pair::Left);
        let right: Effect<Pair<A, B>, E> = that.map(Pair::Right);
        Effect::collect_all_par(vec![left, right]).flat_map(|pairs: Vec<Pair<A, B>>| {
            match <[Pair<A, B>; 2]>::try_from(pairs) {
                Ok([Pair::Left(a), Pair::Right(b)]) => Effect::succeed((a, b)),
                _ => Effect::die_message("parallel zip lost a branch"),
            }
        })
    }

    /// Run every effect concurrently, collecting values in input order. The
    /// first failure interrupts the remaining branches; every genuine
    /// failure is reported, combined with `Both`.
    pub fn collect_all_par(effects: impl IntoIterator<Item = Effect<A, E>>) -> Effect<Vec<A>, E> {
        let effects: Vec<Effect<A, E>> = effects.into_iter().collect();
        Effect::uninterruptible_mask(move |restore| {
            if effects.is_empty() {
                return Effect::succeed(Vec::new());
            }
            let done: Deferred<(), Infallible> = Deferred::new();
            let remaining = Arc::new(AtomicUsize::new(effects.len()));
            let forks = effects.iter().map(|effect| {
                let done = done.clone();
                let remaining = Arc::clone(&remaining);
                restore
                    .apply(effect.clone())
                    .on_exit(move |exit: &Exit<A, E>| {
                        let last = remaining.fetch_sub(1, Ordering::AcqRel) == 1;
                        if exit.is_failure() || last {
                            done.succeed(()).as_unit()
                        } else {
                            Effect::unit()
                        }
                    })
                    .fork::<E>()
            });
            let done = done.clone();
            Effect::collect_all(forks.collect::<Vec<_>>()).flat_map(move |fibers: Vec<Fiber<A, E>>| {
                let on_interrupt = fibers.clone();
                restore
                    .apply(done.wait().widen::<E>())
                    .on_interrupt(move |_| interrupt_all(on_interrupt.clone()))
                    .and_then(Effect::<FiberId, E>::fiber_id())
                    .flat_map(move |me| {
                        interrupt_all(fibers.clone())
                            .widen::<E>()
                            .and_then(Effect::collect_all(fibers.iter().map(|f| f.await_exit())))
                            .flat_map(move |exits: Vec<Exit<A, E>>| {
                                Effect::from_exit(merge_exits(exits, me))
                            })
                    })
            })
        })
    }

    /// Apply `f` to every item concurrently, collecting values in input
    /// order.
    pub fn for_each_par<T: Payload>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Effect<Vec<A>, E> {
        let items: Vec<T> = items.into_iter().collect();
        Effect::suspend(move || Effect::collect_all_par(items.iter().cloned().map(&f)))
    }
}

#[derive(Clone)]
enum Pair<A, B> {
    Left(A),
    Right(B),
}

/// Interrupt every fiber, then wait for all of them.
fn interrupt_all<A: Payload, E: Payload>(fibers: Vec<Fiber<A, E>>) -> Effect<(), Infallible> {
    let sends = fibers.iter().map(|f| f.interrupt_fork());
    let waits = fibers.iter().map(|f| f.await_exit().as_unit());
    Effect::collect_all(sends.chain(waits).collect::<Vec<_>>()).as_unit()
}

/// Collapse branch exits. Branches interrupted by `parent` only because a
/// sibling failed are left out of the combined cause.
fn merge_exits<A, E>(exits: Vec<Exit<A, E>>, parent: FiberId) -> Exit<Vec<A>, E> {
    let sibling_interrupt = |exit: &Exit<A, E>| match exit {
        Exit::Failure(cause) => {
            cause.is_interrupted_only() && cause.interruptors().iter().all(|id| *id == parent)
        }
        Exit::Success(_) => false,
    };
    let genuine = exits
        .iter()
        .filter(|exit| exit.is_failure() && !sibling_interrupt(exit))
        .count();
    if genuine == 0 {
        return Exit::collect_all_par(exits);
    }
    Exit::collect_all_par(
        exits
            .into_iter()
            .filter(|exit| exit.is_failure() && !sibling_interrupt(exit))
            .collect(),
    )
}
