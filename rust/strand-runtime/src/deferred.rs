//! Write-once synchronization variable.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::mem;
use std::sync::Arc;

use crate::cause::Cause;
use crate::cell::SyncCell;
use crate::defect::Defect;
use crate::effect::{Effect, Payload};
use crate::fiber::{FiberId, Resume};

enum State<A, E> {
    Pending {
        waiters: BTreeMap<u64, Resume<A, E>>,
        next_key: u64,
    },
    Done(Effect<A, E>),
}

/// A variable that is completed exactly once. Every waiter, including
/// those arriving after completion, observes the same result.
pub struct Deferred<A, E = Infallible> {
    state: Arc<SyncCell<State<A, E>>>,
}

impl<A, E> Clone for Deferred<A, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<A, E> fmt::Debug for Deferred<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = self.state.with(|s| matches!(s, State::Done(_)));
        f.debug_struct("Deferred").field("done", &done).finish()
    }
}

impl<A: Payload, E: Payload> Default for Deferred<A, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Payload, E: Payload> Deferred<A, E> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SyncCell::new(State::Pending {
                waiters: BTreeMap::new(),
                next_key: 0,
            })),
        }
    }

    pub fn make<X: Payload>() -> Effect<Self, X> {
        Effect::sync(Self::new)
    }

    /// Suspend until the deferred is completed, then run its result.
    pub fn wait(&self) -> Effect<A, E> {
        let state = Arc::clone(&self.state);
        Effect::async_(move |resume: Resume<A, E>| {
            let registered = state.modify(|s| match s {
                State::Done(effect) => Err(effect.clone()),
                State::Pending { waiters, next_key } => {
                    let key = *next_key;
                    *next_key += 1;
                    waiters.insert(key, resume.clone());
                    Ok(key)
                }
            });
            match registered {
                Err(effect) => {
                    resume.resume(effect);
                    None
                }
                Ok(key) => {
                    let state = Arc::clone(&state);
                    Some(Effect::sync(move || {
                        state.modify(|s| {
                            if let State::Pending { waiters, .. } = s {
                                waiters.remove(&key);
                            }
                        })
                    }))
                }
            }
        })
    }

    /// Complete with `effect` outside of any fiber. Returns `false` if the
    /// deferred was already done.
    pub fn complete_now(&self, effect: Effect<A, E>) -> bool {
        let waiters = self.state.modify(|s| match s {
            State::Done(_) => None,
            State::Pending { .. } => match mem::replace(s, State::Done(effect.clone())) {
                State::Pending { waiters, .. } => Some(waiters),
                State::Done(_) => None,
            },
        });
        match waiters {
            Some(waiters) => {
                tracing::trace!(waiters = waiters.len(), "deferred completed");
                for resume in waiters.into_values() {
                    resume.resume(effect.clone());
                }
                true
            }
            None => false,
        }
    }

    /// Record `effect` itself as the result; each waiter runs it.
    pub fn complete_with<X: Payload>(&self, effect: Effect<A, E>) -> Effect<bool, X> {
        let this = self.clone();
        Effect::sync(move || this.complete_now(effect.clone()))
    }

    /// Run `effect` once and record its exit as the result.
    pub fn complete<X: Payload>(&self, effect: Effect<A, E>) -> Effect<bool, X> {
        let this = self.clone();
        effect
            .exit()
            .flat_map(move |exit| this.complete_with(Effect::from_exit(exit)))
            .uninterruptible()
    }

    pub fn succeed<X: Payload>(&self, value: A) -> Effect<bool, X> {
        self.complete_with(Effect::succeed(value))
    }

    pub fn fail<X: Payload>(&self, error: E) -> Effect<bool, X> {
        self.complete_with(Effect::fail(error))
    }

    pub fn fail_cause<X: Payload>(&self, cause: Cause<E>) -> Effect<bool, X> {
        self.complete_with(Effect::fail_cause(cause))
    }

    pub fn die<X: Payload>(&self, defect: Defect) -> Effect<bool, X> {
        self.complete_with(Effect::die(defect))
    }

    /// Complete with an interruption by the current fiber.
    pub fn interrupt<X: Payload>(&self) -> Effect<bool, X> {
        let this = self.clone();
        Effect::<FiberId, X>::fiber_id()
            .flat_map(move |id| this.complete_with(Effect::fail_cause(Cause::interrupt(id))))
    }

    /// The result if completed; never suspends.
    pub fn poll<X: Payload>(&self) -> Effect<Option<Effect<A, E>>, X> {
        let this = self.clone();
        Effect::sync(move || this.poll_now())
    }

    pub fn poll_now(&self) -> Option<Effect<A, E>> {
        self.state.with(|s| match s {
            State::Done(effect) => Some(effect.clone()),
            State::Pending { .. } => None,
        })
    }

    pub fn is_done<X: Payload>(&self) -> Effect<bool, X> {
        let this = self.clone();
        Effect::sync(move || this.is_done_now())
    }

    pub fn is_done_now(&self) -> bool {
        self.state.with(|s| matches!(s, State::Done(_)))
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.state.with(|s| match s {
            State::Pending { waiters, .. } => waiters.len(),
            State::Done(_) => 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cause::Exit;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;

    fn runtime() -> Runtime {
        Runtime::with_config(RuntimeConfig {
            workers: 2,
            ..RuntimeConfig::default()
        })
        .expect("runtime")
    }

    #[test]
    fn second_completion_is_rejected() {
        let d: Deferred<i32, String> = Deferred::new();
        assert!(d.complete_now(Effect::succeed(1)));
        assert!(!d.complete_now(Effect::succeed(2)));
        let rt = runtime();
        assert_eq!(rt.run(d.wait()), Exit::succeed(1));
    }

    #[test]
    fn every_waiter_sees_the_result() {
        let rt = runtime();
        let d: Deferred<i32, String> = Deferred::new();
        let waiter = d.wait();
        let program: Effect<Vec<i32>, String> = waiter
            .clone()
            .fork()
            .zip(waiter.fork())
            .flat_map({
                let d = d.clone();
                move |(a, b)| {
                    Effect::<(), String>::sleep(Duration::from_millis(10))
                        .and_then(d.succeed(7))
                        .and_then(Effect::collect_all(vec![a.join(), b.join()]))
                }
            });
        assert_eq!(rt.run(program), Exit::succeed(vec![7, 7]));
        assert_eq!(rt.run(d.wait()), Exit::succeed(7));
    }

    #[test]
    fn failure_is_shared() {
        let rt = runtime();
        let d: Deferred<i32, String> = Deferred::new();
        let program = d.fail("boom".to_string()).and_then(d.wait());
        assert_eq!(rt.run(program), Exit::fail("boom".to_string()));
    }

    #[test]
    fn complete_runs_effect_once() {
        let rt = runtime();
        let d: Deferred<u32, String> = Deferred::new();
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let effect = Effect::sync(move || c.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1);
        let program = d
            .complete(effect)
            .and_then(d.wait())
            .zip(d.wait());
        assert_eq!(rt.run(program), Exit::succeed((1, 1)));
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn interrupted_waiter_removes_only_itself() {
        let rt = runtime();
        let d: Deferred<i32> = Deferred::new();
        let program: Effect<usize> = d.wait().fork().zip(d.wait().fork()).flat_map({
            let d = d.clone();
            move |(a, b)| {
                let d = d.clone();
                Effect::<()>::sleep(Duration::from_millis(20))
                    .and_then(a.interrupt())
                    .and_then(Effect::sync(move || d.waiter_count()))
                    .zip_left(b.interrupt())
            }
        });
        assert_eq!(rt.run(program), Exit::succeed(1));
    }

    #[test]
    fn poll_never_suspends() {
        let d: Deferred<i32> = Deferred::new();
        assert!(d.poll_now().is_none());
        assert!(!d.is_done_now());
        d.complete_now(Effect::succeed(3));
        assert!(d.is_done_now());
        let rt = runtime();
        let polled = d.poll_now().map(|effect| rt.run(effect));
        assert_eq!(polled, Some(Exit::succeed(3)));
    }
}
