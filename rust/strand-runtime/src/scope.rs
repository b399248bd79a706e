//! Scopes: finalizer lists closed exactly once.
//!
//! Finalizers run in reverse registration order when the scope closes. The
//! close is uninterruptible; failures of individual finalizers do not stop
//! the rest and are combined with `Then` in the order they happened.

use std::convert::Infallible;
use std::fmt;
use std::mem;
use std::sync::Arc;

use crate::cause::{Cause, Exit, ScopeExit};
use crate::cell::SyncCell;
use crate::effect::{Effect, Payload};

type Finalizer = Arc<dyn Fn(&ScopeExit) -> Effect<(), Infallible> + Send + Sync>;

enum State {
    Open {
        finalizers: Vec<Finalizer>,
    },
    Closed(ScopeExit),
}

#[derive(Clone)]
pub struct Scope {
    state: Arc<SyncCell<State>>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("closed", &self.is_closed())
            .field("size", &self.size())
            .finish()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SyncCell::new(State::Open {
                finalizers: Vec::new(),
            })),
        }
    }

    pub fn make<X: Payload>() -> Effect<Scope, X> {
        Effect::sync(Scope::new)
    }

    pub fn is_closed(&self) -> bool {
        self.state.with(|s| matches!(s, State::Closed(_)))
    }

    /// Number of registered finalizers still waiting to run.
    pub fn size(&self) -> usize {
        self.state.with(|s| match s {
            State::Open { finalizers } => finalizers.len(),
            State::Closed(_) => 0,
        })
    }

    /// Register a finalizer. If the scope is already closed it runs
    /// immediately with the recorded exit.
    pub fn add_finalizer<X: Payload>(
        &self,
        finalizer: impl Fn(&ScopeExit) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Effect<(), X> {
        let this = self.clone();
        let finalizer: Finalizer = Arc::new(finalizer);
        Effect::suspend(move || {
            let late = this.state.modify(|s| match s {
                State::Open { finalizers } => {
                    finalizers.push(Arc::clone(&finalizer));
                    None
                }
                State::Closed(exit) => Some(exit.clone()),
            });
            match late {
                None => Effect::unit(),
                Some(exit) => finalizer(&exit).uninterruptible().widen(),
            }
        })
    }

    /// Close the scope with `exit`, running finalizers last-registered
    /// first. Closing again does nothing.
    pub fn close<X: Payload>(&self, exit: ScopeExit) -> Effect<(), X> {
        let this = self.clone();
        Effect::<(), Infallible>::suspend(move || {
            let finalizers = this.state.modify(|s| match s {
                State::Closed(_) => None,
                State::Open { .. } => match mem::replace(s, State::Closed(exit.clone())) {
                    State::Open { finalizers } => Some(finalizers),
                    State::Closed(_) => None,
                },
            });
            match finalizers {
                Some(finalizers) => {
                    tracing::trace!(finalizers = finalizers.len(), "closing scope");
                    run_finalizers(finalizers, &exit)
                }
                None => Effect::unit(),
            }
        })
        .uninterruptible()
        .widen()
    }

    /// A child scope that is closed, with the parent's exit, when this one
    /// closes. The child may also be closed earlier on its own.
    pub fn fork<X: Payload>(&self) -> Effect<Scope, X> {
        let parent = self.clone();
        Effect::suspend(move || {
            let child = Scope::new();
            let closing = child.clone();
            parent
                .add_finalizer(move |exit| closing.close(exit.clone()))
                .as_(child)
        })
    }

    /// Run an effect that registers resources into this scope without
    /// closing it afterwards.
    pub fn extend<A: Payload, E: Payload>(
        &self,
        body: impl Fn(Scope) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Effect<A, E> {
        let this = self.clone();
        Effect::suspend(move || body(this.clone()))
    }

    /// Acquire uninterruptibly and register `release` for the acquired
    /// value in this scope.
    pub fn acquire_release<A: Payload, E: Payload>(
        &self,
        acquire: Effect<A, E>,
        release: impl Fn(A, &ScopeExit) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Effect<A, E> {
        let this = self.clone();
        let release = Arc::new(release);
        acquire
            .flat_map(move |resource: A| {
                let release = Arc::clone(&release);
                let held = resource.clone();
                this.add_finalizer(move |exit| release(held.clone(), exit))
                    .as_(resource)
            })
            .uninterruptible()
    }
}

fn run_finalizers(finalizers: Vec<Finalizer>, exit: &ScopeExit) -> Effect<(), Infallible> {
    let runs: Vec<Effect<Exit<(), Infallible>, Infallible>> = finalizers
        .iter()
        .rev()
        .map(|finalizer| {
            let (finalizer, exit) = (Arc::clone(finalizer), exit.clone());
            Effect::<(), Infallible>::suspend(move || finalizer(&exit)).exit()
        })
        .collect();
    Effect::collect_all(runs).flat_map(|exits| {
        let cause = exits
            .into_iter()
            .fold(Cause::Empty, |acc, exit| match exit {
                Exit::Failure(cause) => acc.then(cause),
                Exit::Success(()) => acc,
            });
        if cause.is_empty() {
            Effect::unit()
        } else {
            Effect::fail_cause(cause)
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;

    fn runtime() -> Runtime {
        Runtime::with_config(RuntimeConfig {
            workers: 1,
            ..RuntimeConfig::default()
        })
        .expect("runtime")
    }

    fn push(log: &Arc<Mutex<Vec<String>>>, entry: &str) -> Effect<()> {
        let log = Arc::clone(log);
        let entry = entry.to_string();
        Effect::sync(move || log.lock().unwrap().push(entry.clone()))
    }

    #[test]
    fn close_runs_finalizers_in_reverse() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        let (a, b) = (push(&log, "a"), push(&log, "b"));
        let program: Effect<()> = scope
            .add_finalizer(move |_| a.clone())
            .and_then(scope.add_finalizer(move |_| b.clone()))
            .and_then(scope.close(Exit::Success(())))
            .and_then(scope.close(Exit::Success(())));
        assert_eq!(rt.run(program), Exit::succeed(()));
        assert_eq!(*log.lock().unwrap(), vec!["b", "a"]);
        assert!(scope.is_closed());
    }

    #[test]
    fn finalizer_sees_exit_and_late_finalizer_runs_immediately() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        let sink = Arc::clone(&log);
        let record = move |exit: &ScopeExit| push(&sink, if exit.is_success() { "ok" } else { "failed" });
        let failed: ScopeExit = Exit::fail(());
        let program: Effect<()> = scope
            .close(failed)
            .and_then(scope.add_finalizer(record));
        assert_eq!(rt.run(program), Exit::succeed(()));
        assert_eq!(*log.lock().unwrap(), vec!["failed"]);
    }

    #[test]
    fn finalizer_defects_are_combined_in_order() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        let tail = push(&log, "still runs");
        let program: Effect<()> = scope
            .add_finalizer(move |_| tail.clone())
            .and_then(scope.add_finalizer(|_| Effect::die_message("first")))
            .and_then(scope.add_finalizer(|_| Effect::die_message("second")))
            .and_then(scope.close(Exit::Success(())));
        let exit = rt.run(program);
        let messages: Vec<String> = exit
            .cause()
            .map(|cause| cause.defects().iter().map(|d| d.message().to_string()).collect())
            .unwrap_or_default();
        assert_eq!(messages, vec!["second", "first"]);
        assert_eq!(*log.lock().unwrap(), vec!["still runs"]);
    }

    #[test]
    fn panicking_finalizer_does_not_skip_the_rest() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        let (first, last) = (push(&log, "first"), push(&log, "last"));
        let program: Effect<()> = scope
            .add_finalizer(move |_| first.clone())
            .and_then(scope.add_finalizer(|_| panic!("finalizer builder")))
            .and_then(scope.add_finalizer(move |_| last.clone()))
            .and_then(scope.close(Exit::Success(())));
        let exit = rt.run(program);
        assert!(exit.cause().is_some_and(|cause| cause.is_die()));
        assert_eq!(*log.lock().unwrap(), vec!["last", "first"]);
    }

    #[test]
    fn child_scope_closes_with_parent() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let parent = Scope::new();
        let entry = push(&log, "child");
        let program: Effect<Scope> = parent.fork().flat_map(move |child: Scope| {
            let entry = entry.clone();
            child
                .add_finalizer(move |_| entry.clone())
                .as_(child)
        });
        let child = rt.run_result(program).expect("fork");
        assert_eq!(child.size(), 1);
        let _ = rt.run::<(), Infallible>(parent.close(Exit::Success(())));
        assert!(child.is_closed());
        assert_eq!(*log.lock().unwrap(), vec!["child"]);
    }

    #[test]
    fn acquire_release_registers_release() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        let sink = Arc::clone(&log);
        let acquire: Effect<u32, String> = Effect::succeed(5);
        let program = scope
            .acquire_release(acquire, move |n, _| push(&sink, &format!("release {n}")))
            .zip_left(scope.close(Exit::Success(())));
        assert_eq!(rt.run(program), Exit::succeed(5));
        assert_eq!(*log.lock().unwrap(), vec!["release 5"]);
    }
}
