//! Resource safety: finalizers that run however an effect ends.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;

use super::{then_finalizer, Effect, Payload};
use crate::cause::{Cause, Exit};
use crate::fiber::FiberId;
use crate::scope::Scope;

impl<A: Payload, E: Payload> Effect<A, E> {
    /// Run `finalizer` with the exit once the effect is done, whether it
    /// succeeded, failed, died or was interrupted. The finalizer itself is
    /// uninterruptible; if it fails, its cause is appended with `Then`.
    pub fn on_exit(
        self,
        finalizer: impl Fn(&Exit<A, E>) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Self {
        let finalizer = Arc::new(finalizer);
        Effect::uninterruptible_mask(move |restore| {
            let finalizer = Arc::clone(&finalizer);
            restore
                .apply(self.clone())
                .exit()
                .flat_map(move |exit: Exit<A, E>| {
                    finalizer(&exit)
                        .exit()
                        .flat_map(move |fin| Effect::from_exit(then_finalizer(exit.clone(), fin)))
                })
        })
    }

    pub fn ensuring(self, finalizer: Effect<(), Infallible>) -> Self {
        self.on_exit(move |_| finalizer.clone())
    }

    /// Run `cleanup` with the interrupting fiber ids if the effect is
    /// interrupted.
    pub fn on_interrupt(
        self,
        cleanup: impl Fn(&BTreeSet<FiberId>) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Self {
        self.on_exit(move |exit| match exit {
            Exit::Failure(cause) if cause.is_interrupted() => cleanup(&cause.interruptors()),
            _ => Effect::unit(),
        })
    }

    /// Run `cleanup` with the cause if the effect does not succeed.
    pub fn on_error(
        self,
        cleanup: impl Fn(&Cause<E>) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Self {
        self.on_exit(move |exit| match exit {
            Exit::Failure(cause) => cleanup(cause),
            Exit::Success(_) => Effect::unit(),
        })
    }

    /// Acquire a resource uninterruptibly, use it, and release it exactly
    /// once with the outcome of `use_`.
    pub fn acquire_use_release<R: Payload>(
        acquire: Effect<R, E>,
        use_: impl Fn(R) -> Effect<A, E> + Send + Sync + 'static,
        release: impl Fn(R, &Exit<A, E>) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Self {
        let use_ = Arc::new(use_);
        let release = Arc::new(release);
        Effect::uninterruptible_mask(move |restore| {
            let use_ = Arc::clone(&use_);
            let release = Arc::clone(&release);
            acquire.clone().flat_map(move |resource: R| {
                let release = Arc::clone(&release);
                let held = resource.clone();
                restore
                    .apply(use_(resource))
                    .exit()
                    .flat_map(move |exit: Exit<A, E>| {
                        release(held.clone(), &exit)
                            .exit()
                            .flat_map(move |fin| Effect::from_exit(then_finalizer(exit.clone(), fin)))
                    })
            })
        })
    }

    /// Run `body` with a fresh scope, closing it with the body's exit.
    pub fn scoped(body: impl Fn(Scope) -> Effect<A, E> + Send + Sync + 'static) -> Self {
        Effect::acquire_use_release(Scope::make(), body, |scope: Scope, exit: &Exit<A, E>| {
            scope.close(exit.to_scope_exit())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::sync::Mutex;

    fn runtime() -> Runtime {
        Runtime::with_config(RuntimeConfig {
            workers: 2,
            ..RuntimeConfig::default()
        })
        .unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Effect<(), Infallible>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let record = move |entry: &str| {
            let sink = Arc::clone(&sink);
            let entry = entry.to_string();
            Effect::sync(move || sink.lock().unwrap().push(entry.clone()))
        };
        (log, record)
    }

    #[test]
    fn ensuring_runs_on_success_and_failure() {
        let rt = runtime();
        let (log, record) = recorder();
        let ok: Effect<i32, String> = Effect::succeed(1).ensuring(record("ok"));
        let bad: Effect<i32, String> = Effect::fail("bad".to_string()).ensuring(record("bad"));
        assert_eq!(rt.run(ok), Exit::succeed(1));
        assert_eq!(rt.run(bad), Exit::fail("bad".to_string()));
        assert_eq!(*log.lock().unwrap(), vec!["ok", "bad"]);
    }

    #[test]
    fn failing_finalizer_appends_with_then() {
        let rt = runtime();
        let body: Effect<i32, String> = Effect::fail("body".to_string());
        let exit = rt.run(body.ensuring(Effect::die_message("finalizer")));
        match exit {
            Exit::Failure(Cause::Then(first, second)) => {
                assert_eq!(*first, Cause::fail("body".to_string()));
                assert_eq!(*second, Cause::die_message("finalizer"));
            }
            other => panic!("unexpected exit {:?}", other),
        }
    }

    #[test]
    fn acquire_use_release_releases_once_with_exit() {
        let rt = runtime();
        let released = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&released);
        let effect: Effect<i32, String> = Effect::acquire_use_release(
            Effect::succeed(10),
            |r: i32| Effect::fail(format!("use {}", r)),
            move |r: i32, exit: &Exit<i32, String>| {
                let sink = Arc::clone(&sink);
                let failed = exit.is_failure();
                Effect::sync(move || sink.lock().unwrap().push((r, failed)))
            },
        );
        assert_eq!(rt.run(effect), Exit::fail("use 10".to_string()));
        assert_eq!(*released.lock().unwrap(), vec![(10, true)]);
    }

    #[test]
    fn on_error_sees_cause_but_not_success() {
        let rt = runtime();
        let (log, record) = recorder();
        let record = Arc::new(record);
        let r1 = Arc::clone(&record);
        let ok: Effect<(), String> = Effect::unit().on_error(move |_| r1("never"));
        let r2 = Arc::clone(&record);
        let bad: Effect<(), String> =
            Effect::fail("x".to_string()).on_error(move |cause| r2(&format!("{:?}", cause.failures())));
        rt.run(ok);
        rt.run(bad);
        assert_eq!(*log.lock().unwrap(), vec!["[\"x\"]"]);
    }
}
