//! Scopes, resources and single-assignment values seen from the outside.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strand_runtime::{Deferred, Effect, Exit, Fiber, Runtime, RuntimeConfig, Scope, ScopeExit};

fn runtime() -> Runtime {
    Runtime::with_config(RuntimeConfig {
        workers: 2,
        ..RuntimeConfig::default()
    })
    .expect("runtime")
}

fn record(log: &Arc<Mutex<Vec<String>>>, entry: &str) -> Effect<()> {
    let log = Arc::clone(log);
    let entry = entry.to_string();
    Effect::sync(move || log.lock().push(entry.clone()))
}

#[test]
fn resources_are_released_in_reverse_order() {
    let rt = runtime();
    let log = Arc::new(Mutex::new(Vec::new()));
    let inner = Arc::clone(&log);
    let program: Effect<i32, String> = Effect::scoped(move |scope: Scope| {
        let log = Arc::clone(&inner);
        let open = |name: &'static str| {
            let release = record(&log, &format!("release {name}"));
            scope.acquire_release(
                record(&log, &format!("acquire {name}")).widen::<String>().as_(name),
                move |_, _| release.clone(),
            )
        };
        open("db")
            .and_then(open("cache"))
            .and_then(Effect::fail("query failed".to_string()))
    });
    assert_eq!(rt.run(program), Exit::fail("query failed".to_string()));
    assert_eq!(
        *log.lock(),
        vec!["acquire db", "acquire cache", "release cache", "release db"]
    );
}

#[test]
fn finalizers_see_the_exit() {
    let rt = runtime();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let scope = Scope::new();
    let sink = Arc::clone(&seen);
    let program: Effect<()> = scope
        .add_finalizer(move |exit: &ScopeExit| {
            let sink = Arc::clone(&sink);
            let exit = exit.clone();
            Effect::sync(move || sink.lock().push(exit.clone()))
        })
        .and_then(scope.close(Exit::fail(())))
        .and_then(scope.close(Exit::succeed(())));
    assert!(rt.run(program).is_success());
    assert_eq!(*seen.lock(), vec![Exit::fail(())]);
    assert!(scope.is_closed());
}

#[test]
fn interrupted_scope_still_releases() {
    let rt = runtime();
    let released = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&released);
    let body: Effect<()> = Effect::scoped(move |scope: Scope| {
        let counter = Arc::clone(&counter);
        scope
            .add_finalizer(move |_| {
                let counter = Arc::clone(&counter);
                Effect::sync(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .and_then(Effect::never())
    });
    let program: Effect<bool> = body.fork().flat_map(|fiber: Fiber<(), Infallible>| {
        Effect::sleep(Duration::from_millis(10))
            .and_then(fiber.interrupt())
            .map(|exit| exit.is_interrupted())
    });
    assert_eq!(rt.run(program), Exit::succeed(true));
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_waiters_all_see_the_first_completion() {
    let rt = runtime();
    let cell: Deferred<u32, String> = Deferred::new();
    let waiters: Vec<Effect<u32, String>> = (0..16)
        .map(|i| Effect::sleep(Duration::from_millis(i % 4)).and_then(cell.wait()))
        .collect();
    let completer = cell.clone();
    let program = Effect::collect_all_par(waiters).zip_par(
        Effect::sleep(Duration::from_millis(20))
            .and_then(completer.succeed(11))
            .zip(completer.succeed(12)),
    );
    assert_eq!(rt.run(program), Exit::succeed((vec![11; 16], (true, false))));
    assert_eq!(rt.run(cell.wait()), Exit::succeed(11));
}
