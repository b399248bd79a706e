//! Transactions under real contention.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strand_runtime::{Effect, Exit, Fiber, Runtime, RuntimeConfig, Stm, TMap, TPriorityQueue, TRef};

fn runtime() -> Runtime {
    Runtime::with_config(RuntimeConfig {
        workers: 4,
        ..RuntimeConfig::default()
    })
    .expect("runtime")
}

fn increment(counter: &TRef<u64>, times: u32) -> Effect<Vec<()>> {
    let counter = counter.clone();
    Effect::for_each(0..times, move |_| counter.update(|n| n + 1).commit())
}

#[test]
fn concurrent_increments_are_never_lost() {
    let rt = runtime();
    let counter = TRef::new(0u64);
    let program = Effect::collect_all_par(vec![increment(&counter, 1000), increment(&counter, 1000)]);
    assert!(rt.run(program).is_success());
    assert_eq!(counter.committed(), 2000);
}

#[test]
fn disjoint_transactions_all_commit() {
    let rt = runtime();
    let refs: Vec<TRef<u64>> = (0..8).map(|_| TRef::new(0)).collect();
    let program = Effect::collect_all_par(refs.iter().map(|r| increment(r, 200)));
    assert!(rt.run(program).is_success());
    assert!(refs.iter().all(|r| r.committed() == 200));
}

#[test]
fn transfers_preserve_the_total() {
    let rt = runtime();
    let a = TRef::new(1_000i64);
    let b = TRef::new(1_000i64);
    let transfer = |from: &TRef<i64>, to: &TRef<i64>, amount: i64| -> Effect<Vec<()>> {
        let tx: Stm<()> = from.update(move |n| n - amount).and_then(to.update(move |n| n + amount));
        Effect::for_each(0..300, move |_: i32| tx.commit())
    };
    let observed = Arc::new(AtomicUsize::new(0));
    let (ra, rb) = (a.clone(), b.clone());
    let counter = Arc::clone(&observed);
    let auditor: Effect<Vec<()>> = Effect::for_each(0..300, move |_: i32| {
        let counter = Arc::clone(&counter);
        ra.get()
            .zip(rb.get())
            .commit()
            .map(move |(x, y)| {
                if x + y != 2_000 {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
    });
    let program = Effect::collect_all_par(vec![transfer(&a, &b, 3), transfer(&b, &a, 7), auditor]);
    assert!(rt.run(program).is_success());
    assert_eq!(a.committed() + b.committed(), 2_000);
    assert_eq!(a.committed(), 1_000 - 900 + 2_100);
    assert_eq!(observed.load(Ordering::SeqCst), 0);
}

#[test]
fn retry_blocks_until_a_read_ref_changes() {
    let rt = runtime();
    let ready = TRef::new(false);
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&attempts);
    let flag = ready.clone();
    let waiter: Stm<&'static str> = Stm::suspend(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        flag.get().flat_map(|ready| Stm::check(ready)).as_("woke")
    });

    let setter = ready.clone();
    let program: Effect<&'static str> = waiter
        .commit()
        .fork()
        .flat_map(move |fiber: Fiber<&'static str, Infallible>| {
            Effect::sleep(Duration::from_millis(50))
                .and_then(setter.set(true).commit())
                .and_then(fiber.join())
        });
    assert_eq!(rt.run(program), Exit::succeed("woke"));
    // one blocked attempt, one after the wake-up; no polling in between
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn or_else_falls_back_only_on_retry() {
    let rt = runtime();
    let primary: TRef<Option<i32>> = TRef::new(None);
    let fallback = TRef::new(7);
    let take_primary: Stm<i32> = primary.get().flat_map(|slot| match slot {
        Some(n) => Stm::succeed(n),
        None => Stm::retry(),
    });
    assert_eq!(rt.run(take_primary.or_else(fallback.get()).commit()), Exit::succeed(7));

    let failing: Stm<i32, String> = Stm::fail("broken".to_string());
    let unused: Stm<i32, String> = Stm::succeed(1);
    assert_eq!(rt.run(failing.or_else(unused).commit()), Exit::fail("broken".to_string()));
}

#[test]
fn moving_entries_between_maps_is_atomic() {
    let rt = runtime();
    let left: TMap<&'static str, u32> = TMap::from_entries([("a", 1), ("b", 2)]);
    let right: TMap<&'static str, u32> = TMap::new();
    let (from, to) = (left.clone(), right.clone());
    let mv: Stm<bool> = from.remove("a").flat_map(move |value| match value {
        Some(v) => to.put("a", v).as_(true),
        None => Stm::succeed(false),
    });
    assert_eq!(rt.run(mv.commit()), Exit::succeed(true));
    assert_eq!(rt.run(left.keys::<Infallible>().commit()), Exit::succeed(vec!["b"]));
    assert_eq!(rt.run(right.get::<Infallible>("a").commit()), Exit::succeed(Some(1)));
}

#[test]
fn priority_queue_feeds_blocked_takers() {
    let rt = runtime();
    let queue: TPriorityQueue<u32> = TPriorityQueue::new();
    let non_empty: Stm<Vec<u32>> = queue
        .take_up_to(2)
        .flat_map(|items: Vec<u32>| Stm::check(!items.is_empty()).as_(items));
    let taker = rt.fork(non_empty.commit());
    std::thread::sleep(Duration::from_millis(20));
    assert!(taker.poll_now().is_none());
    assert!(rt.run(queue.offer_all::<Infallible>(vec![9, 3, 5]).commit()).is_success());
    assert_eq!(rt.run(taker.join()), Exit::succeed(vec![3, 5]));
    assert_eq!(rt.run(queue.to_vec::<Infallible>().commit()), Exit::succeed(vec![9]));
}
