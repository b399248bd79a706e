//! Mailbox ordering and back-pressure under concurrent producers and
//! consumers.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use strand_runtime::{Effect, Exit, Fiber, Mailbox, Runtime, RuntimeConfig, Strategy};

fn runtime() -> Runtime {
    Runtime::with_config(RuntimeConfig {
        workers: 2,
        ..RuntimeConfig::default()
    })
    .expect("runtime")
}

#[test]
fn slow_consumer_sees_offers_in_order() {
    let rt = runtime();
    let mailbox: Mailbox<i32> = Mailbox::bounded(2);

    let tx = mailbox.clone();
    let producer: Effect<Vec<bool>> = Effect::for_each(1..=5, move |n| tx.offer(n));
    let rx = mailbox.clone();
    let consumer: Effect<Vec<Option<i32>>> = Effect::for_each(0..5, move |_: i32| {
        Effect::sleep(Duration::from_millis(5)).and_then(rx.take())
    });

    let program: Effect<(Vec<Option<i32>>, Vec<bool>)> = producer
        .fork()
        .flat_map(move |fiber: Fiber<Vec<bool>, Infallible>| consumer.clone().zip(fiber.join()));
    assert_eq!(
        rt.run(program),
        Exit::succeed(((1..=5).map(Some).collect(), vec![true; 5]))
    );
}

#[test]
fn offer_all_buffers_what_fits_and_waits_for_the_rest() {
    let rt = runtime();
    let mailbox: Mailbox<i32> = Mailbox::bounded(3);
    assert!(mailbox.unsafe_offer(1));

    let offerer = rt.fork(mailbox.offer_all::<Infallible>(vec![10, 11, 12, 13]));
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(mailbox.size_now(), 3);
    assert!(offerer.poll_now().is_none());

    // taking one frees a slot for 12 before the rest is drained
    assert_eq!(rt.run(mailbox.take_all()), Exit::succeed(vec![1, 10, 11, 12]));
    assert_eq!(rt.run(offerer.join()), Exit::succeed(Vec::new()));
    assert_eq!(rt.run(mailbox.take_all()), Exit::succeed(vec![13]));
}

#[test]
fn many_producers_never_lose_items() {
    let rt = runtime();
    let mailbox: Mailbox<u32> = Mailbox::bounded(4);
    let producers: Vec<Effect<Vec<bool>>> = (0..4u32)
        .map(|p| {
            let tx = mailbox.clone();
            Effect::for_each(0..25u32, move |n| tx.offer(p * 100 + n))
        })
        .collect();
    let rx = mailbox.clone();
    let consumer: Effect<Vec<Option<u32>>> = Effect::for_each(0..100, move |_: u32| rx.take());

    let program = Effect::collect_all_par(producers).zip_par(consumer);
    let (_, taken) = rt.run_result(program).expect("run");
    let mut taken: Vec<u32> = taken.into_iter().flatten().collect();

    for p in 0..4u32 {
        let from_p: Vec<u32> = taken.iter().copied().filter(|n| n / 100 == p).collect();
        assert_eq!(from_p, (0..25).map(|n| p * 100 + n).collect::<Vec<_>>());
    }
    taken.sort_unstable();
    taken.dedup();
    assert_eq!(taken.len(), 100);
}

#[test]
fn end_drains_then_signals_none() {
    let rt = runtime();
    let mailbox: Mailbox<&'static str> = Mailbox::unbounded();
    let program = mailbox
        .offer("a")
        .and_then(mailbox.end())
        .and_then(mailbox.offer("late"))
        .zip(Effect::collect_all(vec![mailbox.take(), mailbox.take()]));
    assert_eq!(rt.run(program), Exit::succeed((false, vec![Some("a"), None])));
    assert_eq!(rt.run(mailbox.await_done()), Exit::succeed(()));
}

#[test]
fn failure_reaches_waiting_takers() {
    let rt = runtime();
    let mailbox: Mailbox<i32, String> = Mailbox::bounded(1);
    let taker = rt.fork(mailbox.take());
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(rt.run(mailbox.fail::<Infallible>("closed".to_string())), Exit::succeed(true));
    assert_eq!(rt.run(taker.join()), Exit::fail("closed".to_string()));
}

#[test]
fn sliding_and_dropping_never_suspend() {
    let rt = runtime();
    let sliding: Mailbox<i32> = Mailbox::with_strategy(2, Strategy::Sliding);
    let rejected = rt.run_result(sliding.offer_all::<Infallible>(vec![1, 2, 3, 4])).expect("offer");
    assert!(rejected.is_empty());
    assert_eq!(rt.run(sliding.take_all()), Exit::succeed(vec![3, 4]));

    let dropping: Mailbox<i32> = Mailbox::with_strategy(2, Strategy::Dropping);
    let rejected = rt.run_result(dropping.offer_all::<Infallible>(vec![1, 2, 3, 4])).expect("offer");
    assert_eq!(rejected, vec![3, 4]);
    assert_eq!(rt.run(dropping.take_all()), Exit::succeed(vec![1, 2]));
}

#[test]
fn interrupted_offerer_withdraws_its_items() {
    let rt = runtime();
    let mailbox: Mailbox<i32> = Mailbox::bounded(1);
    assert!(mailbox.unsafe_offer(1));
    let offerer = rt.fork(mailbox.offer::<Infallible>(99));
    std::thread::sleep(Duration::from_millis(20));
    assert!(offerer.poll_now().is_none());

    let exit = rt.run_result(offerer.interrupt::<Infallible>()).expect("interrupt");
    assert!(exit.is_interrupted());
    // freeing the slot must not admit the withdrawn 99
    assert_eq!(rt.run(mailbox.take()), Exit::succeed(Some(1)));
    assert_eq!(mailbox.size_now(), 0);
}

#[test]
fn interrupted_taker_leaves_the_item_behind() {
    let rt = Runtime::with_config(RuntimeConfig {
        workers: 1,
        ..RuntimeConfig::default()
    })
    .expect("runtime");
    let mailbox: Mailbox<i32> = Mailbox::unbounded();
    let taker = rt.fork(mailbox.take());
    std::thread::sleep(Duration::from_millis(20));

    let program = mailbox.offer::<Infallible>(42).and_then(taker.interrupt());
    match rt.run_result(program).expect("run") {
        Exit::Success(taken) => {
            assert_eq!(taken, Some(42));
            assert_eq!(mailbox.size_now(), 0);
        }
        Exit::Failure(cause) => {
            assert!(cause.is_interrupted());
            assert_eq!(mailbox.size_now(), 1);
            assert_eq!(rt.run(mailbox.take()), Exit::succeed(Some(42)));
        }
    }
}

#[test]
fn interrupted_sleep_cancels_its_timer() {
    let rt = runtime();
    let sleeper = rt.fork(Effect::<()>::sleep(Duration::from_secs(30)));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(rt.stats().timers_armed, 1);

    let exit = rt.run_result(sleeper.interrupt::<Infallible>()).expect("interrupt");
    assert!(exit.is_interrupted());
    // the cancel reaches the timer thread over its channel
    let deadline = Instant::now() + Duration::from_secs(2);
    while rt.stats().timers_armed > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(rt.stats().timers_armed, 0);
}
