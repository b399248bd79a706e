use std::sync::Arc;
use std::time::Duration;

use super::{Decision, Schedule, Step};
use crate::cell::SyncCell;
use crate::clock;
use crate::effect::{Effect, Payload};

/// One run of a [`Schedule`], fed an input after every attempt.
pub struct ScheduleDriver<I> {
    step: Step<I>,
    attempts: u64,
    done: bool,
}

impl<I> ScheduleDriver<I> {
    pub(crate) fn new(step: Step<I>) -> Self {
        Self {
            step,
            attempts: 0,
            done: false,
        }
    }

    /// How long to wait before going again, or `None` once the schedule is
    /// done. A finished driver stays finished.
    pub fn next(&mut self, now: u64, input: &I) -> Option<Duration> {
        if self.done {
            return None;
        }
        match (self.step)(now, input) {
            Decision::Continue(windows) if windows.is_non_empty() => {
                self.attempts += 1;
                Some(Duration::from_millis(windows.start().saturating_sub(now)))
            }
            _ => {
                self.done = true;
                None
            }
        }
    }

    /// Recurrences granted so far.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

type Shared<I> = Arc<SyncCell<ScheduleDriver<I>>>;

fn advance<I>(driver: &Shared<I>, input: &I) -> Option<(Duration, u64)> {
    driver.modify(|d| d.next(clock::now_millis(), input).map(|delay| (delay, d.attempts())))
}

fn retry_loop<A: Payload, E: Payload>(effect: Effect<A, E>, driver: Shared<E>) -> Effect<A, E> {
    effect.clone().catch_all(move |error: E| match advance(&driver, &error) {
        Some((delay, attempt)) => {
            tracing::trace!(attempt, ?delay, "retrying failed effect");
            Effect::sleep(delay).and_then(retry_loop(effect.clone(), Arc::clone(&driver)))
        }
        None => Effect::fail(error),
    })
}

fn repeat_loop<A: Payload, E: Payload>(effect: Effect<A, E>, driver: Shared<A>) -> Effect<A, E> {
    effect.clone().flat_map(move |value: A| match advance(&driver, &value) {
        Some((delay, _)) => Effect::sleep(delay).and_then(repeat_loop(effect.clone(), Arc::clone(&driver))),
        None => Effect::succeed(value),
    })
}

impl<A: Payload, E: Payload> Effect<A, E> {
    /// Run again after each typed failure for as long as `schedule` allows,
    /// sleeping until each window it picks. The last failure is kept when
    /// the schedule gives up. Defects and interruptions are not retried.
    pub fn retry(self, schedule: Schedule<E>) -> Self {
        Effect::suspend(move || retry_loop(self.clone(), Arc::new(SyncCell::new(schedule.driver()))))
    }

    /// Retry at most `n` times, without waiting.
    pub fn retry_n(self, n: u64) -> Self {
        self.retry(Schedule::recurs(n))
    }

    /// Run, then run again after each success for as long as `schedule`
    /// allows. Succeeds with the last value; the first failure stops it.
    pub fn repeat(self, schedule: Schedule<A>) -> Self {
        Effect::suspend(move || repeat_loop(self.clone(), Arc::new(SyncCell::new(schedule.driver()))))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cause::Exit;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;

    fn runtime() -> Runtime {
        Runtime::with_config(RuntimeConfig {
            workers: 1,
            ..RuntimeConfig::default()
        })
        .expect("runtime")
    }

    fn flaky(attempts: &Arc<AtomicUsize>, failures: usize) -> Effect<usize, String> {
        let counter = Arc::clone(attempts);
        Effect::try_sync(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                Err(format!("attempt {n}"))
            } else {
                Ok(n)
            }
        })
    }

    #[test]
    fn driver_stops_for_good() {
        let mut driver = Schedule::<()>::recurs(1).driver();
        assert_eq!(driver.next(0, &()), Some(Duration::ZERO));
        assert_eq!(driver.next(0, &()), None);
        assert!(driver.is_done());
        assert_eq!(driver.next(0, &()), None);
        assert_eq!(driver.attempts(), 1);
    }

    #[test]
    fn retry_until_success() {
        let rt = runtime();
        let attempts = Arc::new(AtomicUsize::new(0));
        let effect = flaky(&attempts, 2).retry(Schedule::spaced(Duration::from_millis(5)).intersect(&Schedule::recurs(5)));
        assert_eq!(rt.run(effect), Exit::succeed(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_gives_up_with_last_error() {
        let rt = runtime();
        let attempts = Arc::new(AtomicUsize::new(0));
        assert_eq!(rt.run(flaky(&attempts, 10).retry_n(2)), Exit::fail("attempt 3".to_string()));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn each_run_gets_a_fresh_schedule() {
        let rt = runtime();
        let attempts = Arc::new(AtomicUsize::new(0));
        let effect = flaky(&attempts, 100).retry_n(1);
        assert!(rt.run(effect.clone()).is_failure());
        assert!(rt.run(effect).is_failure());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn repeat_returns_last_value() {
        let rt = runtime();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let tick: Effect<usize> = Effect::sync(move || counter.fetch_add(1, Ordering::SeqCst) + 1);
        assert_eq!(rt.run(tick.clone().repeat(Schedule::recurs(3))), Exit::succeed(4));

        let until: Effect<usize> = tick.repeat(Schedule::forever().until_input(|n: &usize| *n >= 6));
        assert_eq!(rt.run(until), Exit::succeed(6));
    }
}
