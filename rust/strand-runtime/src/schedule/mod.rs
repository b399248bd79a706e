//! Interval algebra and the recurrence policies built on it.
//!
//! A [`Schedule`] decides, after each attempt, whether to go again and in
//! which time window. Windows are expressed as [`Intervals`] of absolute
//! milliseconds on the runtime clock; the drivers in this module sleep
//! until the start of the chosen window.

mod driver;
mod interval;
mod intervals;

pub use driver::ScheduleDriver;
pub use interval::Interval;
pub use intervals::Intervals;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::duration_millis;

/// What a schedule wants after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Go again, at the start of these windows.
    Continue(Intervals),
    Done,
}

pub(crate) type Step<I> = Box<dyn FnMut(u64, &I) -> Decision + Send>;

/// A recurrence policy over inputs of type `I`. Each run of a schedule
/// starts from fresh state.
pub struct Schedule<I> {
    make: Arc<dyn Fn() -> Step<I> + Send + Sync>,
}

impl<I> Clone for Schedule<I> {
    fn clone(&self) -> Self {
        Self {
            make: Arc::clone(&self.make),
        }
    }
}

impl<I> fmt::Debug for Schedule<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Schedule { .. }")
    }
}

/// Windows from `at` on. The last millisecond is kept out so a saturated
/// delay still leaves a non-empty window.
fn window_from(at: u64) -> Intervals {
    Intervals::after(at.min(u64::MAX - 1))
}

/// `n`-th Fibonacci number with fib(0) = fib(1) = 1.
fn fibonacci(n: u64) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

impl<I: 'static> Schedule<I> {
    pub(crate) fn from_step<S>(make: impl Fn() -> S + Send + Sync + 'static) -> Self
    where
        S: FnMut(u64, &I) -> Decision + Send + 'static,
    {
        Self {
            make: Arc::new(move || Box::new(make()) as Step<I>),
        }
    }

    pub(crate) fn step(&self) -> Step<I> {
        (self.make)()
    }

    /// Start a stateful run of this schedule.
    pub fn driver(&self) -> ScheduleDriver<I> {
        ScheduleDriver::new(self.step())
    }

    /// Delay computed from the attempt number (0-based), going again
    /// forever.
    fn delayed(delay: impl Fn(u64) -> u64 + Send + Sync + 'static) -> Self {
        let delay = Arc::new(delay);
        Self::from_step(move || {
            let delay = Arc::clone(&delay);
            let mut attempt = 0u64;
            move |now: u64, _: &I| {
                let wait = delay(attempt);
                attempt += 1;
                Decision::Continue(window_from(now.saturating_add(wait)))
            }
        })
    }

    /// Go again immediately, `n` times.
    pub fn recurs(n: u64) -> Self {
        Self::from_step(move || {
            let mut left = n;
            move |now: u64, _: &I| {
                if left == 0 {
                    return Decision::Done;
                }
                left -= 1;
                Decision::Continue(window_from(now))
            }
        })
    }

    pub fn once() -> Self {
        Self::recurs(1)
    }

    pub fn stop() -> Self {
        Self::recurs(0)
    }

    /// Go again immediately, forever.
    pub fn forever() -> Self {
        Self::delayed(|_| 0)
    }

    /// Wait `interval` after each attempt.
    pub fn spaced(interval: Duration) -> Self {
        let ms = duration_millis(interval);
        Self::delayed(move |_| ms)
    }

    /// Go again at fixed boundaries `start + k * interval`, measured from the
    /// first decision. A slow attempt that overruns skips to the next
    /// boundary instead of piling up.
    pub fn fixed(interval: Duration) -> Self {
        let ms = duration_millis(interval).max(1);
        Self::from_step(move || {
            let mut origin: Option<u64> = None;
            move |now: u64, _: &I| {
                let start = *origin.get_or_insert(now);
                let k = now.saturating_sub(start) / ms + 1;
                Decision::Continue(window_from(start.saturating_add(k.saturating_mul(ms))))
            }
        })
    }

    /// Wait `base * (n + 1)` before attempt `n + 1`.
    pub fn linear(base: Duration) -> Self {
        let base = duration_millis(base);
        Self::delayed(move |n| base.saturating_mul(n.saturating_add(1)))
    }

    /// Wait `base * factor^n` before attempt `n + 1`.
    pub fn exponential(base: Duration, factor: f64) -> Self {
        let base = duration_millis(base) as f64;
        Self::delayed(move |n| {
            let delay = base * factor.powi(n.min(i32::MAX as u64) as i32);
            if delay.is_finite() && delay < u64::MAX as f64 {
                delay as u64
            } else {
                u64::MAX
            }
        })
    }

    /// Wait `base * fib(n)` before attempt `n + 1`.
    pub fn fibonacci(base: Duration) -> Self {
        let base = duration_millis(base);
        Self::delayed(move |n| base.saturating_mul(fibonacci(n)))
    }

    /// Go again only while both schedules do, in the windows both allow.
    pub fn intersect(&self, that: &Schedule<I>) -> Self {
        let (left, right) = (self.clone(), that.clone());
        Self::from_step(move || {
            let (mut l, mut r) = (left.step(), right.step());
            move |now: u64, input: &I| match (l(now, input), r(now, input)) {
                (Decision::Continue(a), Decision::Continue(b)) => {
                    let both = a.intersect(&b);
                    if both.is_non_empty() {
                        Decision::Continue(both)
                    } else {
                        Decision::Done
                    }
                }
                _ => Decision::Done,
            }
        })
    }

    /// Go again while either schedule does, in the windows either allows.
    pub fn union(&self, that: &Schedule<I>) -> Self {
        let (left, right) = (self.clone(), that.clone());
        Self::from_step(move || {
            let (mut l, mut r) = (left.step(), right.step());
            move |now: u64, input: &I| match (l(now, input), r(now, input)) {
                (Decision::Continue(a), Decision::Continue(b)) => Decision::Continue(a.union(&b)),
                (Decision::Continue(a), Decision::Done) | (Decision::Done, Decision::Continue(a)) => {
                    Decision::Continue(a)
                }
                (Decision::Done, Decision::Done) => Decision::Done,
            }
        })
    }

    /// Stop as soon as an input fails `predicate`.
    pub fn while_input(&self, predicate: impl Fn(&I) -> bool + Send + Sync + 'static) -> Self {
        let inner = self.clone();
        let predicate = Arc::new(predicate);
        Self::from_step(move || {
            let mut step = inner.step();
            let predicate = Arc::clone(&predicate);
            move |now: u64, input: &I| {
                if predicate(input) {
                    step(now, input)
                } else {
                    Decision::Done
                }
            }
        })
    }

    /// Stop as soon as an input satisfies `predicate`.
    pub fn until_input(&self, predicate: impl Fn(&I) -> bool + Send + Sync + 'static) -> Self {
        self.while_input(move |input| !predicate(input))
    }

    /// Never wait longer than `max` for the next attempt.
    pub fn with_max_delay(&self, max: Duration) -> Self {
        let inner = self.clone();
        let max = duration_millis(max);
        Self::from_step(move || {
            let mut step = inner.step();
            move |now: u64, input: &I| match step(now, input) {
                Decision::Continue(windows) => {
                    let latest = now.saturating_add(max);
                    if windows.start() > latest {
                        Decision::Continue(window_from(latest))
                    } else {
                        Decision::Continue(windows)
                    }
                }
                Decision::Done => Decision::Done,
            }
        })
    }

    /// Stop once `limit` has elapsed since the first decision.
    pub fn up_to(&self, limit: Duration) -> Self {
        let inner = self.clone();
        let limit = duration_millis(limit);
        Self::from_step(move || {
            let mut step = inner.step();
            let mut origin: Option<u64> = None;
            move |now: u64, input: &I| {
                let start = *origin.get_or_insert(now);
                if now.saturating_sub(start) >= limit {
                    return Decision::Done;
                }
                match step(now, input) {
                    Decision::Continue(windows) => {
                        let allowed = windows.intersect(&Intervals::of(Interval::new(now, start.saturating_add(limit))));
                        if allowed.is_non_empty() {
                            Decision::Continue(allowed)
                        } else {
                            Decision::Done
                        }
                    }
                    Decision::Done => Decision::Done,
                }
            }
        })
    }
}
