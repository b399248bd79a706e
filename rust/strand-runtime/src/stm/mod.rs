//! Software transactional memory.
//!
//! An [`Stm<A, E>`] is a description of a transaction over [`TRef`]s and
//! the structures built from them. Nothing is read or written until it is
//! [`commit`](Stm::commit)ted, which turns it into an [`Effect`]. Each
//! attempt runs against a private journal; if another transaction commits
//! to a ref this attempt read, the attempt is thrown away and restarted.
//! A transaction that calls [`Stm::retry`] suspends its fiber until one of
//! the refs it read changes.

mod journal;
mod tmap;
mod tpriority_queue;
mod tqueue;
mod tref;
mod tsemaphore;

pub use tmap::TMap;
pub use tpriority_queue::TPriorityQueue;
pub use tqueue::TQueue;
pub use tref::TRef;
pub use tsemaphore::TSemaphore;

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use crate::cell::SyncCell;
use crate::defect::{catch_defect, Defect};
use crate::effect::primitive::with_fiber_node;
use crate::effect::{Effect, Payload};
use crate::fiber::Resume;
use journal::{Conflict, Journal, Registrations};

/// Why an attempt stopped before producing a value.
pub(crate) enum Abort<E> {
    Fail(E),
    Die(Defect),
    Retry,
    Conflict,
}

impl<E> From<Conflict> for Abort<E> {
    fn from(_: Conflict) -> Self {
        Abort::Conflict
    }
}

type Run<A, E> = Arc<dyn Fn(&mut Journal) -> Result<A, Abort<E>> + Send + Sync>;

pub struct Stm<A, E = Infallible> {
    run: Run<A, E>,
}

impl<A, E> Clone for Stm<A, E> {
    fn clone(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
        }
    }
}

impl<A, E> fmt::Debug for Stm<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Stm { .. }")
    }
}

impl<A: Payload, E: Payload> Stm<A, E> {
    pub(crate) fn from_fn(
        run: impl Fn(&mut Journal) -> Result<A, Abort<E>> + Send + Sync + 'static,
    ) -> Self {
        Self { run: Arc::new(run) }
    }

    pub fn succeed(value: A) -> Self {
        Self::from_fn(move |_| Ok(value.clone()))
    }

    pub fn fail(error: E) -> Self {
        Self::from_fn(move |_| Err(Abort::Fail(error.clone())))
    }

    pub fn die(defect: Defect) -> Self {
        Self::from_fn(move |_| Err(Abort::Die(defect.clone())))
    }

    pub fn die_message(message: impl Into<String>) -> Self {
        Self::die(Defect::new(message))
    }

    /// Abandon the attempt and wait until a ref read so far changes.
    pub fn retry() -> Self {
        Self::from_fn(|_| Err(Abort::Retry))
    }

    /// Build the transaction lazily, on each attempt.
    pub fn suspend(f: impl Fn() -> Stm<A, E> + Send + Sync + 'static) -> Self {
        Self::from_fn(move |journal| (f().run)(journal))
    }

    pub fn map<B: Payload>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Stm<B, E> {
        Stm::from_fn(move |journal| (self.run)(journal).map(&f))
    }

    pub fn flat_map<B: Payload>(
        self,
        f: impl Fn(A) -> Stm<B, E> + Send + Sync + 'static,
    ) -> Stm<B, E> {
        Stm::from_fn(move |journal| {
            let a = (self.run)(journal)?;
            (f(a).run)(journal)
        })
    }

    pub fn and_then<B: Payload>(self, that: Stm<B, E>) -> Stm<B, E> {
        Stm::from_fn(move |journal| {
            (self.run)(journal)?;
            (that.run)(journal)
        })
    }

    pub fn zip<B: Payload>(self, that: Stm<B, E>) -> Stm<(A, B), E> {
        self.zip_with(that, |a, b| (a, b))
    }

    pub fn zip_with<B: Payload, C: Payload>(
        self,
        that: Stm<B, E>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Stm<C, E> {
        Stm::from_fn(move |journal| {
            let a = (self.run)(journal)?;
            let b = (that.run)(journal)?;
            Ok(f(a, b))
        })
    }

    pub fn as_<B: Payload>(self, value: B) -> Stm<B, E> {
        self.map(move |_| value.clone())
    }

    pub fn as_unit(self) -> Stm<(), E> {
        self.map(|_| ())
    }

    pub fn map_error<E2: Payload>(self, f: impl Fn(E) -> E2 + Send + Sync + 'static) -> Stm<A, E2> {
        Stm::from_fn(move |journal| {
            (self.run)(journal).map_err(|abort| match abort {
                Abort::Fail(e) => Abort::Fail(f(e)),
                Abort::Die(d) => Abort::Die(d),
                Abort::Retry => Abort::Retry,
                Abort::Conflict => Abort::Conflict,
            })
        })
    }

    /// Recover from typed failures. Writes made before the failure stay in
    /// the journal.
    pub fn catch_all<E2: Payload>(
        self,
        f: impl Fn(E) -> Stm<A, E2> + Send + Sync + 'static,
    ) -> Stm<A, E2> {
        Stm::from_fn(move |journal| match (self.run)(journal) {
            Ok(a) => Ok(a),
            Err(Abort::Fail(e)) => (f(e).run)(journal),
            Err(Abort::Die(d)) => Err(Abort::Die(d)),
            Err(Abort::Retry) => Err(Abort::Retry),
            Err(Abort::Conflict) => Err(Abort::Conflict),
        })
    }

    /// Try `self`; if it retries, undo its writes and try `that` instead.
    /// If both retry, the transaction waits on the refs either one read.
    pub fn or_else(self, that: Stm<A, E>) -> Self {
        Stm::from_fn(move |journal| {
            let before = journal.clone();
            match (self.run)(journal) {
                Err(Abort::Retry) => {
                    let abandoned = std::mem::replace(journal, before);
                    journal.absorb_reads(abandoned);
                    (that.run)(journal)
                }
                other => other,
            }
        })
    }

    /// Run every transaction in order, collecting the values.
    pub fn collect_all(all: impl IntoIterator<Item = Stm<A, E>>) -> Stm<Vec<A>, E> {
        let all: Vec<Stm<A, E>> = all.into_iter().collect();
        Stm::from_fn(move |journal| all.iter().map(|stm| (stm.run)(journal)).collect())
    }

    /// Run the transaction atomically.
    pub fn commit(&self) -> Effect<A, E> {
        let stm = self.clone();
        Effect::from_node(with_fiber_node(move |ctx| {
            let patience = ctx.fiber.config().stm_conflicts_before_yield.max(1);
            attempt(stm.clone(), patience, 0).node
        }))
    }
}

impl<E: Payload> Stm<(), E> {
    pub fn unit() -> Self {
        Self::succeed(())
    }

    /// Retry unless `condition` holds.
    pub fn check(condition: bool) -> Self {
        if condition {
            Self::unit()
        } else {
            Self::retry()
        }
    }
}

/// One attempt of `stm`. After `patience` consecutive conflicts the fiber
/// yields before trying again.
fn attempt<A: Payload, E: Payload>(stm: Stm<A, E>, patience: usize, conflicts: usize) -> Effect<A, E> {
    Effect::suspend(move || {
        let mut journal = Journal::new();
        let outcome = match catch_defect(|| (stm.run)(&mut journal)) {
            Ok(outcome) => outcome,
            Err(defect) => Err(Abort::Die(defect)),
        };
        let again = || {
            let conflicts = conflicts + 1;
            if conflicts >= patience {
                tracing::trace!(conflicts, "transaction yielding after conflicts");
                Effect::<(), E>::yield_now().and_then(attempt(stm.clone(), patience, 0))
            } else {
                attempt(stm.clone(), patience, conflicts)
            }
        };
        match outcome {
            Ok(value) => match journal.commit() {
                Ok(woken) => {
                    for resume in woken {
                        resume.succeed(());
                    }
                    Effect::succeed(value)
                }
                Err(Conflict) => again(),
            },
            Err(Abort::Conflict) => again(),
            Err(_) if !journal.is_consistent() => again(),
            Err(Abort::Fail(e)) => Effect::fail(e),
            Err(Abort::Die(defect)) => Effect::die(defect),
            Err(Abort::Retry) => await_change(journal)
                .widen()
                .and_then(attempt(stm.clone(), patience, 0)),
        }
    })
}

/// Suspend until some ref the journal read is committed to.
fn await_change(journal: Journal) -> Effect<(), Infallible> {
    let journal = Arc::new(journal);
    let registered = Arc::new(SyncCell::new(Registrations::empty()));
    let cleanup = Arc::clone(&registered);
    Effect::async_(move |resume: Resume<()>| {
        match journal.register(&resume) {
            Some(registrations) => {
                registered.modify(|slot| *slot = registrations);
            }
            None => {
                resume.succeed(());
            }
        }
        None
    })
    .ensuring(Effect::sync(move || cleanup.modify(|slot| slot.release())))
}
