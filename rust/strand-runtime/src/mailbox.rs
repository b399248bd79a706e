//! Multi-producer, multi-consumer queue with a terminal signal.
//!
//! A mailbox is open until it is ended or failed. After that no new items
//! are admitted, but whatever is already buffered can still be taken; once
//! drained, takers see `None` (ended) or the failure cause (failed).

use std::collections::{BTreeMap, VecDeque};
use std::convert::Infallible;
use std::fmt;
use std::mem;
use std::sync::Arc;

use crate::cause::{Cause, Exit};
use crate::cell::SyncCell;
use crate::deferred::Deferred;
use crate::effect::{Effect, Payload};
use crate::fiber::Resume;

/// What a bounded mailbox does with items that do not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Offerers wait for room.
    #[default]
    Suspend,
    /// New items are rejected.
    Dropping,
    /// The oldest buffered items are evicted to make room.
    Sliding,
}

struct PendingOffer<A> {
    key: u64,
    remaining: VecDeque<A>,
    resume: Resume<Vec<A>>,
}

struct State<A, E> {
    buffer: VecDeque<A>,
    capacity: Option<usize>,
    strategy: Strategy,
    offers: VecDeque<PendingOffer<A>>,
    takers: BTreeMap<u64, Resume<Option<A>, E>>,
    /// Takers to be told to poll again once the lock is released.
    woken: Vec<Resume<Option<A>, E>>,
    next_key: u64,
    done: Option<Exit<(), E>>,
}

enum OfferStep<A> {
    Settled(Vec<A>),
    Waiting(u64),
}

enum TakeStep<A, E> {
    Ready(Effect<Option<A>, E>, Vec<Resume<Vec<A>>>),
    Waiting(u64),
}

impl<A: Payload, E: Payload> State<A, E> {
    fn has_room(&self) -> bool {
        self.capacity.map_or(true, |cap| self.buffer.len() < cap)
    }

    fn key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    /// Buffer `item` if there is room. Items never go to a taker directly;
    /// waiting takers are woken to poll the buffer themselves, so a taker
    /// interrupted before it runs leaves the item behind.
    fn push(&mut self, item: A) -> Result<(), A> {
        if !self.has_room() {
            return Err(item);
        }
        self.buffer.push_back(item);
        self.woken.extend(mem::take(&mut self.takers).into_values());
        Ok(())
    }

    /// Move items from waiting offerers into freed capacity. Returns the
    /// offerers whose items are now all admitted.
    fn admit_pending(&mut self) -> Vec<Resume<Vec<A>>> {
        let mut finished = Vec::new();
        while let Some(mut offer) = self.offers.pop_front() {
            while let Some(item) = offer.remaining.pop_front() {
                if let Err(item) = self.push(item) {
                    offer.remaining.push_front(item);
                    self.offers.push_front(offer);
                    return finished;
                }
            }
            finished.push(offer.resume);
        }
        finished
    }

    fn offer(&mut self, items: Vec<A>, resume: &Resume<Vec<A>>) -> OfferStep<A> {
        if self.done.is_some() {
            return OfferStep::Settled(items);
        }
        let mut remaining: VecDeque<A> = items.into();
        if self.offers.is_empty() {
            while let Some(item) = remaining.pop_front() {
                let Err(item) = self.push(item) else { continue };
                match self.strategy {
                    Strategy::Suspend => {
                        remaining.push_front(item);
                        break;
                    }
                    Strategy::Dropping => {
                        let mut dropped = vec![item];
                        dropped.extend(remaining.drain(..));
                        return OfferStep::Settled(dropped);
                    }
                    Strategy::Sliding => {
                        self.buffer.pop_front();
                        self.buffer.push_back(item);
                    }
                }
            }
        }
        if remaining.is_empty() {
            return OfferStep::Settled(Vec::new());
        }
        let key = self.key();
        self.offers.push_back(PendingOffer {
            key,
            remaining,
            resume: resume.clone(),
        });
        OfferStep::Waiting(key)
    }

    fn take(&mut self, resume: &Resume<Option<A>, E>) -> TakeStep<A, E> {
        if let Some(item) = self.buffer.pop_front() {
            let admitted = self.admit_pending();
            return TakeStep::Ready(Effect::succeed(Some(item)), admitted);
        }
        match &self.done {
            Some(Exit::Success(())) => TakeStep::Ready(Effect::succeed(None), Vec::new()),
            Some(Exit::Failure(cause)) => {
                TakeStep::Ready(Effect::fail_cause(cause.clone()), Vec::new())
            }
            None => {
                let key = self.key();
                self.takers.insert(key, resume.clone());
                TakeStep::Waiting(key)
            }
        }
    }

    fn drain(&mut self, limit: usize) -> (Vec<A>, Vec<Resume<Vec<A>>>) {
        let n = limit.min(self.buffer.len());
        let items: Vec<A> = self.buffer.drain(..n).collect();
        let admitted = if items.is_empty() {
            Vec::new()
        } else {
            self.admit_pending()
        };
        (items, admitted)
    }
}

pub struct Mailbox<A, E = Infallible> {
    state: Arc<SyncCell<State<A, E>>>,
    done_signal: Deferred<(), E>,
}

impl<A, E> Clone for Mailbox<A, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            done_signal: self.done_signal.clone(),
        }
    }
}

impl<A, E> fmt::Debug for Mailbox<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (size, capacity, done) = self
            .state
            .with(|s| (s.buffer.len(), s.capacity, s.done.is_some()));
        f.debug_struct("Mailbox")
            .field("size", &size)
            .field("capacity", &capacity)
            .field("done", &done)
            .finish()
    }
}

fn settle<A: Payload>(admitted: Vec<Resume<Vec<A>>>) {
    for offerer in admitted {
        offerer.succeed(Vec::new());
    }
}

/// Tell every taker woken by the last update to poll again.
fn wake_takers<A: Payload, E: Payload>(state: &Arc<SyncCell<State<A, E>>>) {
    let woken = state.modify(|s| mem::take(&mut s.woken));
    for taker in woken {
        taker.resume(take_from(Arc::clone(state)));
    }
}

fn take_from<A: Payload, E: Payload>(state: Arc<SyncCell<State<A, E>>>) -> Effect<Option<A>, E> {
    Effect::async_(move |resume: Resume<Option<A>, E>| {
        match state.modify(|s| s.take(&resume)) {
            TakeStep::Ready(result, admitted) => {
                settle(admitted);
                wake_takers(&state);
                resume.resume(result);
                None
            }
            TakeStep::Waiting(key) => {
                let state = Arc::clone(&state);
                Some(Effect::sync(move || {
                    state.modify(|s| {
                        s.takers.remove(&key);
                    })
                }))
            }
        }
    })
}

impl<A: Payload, E: Payload> Mailbox<A, E> {
    /// A mailbox holding at most `capacity` items (at least one); offerers
    /// wait when it is full.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_strategy(capacity, Strategy::Suspend)
    }

    pub fn unbounded() -> Self {
        Self::build(None, Strategy::Suspend)
    }

    pub fn with_strategy(capacity: usize, strategy: Strategy) -> Self {
        Self::build(Some(capacity.max(1)), strategy)
    }

    fn build(capacity: Option<usize>, strategy: Strategy) -> Self {
        Self {
            state: Arc::new(SyncCell::new(State {
                buffer: VecDeque::new(),
                capacity,
                strategy,
                offers: VecDeque::new(),
                takers: BTreeMap::new(),
                woken: Vec::new(),
                next_key: 0,
                done: None,
            })),
            done_signal: Deferred::new(),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.state.with(|s| s.capacity)
    }

    /// Offer one item. `false` if it was not admitted because the mailbox
    /// is done (or, with [`Strategy::Dropping`], full).
    pub fn offer<X: Payload>(&self, item: A) -> Effect<bool, X> {
        self.offer_all(vec![item]).map(|rejected| rejected.is_empty())
    }

    /// Offer items in order, waiting for room as needed. Succeeds with the
    /// items that were not admitted.
    pub fn offer_all<X: Payload>(&self, items: Vec<A>) -> Effect<Vec<A>, X> {
        let state = Arc::clone(&self.state);
        Effect::<Vec<A>>::async_(move |resume: Resume<Vec<A>>| {
            let step = state.modify(|s| s.offer(items.clone(), &resume));
            wake_takers(&state);
            match step {
                OfferStep::Settled(rejected) => {
                    resume.succeed(rejected);
                    None
                }
                OfferStep::Waiting(key) => {
                    tracing::trace!(fiber = %resume.fiber_id(), "offer waiting for capacity");
                    let state = Arc::clone(&state);
                    Some(Effect::sync(move || {
                        state.modify(|s| s.offers.retain(|offer| offer.key != key))
                    }))
                }
            }
        })
        .widen()
    }

    /// Offer without suspending, for producers outside any fiber. `false`
    /// if the item was not admitted.
    pub fn unsafe_offer(&self, item: A) -> bool {
        let admitted = self.state.modify(|s| {
            if s.done.is_some() || !s.offers.is_empty() {
                return false;
            }
            match s.push(item) {
                Ok(()) => true,
                Err(item) if s.strategy == Strategy::Sliding => {
                    s.buffer.pop_front();
                    s.buffer.push_back(item);
                    true
                }
                Err(_) => false,
            }
        });
        wake_takers(&self.state);
        admitted
    }

    /// Take the oldest item, waiting while the mailbox is empty and open.
    /// `None` once the mailbox has ended and been drained.
    pub fn take(&self) -> Effect<Option<A>, E> {
        take_from(Arc::clone(&self.state))
    }

    /// Wait for at least one item, then take everything buffered. Empty
    /// only when the mailbox has ended.
    pub fn take_all(&self) -> Effect<Vec<A>, E> {
        self.take_n(usize::MAX)
    }

    /// Wait for at least one item, then take up to `n` items.
    pub fn take_n(&self, n: usize) -> Effect<Vec<A>, E> {
        if n == 0 {
            return Effect::succeed(Vec::new());
        }
        let state = Arc::clone(&self.state);
        self.take().map(move |first| {
            let Some(first) = first else {
                return Vec::new();
            };
            let (rest, admitted) = state.modify(|s| s.drain(n - 1));
            settle(admitted);
            wake_takers(&state);
            let mut items = Vec::with_capacity(rest.len() + 1);
            items.push(first);
            items.extend(rest);
            items
        })
    }

    pub fn size<X: Payload>(&self) -> Effect<usize, X> {
        let this = self.clone();
        Effect::sync(move || this.size_now())
    }

    pub fn size_now(&self) -> usize {
        self.state.with(|s| s.buffer.len())
    }

    pub fn is_done<X: Payload>(&self) -> Effect<bool, X> {
        let this = self.clone();
        Effect::sync(move || this.is_done_now())
    }

    pub fn is_done_now(&self) -> bool {
        self.state.with(|s| s.done.is_some())
    }

    /// Wait until the mailbox is done; fails with its cause if it failed.
    pub fn await_done(&self) -> Effect<(), E> {
        self.done_signal.wait()
    }

    /// End the mailbox normally. `false` if it was already done.
    pub fn end<X: Payload>(&self) -> Effect<bool, X> {
        self.done(Exit::Success(()))
    }

    pub fn fail<X: Payload>(&self, error: E) -> Effect<bool, X> {
        self.done(Exit::fail(error))
    }

    pub fn fail_cause<X: Payload>(&self, cause: Cause<E>) -> Effect<bool, X> {
        self.done(Exit::Failure(cause))
    }

    /// Transition to done with `exit`. Waiting takers are woken and waiting
    /// offerers get their unadmitted items back.
    pub fn done<X: Payload>(&self, exit: Exit<(), E>) -> Effect<bool, X> {
        let this = self.clone();
        Effect::sync(move || this.finish(exit.clone(), false))
    }

    /// End the mailbox and discard anything still buffered.
    pub fn shutdown<X: Payload>(&self) -> Effect<bool, X> {
        let this = self.clone();
        Effect::sync(move || this.finish(Exit::Success(()), true))
    }

    fn finish(&self, exit: Exit<(), E>, discard: bool) -> bool {
        let released = self.state.modify(|s| {
            if discard {
                s.buffer.clear();
            }
            if s.done.is_some() {
                return None;
            }
            s.done = Some(exit.clone());
            let mut takers: Vec<_> = mem::take(&mut s.takers).into_values().collect();
            takers.append(&mut s.woken);
            Some((takers, mem::take(&mut s.offers)))
        });
        let Some((takers, offers)) = released else {
            return false;
        };
        tracing::debug!(
            takers = takers.len(),
            offers = offers.len(),
            failed = exit.is_failure(),
            "mailbox done"
        );
        let outcome: Effect<Option<A>, E> = match &exit {
            Exit::Success(()) => Effect::succeed(None),
            Exit::Failure(cause) => Effect::fail_cause(cause.clone()),
        };
        for taker in takers {
            taker.resume(outcome.clone());
        }
        for offer in offers {
            offer.resume.succeed(offer.remaining.into());
        }
        self.done_signal.complete_now(Effect::from_exit(exit));
        true
    }
}
