use std::fmt;

use super::{Abort, Stm, TRef};
use crate::effect::{Effect, Payload};

/// A transactional counting semaphore.
#[derive(Clone)]
pub struct TSemaphore {
    permits: TRef<usize>,
}

impl fmt::Debug for TSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TSemaphore")
            .field("permits", &self.permits)
            .finish()
    }
}

impl TSemaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: TRef::new(permits),
        }
    }

    pub fn make<E: Payload>(permits: usize) -> Stm<Self, E> {
        Stm::from_fn(move |_| Ok(TSemaphore::new(permits)))
    }

    pub fn available<E: Payload>(&self) -> Stm<usize, E> {
        self.permits.get()
    }

    pub fn acquire<E: Payload>(&self) -> Stm<(), E> {
        self.acquire_n(1)
    }

    /// Take `n` permits, retrying until that many are available.
    pub fn acquire_n<E: Payload>(&self, n: usize) -> Stm<(), E> {
        let permits = self.permits.clone();
        Stm::from_fn(move |journal| {
            let available = permits.read::<E>(journal)?;
            if available < n {
                return Err(Abort::Retry);
            }
            permits.write(journal, available - n);
            Ok(())
        })
    }

    pub fn release<E: Payload>(&self) -> Stm<(), E> {
        self.release_n(1)
    }

    pub fn release_n<E: Payload>(&self, n: usize) -> Stm<(), E> {
        self.permits.update(move |available| available + n)
    }

    /// Run `effect` holding one permit. The permit is returned however the
    /// effect ends; waiting for it stays interruptible.
    pub fn with_permit<A: Payload, E: Payload>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        let acquire = self.acquire::<E>().commit();
        let release = self.release::<std::convert::Infallible>().commit();
        Effect::uninterruptible_mask(move |restore| {
            restore
                .apply(acquire.clone())
                .and_then(restore.apply(effect.clone()).ensuring(release.clone()))
        })
    }
}
