use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::journal::{Journal, TRefCore};
use super::{Abort, Stm};
use crate::effect::primitive::{erase, unerase};
use crate::effect::{Effect, Payload};

/// A transactional memory cell.
pub struct TRef<A> {
    core: Arc<TRefCore>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for TRef<A> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for TRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TRef").field(&self.core.id()).finish()
    }
}

impl<A: Payload> TRef<A> {
    pub fn new(value: A) -> Self {
        Self {
            core: TRefCore::new(erase(value)),
            _marker: PhantomData,
        }
    }

    /// Allocate a ref as part of a transaction.
    pub fn make<E: Payload>(value: A) -> Stm<TRef<A>, E> {
        Stm::from_fn(move |_| Ok(TRef::new(value.clone())))
    }

    /// Allocate a ref from an effect.
    pub fn make_effect<E: Payload>(value: A) -> Effect<TRef<A>, E> {
        Effect::sync(move || TRef::new(value.clone()))
    }

    /// The last committed value, read outside of any transaction.
    ///
    /// # Panics
    ///
    /// Never in practice: the slot is only written through `TRef<A>`, so it
    /// always holds an `A`. Inside transactions a mismatch is a defect.
    pub fn committed(&self) -> A {
        match unerase::<A>(self.core.committed()) {
            Ok(value) => value,
            Err(defect) => unreachable!("TRef slot holds a foreign type: {defect}"),
        }
    }

    pub(crate) fn read<E>(&self, journal: &mut Journal) -> Result<A, Abort<E>> {
        let value = journal.read(&self.core)?;
        unerase::<A>(value).map_err(Abort::Die)
    }

    pub(crate) fn write(&self, journal: &mut Journal, value: A) {
        journal.write(&self.core, erase(value));
    }

    pub fn get<E: Payload>(&self) -> Stm<A, E> {
        let this = self.clone();
        Stm::from_fn(move |journal| this.read(journal))
    }

    pub fn set<E: Payload>(&self, value: A) -> Stm<(), E> {
        let this = self.clone();
        Stm::from_fn(move |journal| {
            this.write(journal, value.clone());
            Ok(())
        })
    }

    /// Set a new value computed from the current one and return `B`.
    pub fn modify<B: Payload, E: Payload>(
        &self,
        f: impl Fn(A) -> (B, A) + Send + Sync + 'static,
    ) -> Stm<B, E> {
        let this = self.clone();
        Stm::from_fn(move |journal| {
            let (out, next) = f(this.read::<E>(journal)?);
            this.write(journal, next);
            Ok(out)
        })
    }

    pub fn update<E: Payload>(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Stm<(), E> {
        self.modify(move |a| ((), f(a)))
    }

    pub fn get_and_set<E: Payload>(&self, value: A) -> Stm<A, E> {
        self.modify(move |old| (old, value.clone()))
    }

    pub fn get_and_update<E: Payload>(
        &self,
        f: impl Fn(A) -> A + Send + Sync + 'static,
    ) -> Stm<A, E> {
        self.modify(move |old| {
            let next = f(old.clone());
            (old, next)
        })
    }

    pub fn update_and_get<E: Payload>(
        &self,
        f: impl Fn(A) -> A + Send + Sync + 'static,
    ) -> Stm<A, E> {
        self.modify(move |old| {
            let next = f(old);
            (next.clone(), next)
        })
    }
}

#[cfg(test)]
mod tests {
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

    #[test]
    fn update_variants() {
        let rt = runtime();
        let r = TRef::new(10);
        let tx: Stm<(i32, i32, i32)> = r
            .get_and_update(|n| n + 1)
            .zip(r.update_and_get(|n| n * 2))
            .zip_with(r.get_and_set(0), |(a, b), c| (a, b, c));
        assert_eq!(rt.run(tx.commit()), Exit::succeed((10, 22, 22)));
        assert_eq!(r.committed(), 0);
    }

    #[test]
    fn modify_returns_output() {
        let rt = runtime();
        let r = TRef::new(vec![1, 2, 3]);
        let tx: Stm<Option<i32>> = r.modify(|mut v| {
            let last = v.pop();
            (last, v)
        });
        assert_eq!(rt.run(tx.commit()), Exit::succeed(Some(3)));
        assert_eq!(r.committed(), vec![1, 2]);
    }

    #[test]
    fn ref_made_in_transaction_is_usable() {
        let rt = runtime();
        let tx: Stm<i32> = TRef::make(4).flat_map(|r: TRef<i32>| r.update(|n| n + 1).and_then(r.get()));
        assert_eq!(rt.run(tx.commit()), Exit::succeed(5));
    }
}
