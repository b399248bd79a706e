//! Small shared state cells.
//!
//! Every piece of mutable state shared between fibers (fiber records, the
//! registry, deferred and mailbox state, transactional ref slots) lives in a
//! [`SyncCell`] and is only ever touched through [`SyncCell::modify`]: one
//! closure, applied atomically, never holding the cell across a suspension.

use parking_lot::{Mutex, MutexGuard};
use std::fmt;

pub(crate) struct SyncCell<T> {
    inner: Mutex<T>,
}

impl<T> SyncCell<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Apply `f` to the current value atomically and return its result.
    ///
    /// `f` must not block or call back into another fiber's cell that could
    /// in turn try to lock this one.
    pub(crate) fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Read-only access.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.inner.lock();
        f(&guard)
    }

    /// Raw guard, used by the STM commit which must hold several cells at
    /// once (always acquired in ascending ref id order).
    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}

#[cfg(test)]
impl<T: Clone> SyncCell<T> {
    pub(crate) fn get(&self) -> T {
        self.inner.lock().clone()
    }
}

impl<T: fmt::Debug> fmt::Debug for SyncCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(guard) => f.debug_tuple("SyncCell").field(&*guard).finish(),
            None => f.write_str("SyncCell(<locked>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn modify_returns_closure_result() {
        let cell = SyncCell::new(10);
        let old = cell.modify(|v| {
            let old = *v;
            *v += 5;
            old
        });
        assert_eq!(old, 10);
        assert_eq!(cell.get(), 15);
    }

    #[test]
    fn concurrent_modify_is_atomic() {
        let cell = Arc::new(SyncCell::new(0usize));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        cell.modify(|v| *v += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cell.get(), 8_000);
    }

    #[test]
    fn debug_shows_value() {
        let cell = SyncCell::new("x");
        assert_eq!(format!("{:?}", cell), "SyncCell(\"x\")");
    }
}
