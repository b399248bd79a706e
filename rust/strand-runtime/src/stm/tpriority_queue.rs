use std::fmt;

use super::{Abort, Stm, TRef};
use crate::effect::Payload;

/// A transactional priority queue; `take` yields the smallest item first.
/// Items that compare equal come out in insertion order.
pub struct TPriorityQueue<A> {
    items: TRef<Vec<A>>,
}

impl<A> Clone for TPriorityQueue<A> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<A> fmt::Debug for TPriorityQueue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TPriorityQueue").field("items", &self.items).finish()
    }
}

fn insert_sorted<A: Ord>(items: &mut Vec<A>, item: A) {
    let at = items.partition_point(|existing| existing <= &item);
    items.insert(at, item);
}

impl<A: Payload + Ord> TPriorityQueue<A> {
    pub fn new() -> Self {
        Self::from_items(Vec::new())
    }

    pub fn from_items(items: impl IntoIterator<Item = A>) -> Self {
        let mut sorted = Vec::new();
        for item in items {
            insert_sorted(&mut sorted, item);
        }
        Self {
            items: TRef::new(sorted),
        }
    }

    pub fn make<E: Payload>() -> Stm<Self, E> {
        Stm::from_fn(|_| Ok(TPriorityQueue::new()))
    }

    pub fn offer<E: Payload>(&self, item: A) -> Stm<(), E> {
        self.items.update(move |mut items| {
            insert_sorted(&mut items, item.clone());
            items
        })
    }

    pub fn offer_all<E: Payload>(&self, new: Vec<A>) -> Stm<(), E> {
        self.items.update(move |mut items| {
            for item in new.iter().cloned() {
                insert_sorted(&mut items, item);
            }
            items
        })
    }

    /// Remove the smallest item, retrying while the queue is empty.
    pub fn take<E: Payload>(&self) -> Stm<A, E> {
        let items = self.items.clone();
        Stm::from_fn(move |journal| {
            let mut all = items.read::<E>(journal)?;
            if all.is_empty() {
                return Err(Abort::Retry);
            }
            let first = all.remove(0);
            items.write(journal, all);
            Ok(first)
        })
    }

    pub fn take_option<E: Payload>(&self) -> Stm<Option<A>, E> {
        self.items.modify(|mut items| {
            if items.is_empty() {
                (None, items)
            } else {
                let first = items.remove(0);
                (Some(first), items)
            }
        })
    }

    /// Remove up to `n` of the smallest items without retrying.
    pub fn take_up_to<E: Payload>(&self, n: usize) -> Stm<Vec<A>, E> {
        self.items.modify(move |mut items| {
            let rest = items.split_off(n.min(items.len()));
            (items, rest)
        })
    }

    pub fn take_all<E: Payload>(&self) -> Stm<Vec<A>, E> {
        self.items.modify(|items| (items, Vec::new()))
    }

    /// The smallest item without removing it, retrying while empty.
    pub fn peek<E: Payload>(&self) -> Stm<A, E> {
        self.peek_option().flat_map(|first| match first {
            Some(item) => Stm::succeed(item),
            None => Stm::retry(),
        })
    }

    pub fn peek_option<E: Payload>(&self) -> Stm<Option<A>, E> {
        self.items.get().map(|items| items.first().cloned())
    }

    pub fn retain<E: Payload>(&self, keep: impl Fn(&A) -> bool + Send + Sync + 'static) -> Stm<(), E> {
        self.items.update(move |mut items| {
            items.retain(|item| keep(item));
            items
        })
    }

    pub fn size<E: Payload>(&self) -> Stm<usize, E> {
        self.items.get().map(|items| items.len())
    }

    pub fn is_empty<E: Payload>(&self) -> Stm<bool, E> {
        self.size().map(|n| n == 0)
    }

    /// Items in priority order.
    pub fn to_vec<E: Payload>(&self) -> Stm<Vec<A>, E> {
        self.items.get()
    }
}

impl<A: Payload + Ord> Default for TPriorityQueue<A> {
    fn default() -> Self {
        Self::new()
    }
}
