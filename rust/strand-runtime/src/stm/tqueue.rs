use std::collections::VecDeque;
use std::fmt;

use super::{Abort, Stm, TRef};
use crate::effect::Payload;

/// A transactional FIFO queue. When bounded, `offer` retries while full.
pub struct TQueue<A> {
    items: TRef<VecDeque<A>>,
    capacity: Option<usize>,
}

impl<A> Clone for TQueue<A> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            capacity: self.capacity,
        }
    }
}

impl<A> fmt::Debug for TQueue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TQueue")
            .field("items", &self.items)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<A: Payload> TQueue<A> {
    pub fn bounded(capacity: usize) -> Self {
        Self {
            items: TRef::new(VecDeque::new()),
            capacity: Some(capacity.max(1)),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            items: TRef::new(VecDeque::new()),
            capacity: None,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn offer<E: Payload>(&self, item: A) -> Stm<(), E> {
        let items = self.items.clone();
        let capacity = self.capacity;
        Stm::from_fn(move |journal| {
            let mut queue = items.read::<E>(journal)?;
            if capacity.is_some_and(|cap| queue.len() >= cap) {
                return Err(Abort::Retry);
            }
            queue.push_back(item.clone());
            items.write(journal, queue);
            Ok(())
        })
    }

    /// Remove the oldest item, retrying while the queue is empty.
    pub fn take<E: Payload>(&self) -> Stm<A, E> {
        let items = self.items.clone();
        Stm::from_fn(move |journal| {
            let mut queue = items.read::<E>(journal)?;
            let Some(first) = queue.pop_front() else {
                return Err(Abort::Retry);
            };
            items.write(journal, queue);
            Ok(first)
        })
    }

    pub fn poll<E: Payload>(&self) -> Stm<Option<A>, E> {
        self.items.modify(|mut queue| (queue.pop_front(), queue))
    }

    pub fn take_all<E: Payload>(&self) -> Stm<Vec<A>, E> {
        self.items.modify(|queue| (queue.into(), VecDeque::new()))
    }

    pub fn size<E: Payload>(&self) -> Stm<usize, E> {
        self.items.get().map(|queue| queue.len())
    }

    pub fn is_empty<E: Payload>(&self) -> Stm<bool, E> {
        self.size().map(|n| n == 0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cause::Exit;
    use crate::config::RuntimeConfig;
    use crate::effect::Effect;
    use crate::runtime::Runtime;

    fn runtime() -> Runtime {
        Runtime::with_config(RuntimeConfig {
            workers: 2,
            ..RuntimeConfig::default()
        })
        .expect("runtime")
    }

    #[test]
    fn fifo_order() {
        let rt = runtime();
        let queue = TQueue::unbounded();
        let tx: Stm<(i32, Vec<i32>)> = queue
            .offer(1)
            .and_then(queue.offer(2))
            .and_then(queue.offer(3))
            .and_then(queue.take())
            .zip(queue.take_all());
        assert_eq!(rt.run(tx.commit()), Exit::succeed((1, vec![2, 3])));
    }

    #[test]
    fn full_queue_blocks_offerer() {
        let rt = runtime();
        let queue = TQueue::bounded(1);
        let producer: Effect<()> = queue.offer(1).commit().and_then(queue.offer(2).commit());
        let consumer = queue.clone();
        let program = producer.fork().flat_map(move |fiber| {
            let consumer = consumer.clone();
            Effect::<()>::sleep(Duration::from_millis(20))
                .and_then(fiber.poll())
                .map(|polled| polled.is_none())
                .zip(consumer.take().commit())
                .zip_left(fiber.join())
                .zip(consumer.take().commit())
        });
        assert_eq!(rt.run(program), Exit::succeed(((true, 1), 2)));
    }
}
