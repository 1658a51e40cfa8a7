//! A thread-safe deque whose pops block precisely when it is empty,
//! built from a plain `VecDeque` and a counting semaphore.

use std::{collections::VecDeque, time::Duration};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

pub struct BlockingDeque<T> {
    items: Mutex<VecDeque<T>>,
    ready: Semaphore,
}

impl<T> Default for BlockingDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingDeque<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Semaphore::new(0),
        }
    }

    pub fn push_back(&self, item: T) {
        self.items.lock().push_back(item);
        self.ready.add_permits(1);
    }

    pub fn push_front(&self, item: T) {
        self.items.lock().push_front(item);
        self.ready.add_permits(1);
    }

    /// Pop the oldest item, waiting until one is available.
    pub async fn pop_front(&self) -> T {
        let permit = self
            .ready
            .acquire()
            .await
            .expect("deque semaphore is never closed");
        permit.forget();
        self.items
            .lock()
            .pop_front()
            .expect("permit guarantees an item")
    }

    /// Pop the oldest item, or `None` once `timeout` elapses first.
    pub async fn pop_front_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.pop_front()).await.ok()
    }

    /// Pop the oldest item only if one is immediately available.
    pub fn try_pop_front(&self) -> Option<T> {
        let permit = self.ready.try_acquire().ok()?;
        permit.forget();
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn push_unblocks_waiting_pop() {
        let deque = Arc::new(BlockingDeque::new());

        let waiter = {
            let deque = Arc::clone(&deque);
            tokio::spawn(async move { deque.pop_front().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        deque.push_back(42u32);

        assert_eq!(waiter.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn pops_are_fifo() {
        let deque = BlockingDeque::new();
        deque.push_back(1);
        deque.push_back(2);
        deque.push_front(0);

        assert_eq!(deque.pop_front().await, 0);
        assert_eq!(deque.pop_front().await, 1);
        assert_eq!(deque.pop_front().await, 2);
    }

    #[tokio::test]
    async fn timeout_pop_returns_none_when_empty() {
        let deque: BlockingDeque<u32> = BlockingDeque::new();
        assert_eq!(
            deque.pop_front_timeout(Duration::from_millis(10)).await,
            None
        );
    }

    #[tokio::test]
    async fn try_pop_does_not_block() {
        let deque = BlockingDeque::new();
        assert_eq!(deque.try_pop_front(), None::<u32>);
        deque.push_back(7);
        assert_eq!(deque.try_pop_front(), Some(7));
        assert!(deque.is_empty());
    }
}
