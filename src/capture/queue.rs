//! Handoff queue between the producer and consumer stages

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

/// Unbounded FIFO guarded by a mutex
///
/// Neither `push` nor `try_pop` ever waits for the other side; callers that
/// need to wait poll.
#[derive(Debug)]
pub struct HandoffQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> HandoffQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panic while holding the lock leaves the deque itself intact.
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, item: T) {
        self.lock().push_back(item);
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes every queued item, oldest first
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = HandoffQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.drain(), vec![3]);
        assert!(queue.is_empty());
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_concurrent_producer_consumer_preserves_order() {
        let queue = Arc::new(HandoffQueue::new());
        let producer_queue = Arc::clone(&queue);

        let producer = thread::spawn(move || {
            for i in 0..10_000u32 {
                producer_queue.push(i);
            }
        });

        let mut received = Vec::with_capacity(10_000);
        while received.len() < 10_000 {
            match queue.try_pop() {
                Some(item) => received.push(item),
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();

        assert!(received.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
