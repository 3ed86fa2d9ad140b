//! A bounded, async-aware, multi-producer/multi-consumer FIFO queue.
//!
//! Used for the master session's send/recv queues, the engine's log
//! queue, and each client connection's inbound/outbound queues.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

const DEFAULT_CAPACITY: usize = 4096;

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
    closed: std::sync::atomic::AtomicBool,
}

/// FIFO queue with a fixed capacity. `enqueue` suspends while full,
/// `dequeue` suspends while empty; both wake waiters on state change.
#[derive(Clone)]
pub struct BoundedQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::new()),
                capacity,
                not_empty: Notify::new(),
                not_full: Notify::new(),
                closed: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    pub async fn enqueue(&self, value: T) {
        loop {
            {
                let mut items = self.inner.items.lock().await;
                if items.len() < self.inner.capacity {
                    items.push_back(value);
                    self.inner.not_empty.notify_one();
                    return;
                }
            }
            self.inner.not_full.notified().await;
        }
    }

    /// Suspends until an item is available or the queue is closed and
    /// drained, in which case it returns `None`.
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            {
                let mut items = self.inner.items.lock().await;
                if let Some(value) = items.pop_front() {
                    self.inner.not_full.notify_one();
                    return Some(value);
                }
                if self.inner.closed.load(std::sync::atomic::Ordering::Acquire) {
                    return None;
                }
            }
            self.inner.not_empty.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.items.lock().await.len()
    }

    /// Idempotent. Wakes every blocked `dequeue` so it can observe
    /// shutdown; items already queued are still returned before `None`.
    pub fn close(&self) {
        self.inner
            .closed
            .store(true, std::sync::atomic::Ordering::Release);
        self.inner.not_empty.notify_waiters();
    }
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue = BoundedQueue::new(8);
        for i in 0..5 {
            queue.enqueue(i).await;
        }
        for i in 0..5 {
            assert_eq!(queue.dequeue().await, Some(i));
        }
    }

    #[tokio::test]
    async fn enqueue_blocks_when_full_then_unblocks() {
        let queue = BoundedQueue::new(1);
        queue.enqueue(1).await;

        let queue2 = queue.clone();
        let mut enqueue_second = tokio_test::task::spawn(async move {
            queue2.enqueue(2).await;
        });
        tokio_test::assert_pending!(enqueue_second.poll());

        assert_eq!(queue.dequeue().await, Some(1));
        tokio_test::assert_ready!(enqueue_second.poll());
        assert_eq!(queue.dequeue().await, Some(2));
    }

    #[tokio::test]
    async fn close_wakes_blocked_dequeue() {
        let queue: BoundedQueue<i32> = BoundedQueue::new(4);
        let queue2 = queue.clone();
        let handle = tokio::spawn(async move { queue2.dequeue().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn closed_queue_still_drains_pending_items() {
        let queue = BoundedQueue::new(4);
        queue.enqueue(42).await;
        queue.close();
        assert_eq!(queue.dequeue().await, Some(42));
        assert_eq!(queue.dequeue().await, None);
    }
}
