#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **mycel-queue** – Bounded single-consumer FIFO task queues.
//!
//! Each agent owns one queue per logical pipeline (`analysis`, `import`,
//! `staking`, ...). A queue is a strict FIFO with a fixed capacity: enqueue
//! at capacity fails with [`QueueError::Full`] and the caller decides whether
//! to drop or back off. Dequeue hands out a [`Lease`] marking the task
//! in-flight; at most one lease is outstanding at a time, which confines
//! mutation of agent-owned state to a single task per queue. Dropping a
//! lease without calling [`Lease::done`] requeues the task at the head, so a
//! panicking worker iteration never loses work.
//!
//! Draining: [`TaskQueue::close`] refuses further enqueues with
//! [`QueueError::Closed`] while existing items remain dequeueable; once the
//! queue is empty, `dequeue` returns `None`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use mycel_types::ErrorCode;

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Queue capacity and lifecycle violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue is at capacity.
    #[error("queue '{queue}' full ({capacity} tasks)")]
    Full {
        /// Queue name.
        queue: String,
        /// Configured capacity.
        capacity: usize,
    },
    /// The queue is draining or closed.
    #[error("queue '{queue}' closed")]
    Closed {
        /// Queue name.
        queue: String,
    },
}

impl QueueError {
    /// Stable error code for the fabric response vocabulary.
    pub fn code(&self) -> ErrorCode {
        match self {
            QueueError::Full { .. } => ErrorCode::QueueFull,
            QueueError::Closed { .. } => ErrorCode::QueueClosed,
        }
    }
}

//─────────────────────────────
//  Queue
//─────────────────────────────

struct QueueInner<T> {
    items: VecDeque<T>,
    in_flight: bool,
    closed: bool,
}

struct Shared<T> {
    name: String,
    capacity: usize,
    inner: Mutex<QueueInner<T>>,
    notify: Notify,
}

/// Bounded single-consumer FIFO queue.
///
/// Cloning shares the same underlying queue; producers clone freely, but the
/// lease discipline still admits only one in-flight task at a time.
pub struct TaskQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> std::fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

impl<T> TaskQueue<T> {
    /// Create a queue named `name` holding at most `capacity` tasks.
    pub fn bounded(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                capacity: capacity.max(1),
                inner: Mutex::new(QueueInner {
                    items: VecDeque::new(),
                    in_flight: false,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of queued tasks (excluding the in-flight one).
    pub fn depth(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether drain has begun.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Append a task at the tail.
    ///
    /// Fails with [`QueueError::Full`] at capacity and [`QueueError::Closed`]
    /// once drain has begun; the task is handed back in either case.
    pub fn enqueue(&self, task: T) -> Result<(), (T, QueueError)> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err((task, QueueError::Closed { queue: self.shared.name.clone() }));
            }
            if inner.items.len() >= self.shared.capacity {
                return Err((
                    task,
                    QueueError::Full {
                        queue: self.shared.name.clone(),
                        capacity: self.shared.capacity,
                    },
                ));
            }
            inner.items.push_back(task);
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Pop the next task, waiting until one is available and no lease is
    /// outstanding. Returns `None` once the queue is closed and empty.
    pub async fn dequeue(&self) -> Option<Lease<T>> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut inner = self.lock();
                if !inner.in_flight {
                    if let Some(task) = inner.items.pop_front() {
                        inner.in_flight = true;
                        return Some(Lease {
                            shared: Arc::clone(&self.shared),
                            task: Some(task),
                        });
                    }
                    if inner.closed {
                        return None;
                    }
                }
            }
            notified.await;
        }
    }

    /// Pop the next task without waiting.
    ///
    /// Returns `None` when the queue is empty or a lease is outstanding.
    pub fn try_dequeue(&self) -> Option<Lease<T>> {
        let mut inner = self.lock();
        if inner.in_flight {
            return None;
        }
        let task = inner.items.pop_front()?;
        inner.in_flight = true;
        Some(Lease {
            shared: Arc::clone(&self.shared),
            task: Some(task),
        })
    }

    /// Begin draining: further enqueues fail, queued tasks remain dequeueable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner<T>> {
        // Lock poisoning only happens if a holder panicked; the queue state
        // itself is still consistent, so continue with the inner value.
        match self.shared.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

//─────────────────────────────
//  Lease
//─────────────────────────────

/// An in-flight task popped from a queue.
///
/// Call [`Lease::done`] after processing; dropping the lease without it
/// requeues the task at the head for redelivery.
pub struct Lease<T> {
    shared: Arc<Shared<T>>,
    task: Option<T>,
}

impl<T> Lease<T> {
    /// Borrow the leased task.
    pub fn task(&self) -> &T {
        self.task.as_ref().expect("lease task taken")
    }

    /// Mark the task complete, releasing the in-flight slot.
    pub fn done(mut self) -> T {
        let task = self.task.take().expect("lease task taken");
        self.release(None);
        task
    }

    fn release(&mut self, requeue: Option<T>) {
        {
            let mut inner = match self.shared.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(task) = requeue {
                inner.items.push_front(task);
            }
            inner.in_flight = false;
        }
        self.shared.notify.notify_waiters();
    }
}

impl<T> std::ops::Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.task()
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.release(Some(task));
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("task", &self.task).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue = TaskQueue::bounded("analysis", 8);
        for task in ["a", "b", "c"] {
            queue.enqueue(task).unwrap();
        }
        for expected in ["a", "b", "c"] {
            let lease = queue.dequeue().await.unwrap();
            assert_eq!(*lease.task(), expected);
            lease.done();
        }
    }

    #[tokio::test]
    async fn enqueue_at_capacity_fails_full() {
        let queue = TaskQueue::bounded("analysis", 3);
        queue.enqueue("a").unwrap();
        queue.enqueue("b").unwrap();
        queue.enqueue("c").unwrap();

        let (task, err) = queue.enqueue("d").unwrap_err();
        assert_eq!(task, "d");
        assert_eq!(err, QueueError::Full { queue: "analysis".to_string(), capacity: 3 });
        assert_eq!(err.code(), ErrorCode::QueueFull);

        // Consumer pops exactly a, b, c with no duplicates.
        let mut seen = Vec::new();
        while let Some(lease) = queue.try_dequeue() {
            seen.push(*lease.task());
            lease.done();
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn close_refuses_enqueue_but_drains() {
        let queue = TaskQueue::bounded("import", 4);
        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();
        queue.close();

        let (_, err) = queue.enqueue(3).unwrap_err();
        assert_eq!(err.code(), ErrorCode::QueueClosed);

        assert_eq!(queue.dequeue().await.unwrap().done(), 1);
        assert_eq!(queue.dequeue().await.unwrap().done(), 2);
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn at_most_one_lease_outstanding() {
        let queue = TaskQueue::bounded("export", 4);
        queue.enqueue("a").unwrap();
        queue.enqueue("b").unwrap();

        let first = queue.try_dequeue().unwrap();
        assert!(queue.try_dequeue().is_none());
        first.done();
        assert_eq!(*queue.try_dequeue().unwrap().task(), "b");
    }

    #[tokio::test]
    async fn dropped_lease_requeues_at_head() {
        let queue = TaskQueue::bounded("staking", 4);
        queue.enqueue("a").unwrap();
        queue.enqueue("b").unwrap();

        let lease = queue.dequeue().await.unwrap();
        assert_eq!(*lease.task(), "a");
        drop(lease); // processing failed; task goes back to the head

        assert_eq!(queue.dequeue().await.unwrap().done(), "a");
        assert_eq!(queue.dequeue().await.unwrap().done(), "b");
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue() {
        let queue = TaskQueue::bounded("reward", 4);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await.map(Lease::done) })
        };
        tokio::task::yield_now().await;
        queue.enqueue(42).unwrap();
        assert_eq!(consumer.await.unwrap(), Some(42));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn n_enqueues_then_n_dequeues_match_order(tasks in proptest::collection::vec(0u32..1000, 0..64)) {
                let queue = TaskQueue::bounded("prop", 64);
                for task in &tasks {
                    queue.enqueue(*task).unwrap();
                }
                let mut drained = Vec::new();
                while let Some(lease) = queue.try_dequeue() {
                    drained.push(lease.done());
                }
                prop_assert_eq!(drained, tasks);
            }
        }
    }
}
