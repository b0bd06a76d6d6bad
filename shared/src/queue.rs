//! Bounded FIFO queues between the device workers and the coordinator
//!
//! Producers never block: pushing onto a full queue applies the queue's
//! [`OverflowPolicy`] and hands back whatever was dropped so the caller can
//! log it. Consumers poll with [`BoundedQueue::try_pop`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Soft capacity used for the frame and timestamp queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// What to do when a push arrives at a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest element to make room
    #[default]
    DropOldest,
    /// Refuse the new element
    RejectNewest,
}

/// Result of a push
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    /// Element queued without loss
    Accepted,
    /// Element queued, the oldest element was evicted
    Evicted(T),
    /// Queue full, the new element was returned unqueued
    Rejected(T),
}

/// Mutex-protected FIFO with a fixed capacity.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// Create a queue
    ///
    /// # Panics
    /// Panics if capacity is 0
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "Queue capacity must be greater than 0");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append an element, applying the overflow policy if full.
    pub fn push(&self, item: T) -> PushOutcome<T> {
        let mut items = self.lock();
        let outcome = if items.len() < self.capacity {
            items.push_back(item);
            PushOutcome::Accepted
        } else {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    let evicted = items.pop_front();
                    items.push_back(item);
                    match evicted {
                        Some(old) => PushOutcome::Evicted(old),
                        None => PushOutcome::Accepted,
                    }
                }
                OverflowPolicy::RejectNewest => PushOutcome::Rejected(item),
            }
        };
        drop(items);

        if !matches!(outcome, PushOutcome::Accepted) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Remove the oldest element without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Remove every queued element, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Total elements lost to the overflow policy since creation
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        // A panicking holder cannot leave the deque half-modified
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
