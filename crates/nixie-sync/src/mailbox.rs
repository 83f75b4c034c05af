//! Bounded FIFO mailbox with configurable overflow behaviour.
//!
//! TigerStyle: explicit capacity, explicit overflow policy, no silent
//! drops without a counter.
//!
//! One mutex guards the queue; two condvars signal data and space. Producers
//! under the `Block` policy park on the space condvar; consumers park on the
//! data condvar with an optional timeout. `stop` wakes every waiter exactly
//! once and stays sticky: pushes fail immediately, pops keep draining until
//! the queue is empty and only then report stopped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use nixie_core::constants::{MAILBOX_CAPACITY_DEFAULT, MAILBOX_CAPACITY_MAX};

/// What to do with a push when the mailbox is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait until space is available or the mailbox is stopped
    Block,
    /// Reject the new item
    DropNewest,
    /// Evict the head, then enqueue the new item
    DropOldest,
    /// Evict from the head until below capacity, then enqueue
    Compact,
}

/// Why a push did not enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// At capacity under `DropNewest`; the item was rejected
    Full { depth: usize, limit: usize },
    /// The mailbox was stopped
    Stopped,
}

/// Why a pop returned no item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// The timeout elapsed with the queue still empty
    TimedOut,
    /// The mailbox was stopped and is fully drained
    Stopped,
}

struct Inner<T> {
    queue: VecDeque<T>,
    stopped: bool,
}

/// Bounded multi-producer multi-consumer mailbox
pub struct Mailbox<T> {
    inner: Mutex<Inner<T>>,
    data_cond: Condvar,
    space_cond: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
    /// Total items accepted
    enqueued_count: AtomicU64,
    /// Total items evicted or rejected by the overflow policy
    dropped_count: AtomicU64,
}

impl<T> Mailbox<T> {
    /// Create a mailbox with the default capacity and `Block` policy
    pub fn new() -> Self {
        Self::with_capacity(MAILBOX_CAPACITY_DEFAULT, OverflowPolicy::Block)
    }

    /// Create a mailbox with an explicit capacity and policy
    pub fn with_capacity(capacity: usize, policy: OverflowPolicy) -> Self {
        debug_assert!(capacity > 0, "capacity must be positive");
        debug_assert!(
            capacity <= MAILBOX_CAPACITY_MAX,
            "capacity exceeds MAILBOX_CAPACITY_MAX"
        );

        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                stopped: false,
            }),
            data_cond: Condvar::new(),
            space_cond: Condvar::new(),
            capacity,
            policy,
            enqueued_count: AtomicU64::new(0),
            dropped_count: AtomicU64::new(0),
        }
    }

    /// Enqueue an item, applying the overflow policy at capacity.
    pub fn push(&self, item: T) -> Result<(), PushError> {
        let mut inner = self.inner.lock();

        if inner.stopped {
            return Err(PushError::Stopped);
        }

        if inner.queue.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Block => {
                    while inner.queue.len() >= self.capacity && !inner.stopped {
                        self.space_cond.wait(&mut inner);
                    }
                    if inner.stopped {
                        return Err(PushError::Stopped);
                    }
                }
                OverflowPolicy::DropNewest => {
                    self.dropped_count.fetch_add(1, Ordering::Relaxed);
                    return Err(PushError::Full {
                        depth: inner.queue.len(),
                        limit: self.capacity,
                    });
                }
                OverflowPolicy::DropOldest => {
                    inner.queue.pop_front();
                    self.dropped_count.fetch_add(1, Ordering::Relaxed);
                }
                OverflowPolicy::Compact => {
                    while inner.queue.len() >= self.capacity {
                        inner.queue.pop_front();
                        self.dropped_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        inner.queue.push_back(item);
        self.enqueued_count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(inner.queue.len() <= self.capacity);

        drop(inner);
        self.data_cond.notify_one();
        Ok(())
    }

    /// Pop the head, waiting up to `timeout` for an item.
    ///
    /// A zero timeout waits indefinitely. After `stop`, remaining items are
    /// still handed out; `Stopped` is returned only once the queue is empty.
    pub fn wait_and_pop(&self, timeout: Duration) -> Result<T, PopError> {
        let mut inner = self.inner.lock();

        if timeout.is_zero() {
            while inner.queue.is_empty() && !inner.stopped {
                self.data_cond.wait(&mut inner);
            }
        } else {
            let deadline = Instant::now() + timeout;
            while inner.queue.is_empty() && !inner.stopped {
                if self.data_cond.wait_until(&mut inner, deadline).timed_out() {
                    // An item may have landed between wake-up and lock
                    // reacquisition; only report timeout on a truly empty queue.
                    if inner.queue.is_empty() && !inner.stopped {
                        return Err(PopError::TimedOut);
                    }
                    break;
                }
            }
        }

        match inner.queue.pop_front() {
            Some(item) => {
                drop(inner);
                self.space_cond.notify_one();
                Ok(item)
            }
            None => {
                debug_assert!(inner.stopped);
                Err(PopError::Stopped)
            }
        }
    }

    /// Pop the head without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let item = inner.queue.pop_front();
        if item.is_some() {
            drop(inner);
            self.space_cond.notify_one();
        }
        item
    }

    /// Stop the mailbox: wake all waiters, fail further pushes.
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock();
            inner.stopped = true;
        }
        self.data_cond.notify_all();
        self.space_cond.notify_all();
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    /// Number of items currently queued
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured overflow policy
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Total items accepted since construction
    pub fn enqueued_count(&self) -> u64 {
        self.enqueued_count.load(Ordering::Relaxed)
    }

    /// Total items evicted or rejected since construction
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}
