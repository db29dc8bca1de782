//! Bounded hand-off between one producer thread and one consumer.
//!
//! The queue exists for backpressure, not buffering depth: a source runner
//! blocks in [`BoundedRecordQueue::put`] until the merge side has taken a
//! packet. Every wait is bounded by a timeout, and on each wake-up the
//! shared [`CancellationToken`] is consulted so an abort anywhere in the
//! pipeline unblocks all waiters within one timeout interval.

mod cancel;

pub use cancel::CancellationToken;

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};

use crate::Result;

/// Default interval between cancellation checks while blocked.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

struct QueueState<T> {
    items: VecDeque<T>,
    has_more: bool,
    closed: bool,
}

/// Fixed-capacity blocking queue with an explicit "more data coming" flag.
///
/// Safe for exactly one producer and one consumer operating concurrently.
pub struct BoundedRecordQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    timeout: Duration,
    token: CancellationToken,
}

impl<T> BoundedRecordQueue<T> {
    /// Create a queue holding at most `capacity` items (at least one).
    pub fn new(capacity: usize, token: CancellationToken) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                has_more: true,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            timeout: DEFAULT_WAIT_TIMEOUT,
            token,
        }
    }

    /// Override the interval between cancellation checks.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enqueue an item, blocking while the queue is full.
    ///
    /// `has_more == false` marks the final item. Returns `Ok(false)` without
    /// enqueuing when the queue has been closed.
    pub fn put(&self, item: T, has_more: bool) -> Result<bool> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Ok(false);
            }
            self.token.check()?;
            if state.items.len() < self.capacity {
                break;
            }
            self.not_full.wait_for(&mut state, self.timeout);
        }
        state.items.push_back(item);
        state.has_more = has_more;
        self.not_empty.notify_one();
        Ok(true)
    }

    /// Mark the stream finished without enqueuing anything further.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.has_more = false;
        self.not_empty.notify_all();
    }

    /// Remove the next item, blocking while empty and more data is expected.
    ///
    /// Returns `Ok(None)` once the producer has finished (or the queue was
    /// closed) and nothing is left.
    pub fn take(&self) -> Result<Option<T>> {
        let mut state = self.wait_for_item()?;
        let item = state.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        Ok(item)
    }

    /// Borrow the next item without removing it, blocking like [`take`](Self::take).
    ///
    /// The producer cannot enqueue while the returned guard is alive.
    pub fn peek(&self) -> Result<Option<MappedMutexGuard<'_, T>>> {
        let state = self.wait_for_item()?;
        Ok(MutexGuard::try_map(state, |state| state.items.front_mut()).ok())
    }

    fn wait_for_item(&self) -> Result<MutexGuard<'_, QueueState<T>>> {
        let mut state = self.state.lock();
        while state.items.is_empty() && state.has_more && !state.closed {
            self.token.check()?;
            self.not_empty.wait_for(&mut state, self.timeout);
        }
        Ok(state)
    }

    /// Close the queue, releasing every waiter permanently.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether the producer still intends to enqueue.
    pub fn has_more(&self) -> bool {
        self.state.lock().has_more
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> fmt::Debug for BoundedRecordQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BoundedRecordQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.items.len())
            .field("has_more", &state.has_more)
            .field("closed", &state.closed)
            .finish()
    }
}
