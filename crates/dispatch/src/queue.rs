//! Thread-safe FIFO of pending connections
//!
//! The accept loop pushes raw connections; worker threads block on `pop`
//! until one is available. Each item is handed to exactly one caller. The
//! queue is unbounded: there is no depth limit and no backpressure in this
//! design, so a producer that outruns the workers grows the queue without
//! bound — callers who need backpressure must impose it upstream.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Unbounded blocking FIFO shared by all worker threads
pub struct ConnectionQueue<T> {
    inner: Mutex<QueueInner<T>>,
    ready: Condvar,
}

impl<T> ConnectionQueue<T> {
    /// Create an empty, open queue
    pub fn new() -> Self {
        ConnectionQueue {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Append an item and wake one blocked worker.
    ///
    /// Returns false when the queue is closed; the item is dropped.
    pub fn push(&self, item: T) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.items.push_back(item);
        }
        self.ready.notify_one();
        true
    }

    /// Block until an item is available and take it, or return `None` once
    /// the queue is closed and drained.
    ///
    /// Exactly one caller receives each item.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            self.ready.wait(&mut inner);
        }
    }

    /// Take an item only if one is immediately available.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Close the queue: further pushes are refused, blocked workers drain
    /// what remains and then receive `None`.
    pub fn close(&self) {
        // Flip the flag while holding the lock to prevent lost-wakeup:
        // a worker between its closed check and condvar wait holds this
        // lock, so acquiring it guarantees the worker either is already in
        // wait() (and our notify will wake it) or will re-check and see
        // closed == true.
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
        }
        self.ready.notify_all();
    }

    /// Whether the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of items waiting
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether no items are waiting
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }
}

impl<T> Default for ConnectionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
