//! Bounded FIFO with drop-oldest overflow and timed waits
//!
//! Used for the per-kind response queues on the application side and for the
//! worker job queues on the hardware side. Pushing never blocks: a full queue
//! sheds its oldest entry and hands it back so the caller can log or answer it.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Why a wait ended without an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Nothing arrived before the deadline
    #[error("timed out")]
    TimedOut,
    /// The queue was closed and is empty
    #[error("queue closed")]
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

/// Bounded multi-producer, multi-consumer FIFO
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item, evicting the oldest one if the queue is full
    ///
    /// Returns the evicted item, or the pushed item itself if the queue has
    /// been closed.
    pub fn push(&self, item: T) -> Option<T> {
        let mut state = self.lock();
        if state.closed {
            return Some(item);
        }

        let evicted = if state.items.len() >= self.capacity {
            state.dropped += 1;
            tracing::warn!(
                queue = self.name,
                capacity = self.capacity,
                dropped = state.dropped,
                "queue full, dropping oldest entry"
            );
            state.items.pop_front()
        } else {
            None
        };

        state.items.push_back(item);
        drop(state);
        self.ready.notify_all();
        evicted
    }

    /// Remove the oldest item, waiting up to `timeout`
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::TimedOut`] when nothing arrives in time, or
    /// [`QueueError::Closed`] once the queue is closed and drained
    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, QueueError> {
        self.pop_where(timeout, |_| true)
    }

    /// Remove the oldest item matching `pred`, waiting up to `timeout`
    ///
    /// Non-matching items stay queued in order for other waiters.
    ///
    /// # Errors
    ///
    /// Same as [`Self::pop_timeout`]
    pub fn pop_where(
        &self,
        timeout: Duration,
        mut pred: impl FnMut(&T) -> bool,
    ) -> Result<T, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            if let Some(pos) = state.items.iter().position(&mut pred) {
                if let Some(item) = state.items.remove(pos) {
                    return Ok(item);
                }
            }
            if state.closed {
                return Err(QueueError::Closed);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(QueueError::TimedOut);
            }

            state = self
                .ready
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Remove the oldest item without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Remove and return every queued item, oldest first
    pub fn drain(&self) -> Vec<T> {
        self.lock().items.drain(..).collect()
    }

    /// Refuse further pushes and wake all waiters
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    /// Reopen a closed queue
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items evicted by overflow since creation
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}
