//! Hand-off queue between the poll loop and the write loop.
//!
//! A FIFO of pending write requests guarded by one mutex. The capacity is
//! advisory sizing: enqueues past it are accepted and counted, never dropped.
//! The lock is only ever held for the queue operation itself, never across a
//! device read or a storage call.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::storage::Query;

/// Upper bound on the up-front allocation. The capacity is only advisory,
/// so larger queues grow on demand.
const MAX_PREALLOCATED: usize = 1024;

/// Statistics about queue operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Total number of requests enqueued
    pub enqueued: u64,

    /// Total number of requests dequeued
    pub dequeued: u64,

    /// Largest number of requests pending at once
    pub high_water: usize,

    /// Enqueues that found the queue at or past its advisory capacity
    pub over_capacity: u64,

    /// Number of times the queue lock was taken
    pub lock_acquisitions: u64,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<Query>,
    stats: QueueStats,
}

/// Mutex-guarded FIFO of write requests.
#[derive(Debug)]
pub struct HandoffQueue {
    state: Mutex<QueueState>,
    capacity: usize,
}

impl HandoffQueue {
    /// Create an empty queue sized for `capacity` requests.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::with_capacity(capacity.min(MAX_PREALLOCATED)),
                stats: QueueStats::default(),
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock cannot leave the deque torn
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.stats.lock_acquisitions += 1;
        state
    }

    /// Append a request. Never blocks beyond the lock and never fails.
    ///
    /// Returns the number of pending requests after the append.
    pub fn enqueue(&self, query: Query) -> usize {
        let mut state = self.lock();

        if state.pending.len() >= self.capacity {
            state.stats.over_capacity += 1;
            // Warn once per overflow episode, not on every enqueue
            if state.pending.len() == self.capacity {
                warn!(
                    capacity = self.capacity,
                    "Hand-off queue reached its capacity; writer is falling behind"
                );
            }
        }

        state.pending.push_back(query);
        state.stats.enqueued += 1;
        let len = state.pending.len();
        state.stats.high_water = state.stats.high_water.max(len);
        len
    }

    /// Remove the oldest request, if any.
    pub fn dequeue_one(&self) -> Option<Query> {
        let mut state = self.lock();
        let query = state.pending.pop_front();
        if query.is_some() {
            state.stats.dequeued += 1;
        }
        query
    }

    /// Remove every pending request, oldest first.
    pub fn try_dequeue_all(&self) -> Vec<Query> {
        let mut state = self.lock();
        let drained: Vec<Query> = state.pending.drain(..).collect();
        state.stats.dequeued += drained.len() as u64;
        drained
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether no request is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The advisory capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of queue statistics.
    pub fn stats(&self) -> QueueStats {
        self.lock().stats.clone()
    }
}
