//! Upcoming Crash Point Queue
//!
//! FIFO look-ahead of pre-generated crash points. The head is consumed when a
//! countdown begins; the remainder is visible to privileged observers only.

use std::collections::VecDeque;
use thiserror::Error;

use crate::core::amount::Multiplier;
use crate::game::crash_point::CrashPointSource;

/// Queue errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Dequeue on an empty queue (`ensure` was not called first).
    #[error("upcoming crash point queue is empty")]
    EmptyQueue,
}

/// Ordered buffer of pre-generated crash points.
#[derive(Debug, Clone, Default)]
pub struct UpcomingQueue {
    points: VecDeque<Multiplier>,
}

impl UpcomingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Top up to `target_len` from `source`.
    pub fn ensure(&mut self, target_len: usize, source: &mut dyn CrashPointSource) {
        while self.points.len() < target_len {
            self.points.push_back(source.generate());
        }
    }

    /// Pop the head.
    pub fn dequeue_next(&mut self) -> Result<Multiplier, QueueError> {
        self.points.pop_front().ok_or(QueueError::EmptyQueue)
    }

    /// Copy of up to `limit` queued points, head first.
    pub fn preview(&self, limit: usize) -> Vec<Multiplier> {
        self.points.iter().take(limit).copied().collect()
    }

    /// Number of queued points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
