//! Bounded store for payloads that could not be decoded.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// Default number of dead letters kept before the oldest are evicted.
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1024;

/// A payload dropped from a queue or channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Identity whose queue or channel carried the payload.
    pub identity: String,
    /// The raw payload as received from the broker.
    pub payload: String,
    /// Why it was dropped.
    pub error: String,
}

/// Ring buffer of dead letters.
#[derive(Debug)]
pub struct DeadLetterSink {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl DeadLetterSink {
    /// Create a sink holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Record a dead letter, evicting the oldest entry when full.
    pub fn push(&self, letter: DeadLetter) {
        warn!(
            identity = %letter.identity,
            error = %letter.error,
            bytes = letter.payload.len(),
            "Dead-lettered payload"
        );

        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(letter);
    }

    /// Number of stored dead letters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the sink is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every stored dead letter, oldest first.
    pub fn drain_all(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

impl Default for DeadLetterSink {
    fn default() -> Self {
        Self::new(DEFAULT_DEAD_LETTER_CAPACITY)
    }
}
