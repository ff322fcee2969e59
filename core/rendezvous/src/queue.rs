//! Bounded outgoing signal queue
//!
//! Framed lines wait here until the I/O thread can write them. Producers are
//! signal senders running on any thread; the single consumer is the session's
//! I/O thread. When the queue is full the oldest line is discarded: delivery
//! is best-effort, and stale signals are the ones the engine has most likely
//! already retried.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Default queue bound
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Result of handing one line to the drain sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Line fully written, remove it
    Sent,
    /// Socket buffer full, keep the line and stop draining
    WouldBlock,
}

/// FIFO of framed lines with oldest-drop eviction
pub struct OutgoingQueue {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl OutgoingQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        OutgoingQueue {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a line, evicting the oldest entries to stay within capacity.
    /// Returns how many lines were evicted.
    pub fn push(&self, line: String) -> usize {
        let mut lines = self.lock();
        let mut evicted = 0;
        while lines.len() >= self.capacity {
            lines.pop_front();
            evicted += 1;
        }
        lines.push_back(line);
        evicted
    }

    /// Hand lines to `sink` in FIFO order until it blocks or fails.
    ///
    /// A line leaves the queue only once the sink reports it [`SendOutcome::Sent`].
    /// Returns the number of lines sent; a sink error stops draining and is
    /// returned as-is.
    pub fn drain<F, E>(&self, mut sink: F) -> Result<usize, E>
    where
        F: FnMut(&str) -> Result<SendOutcome, E>,
    {
        let mut lines = self.lock();
        let mut sent = 0;
        while let Some(line) = lines.front() {
            match sink(line)? {
                SendOutcome::Sent => {
                    lines.pop_front();
                    sent += 1;
                }
                SendOutcome::WouldBlock => break,
            }
        }
        Ok(sent)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of the queued lines, oldest first
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    // Poison is ignored: entries are whole strings, never half-written.
    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for OutgoingQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
