//! Signaling session counters
//!
//! Atomic counters so the I/O thread, signal senders and the application can
//! all touch them without taking the queue lock.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one signaling session
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Sockets opened toward the signaling server (counter)
    pub connect_attempts: AtomicU64,
    /// Frames fully written to the socket (counter)
    pub frames_sent: AtomicU64,
    /// Well-formed frames handed to the engine (counter)
    pub frames_received: AtomicU64,
    /// Inbound lines dropped as malformed (counter)
    pub frames_malformed: AtomicU64,
    /// Outgoing frames discarded by queue eviction (counter)
    pub frames_evicted: AtomicU64,
    /// Raw bytes read from the socket (counter)
    pub bytes_received: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
            frames_evicted: self.frames_evicted.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub connect_attempts: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_malformed: u64,
    pub frames_evicted: u64,
    pub bytes_received: u64,
}
