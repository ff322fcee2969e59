//! Lightweight Prometheus-compatible metrics for the relay server.
//!
//! Atomic counters, shared with whoever holds an `Arc` (the integration tests
//! and the periodic summary log). Rendered in Prometheus text exposition
//! format into the `--metrics` file.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Relay counters
pub struct RelayMetrics {
    /// Connected clients (gauge)
    pub active_clients: AtomicU64,
    /// Greetings accepted (counter)
    pub registrations_total: AtomicU64,
    /// Frames forwarded to their destination (counter)
    pub frames_relayed_total: AtomicU64,
    /// Frames for destinations not registered, or evicted from a full
    /// send buffer (counter)
    pub frames_dropped_total: AtomicU64,
    /// Lines that failed to decode (counter)
    pub malformed_total: AtomicU64,
    /// Server start time (for uptime calculation)
    pub start_time: Instant,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            active_clients: AtomicU64::new(0),
            registrations_total: AtomicU64::new(0),
            frames_relayed_total: AtomicU64::new(0),
            frames_dropped_total: AtomicU64::new(0),
            malformed_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn dec(counter: &AtomicU64) {
        // Gauge never goes below zero
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// One-line summary for the periodic log
    pub fn summary(&self) -> String {
        format!(
            "clients={} registrations={} relayed={} dropped={} malformed={}",
            Self::get(&self.active_clients),
            Self::get(&self.registrations_total),
            Self::get(&self.frames_relayed_total),
            Self::get(&self.frames_dropped_total),
            Self::get(&self.malformed_total),
        )
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP rendezvous_active_clients Current number of connected signaling clients\n\
             # TYPE rendezvous_active_clients gauge\n\
             rendezvous_active_clients {}\n\
             # HELP rendezvous_registrations_total Total peer registrations\n\
             # TYPE rendezvous_registrations_total counter\n\
             rendezvous_registrations_total {}\n\
             # HELP rendezvous_frames_relayed_total Total signal frames relayed\n\
             # TYPE rendezvous_frames_relayed_total counter\n\
             rendezvous_frames_relayed_total {}\n\
             # HELP rendezvous_frames_dropped_total Total frames dropped (unregistered peer or full send buffer)\n\
             # TYPE rendezvous_frames_dropped_total counter\n\
             rendezvous_frames_dropped_total {}\n\
             # HELP rendezvous_malformed_total Total malformed lines\n\
             # TYPE rendezvous_malformed_total counter\n\
             rendezvous_malformed_total {}\n\
             # HELP rendezvous_uptime_seconds Server uptime in seconds\n\
             # TYPE rendezvous_uptime_seconds gauge\n\
             rendezvous_uptime_seconds {}\n",
            Self::get(&self.active_clients),
            Self::get(&self.registrations_total),
            Self::get(&self.frames_relayed_total),
            Self::get(&self.frames_dropped_total),
            Self::get(&self.malformed_total),
            uptime,
        )
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
