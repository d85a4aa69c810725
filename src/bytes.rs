use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative byte counters for one session.
///
/// Updated concurrently by the HTTP facade, the resolver probe, and any
/// nettest that accounts for its own traffic. Unsigned arithmetic is
/// deliberate: transferring enough data to overflow wraps around instead
/// of invoking undefined behavior.
#[derive(Debug, Default)]
pub struct ByteCounters {
    bytes_down: AtomicU64,
    bytes_up: AtomicU64,
}

impl ByteCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit `n` bytes of received traffic.
    pub fn add_down(&self, n: u64) {
        self.bytes_down.fetch_add(n, Ordering::Relaxed);
    }

    /// Credit `n` bytes of sent traffic.
    pub fn add_up(&self, n: u64) {
        self.bytes_up.fetch_add(n, Ordering::Relaxed);
    }

    pub fn down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Received bytes in kilobytes, as reported by `status.end`.
    pub fn down_kb(&self) -> f64 {
        self.down() as f64 / 1024.0
    }

    /// Sent bytes in kilobytes, as reported by `status.end`.
    pub fn up_kb(&self) -> f64 {
        self.up() as f64 / 1024.0
    }
}
