//! # Connection Statistics
//!
//! Provide lightweight counters for request volume, in-flight depth and
//! cache effectiveness.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Use atomic counters to aggregate events cheaply.
//! 2. **Zero-Cost Access**: Expose snapshots as plain structs without heap work.

use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of connection counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Commands written to the socket (a batch counts each command).
    pub requests_total: u64,
    /// Commands written but not yet answered.
    pub inflight: u64,
    /// Cached reads served without I/O.
    pub cache_hits: u64,
    /// Cached reads that went to the network.
    pub cache_misses: u64,
    /// Cache entries dropped by invalidation pushes.
    pub invalidations: u64,
    /// Connections that went down because of I/O or framing errors.
    pub failures: u64,
}

impl Add for StatsSnapshot {
    type Output = StatsSnapshot;

    fn add(self, other: StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            requests_total: self.requests_total + other.requests_total,
            inflight: self.inflight + other.inflight,
            cache_hits: self.cache_hits + other.cache_hits,
            cache_misses: self.cache_misses + other.cache_misses,
            invalidations: self.invalidations + other.invalidations,
            failures: self.failures + other.failures,
        }
    }
}

/// Thread-safe counters for one connection.
///
/// `Ordering::Relaxed` is sufficient: readers only need eventually
/// consistent totals, never cross-field ordering.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    requests_total: AtomicU64,
    inflight: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    invalidations: AtomicU64,
    failures: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `n` commands handed to the socket.
    pub fn record_sent(&self, n: u64) {
        self.requests_total.fetch_add(n, Ordering::Relaxed);
        self.inflight.fetch_add(n, Ordering::Relaxed);
    }

    /// Records one reply matched to its request.
    pub fn record_reply(&self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Records `n` requests dropped without a reply.
    pub fn record_abandoned(&self, n: u64) {
        self.inflight.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, n: u64) {
        self.invalidations.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of commands currently awaiting replies.
    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflight_tracks_sent_and_replied() {
        let stats = ConnectionStats::new();
        stats.record_sent(3);
        stats.record_reply();
        stats.record_abandoned(1);
        let snap = stats.snapshot();
        assert_eq!(snap.requests_total, 3);
        assert_eq!(snap.inflight, 1);
    }

    #[test]
    fn snapshots_add_up() {
        let a = StatsSnapshot { cache_hits: 2, ..Default::default() };
        let b = StatsSnapshot { cache_hits: 3, failures: 1, ..Default::default() };
        let sum = a + b;
        assert_eq!(sum.cache_hits, 5);
        assert_eq!(sum.failures, 1);
    }
}
