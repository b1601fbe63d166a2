// Lock-free pipeline counters.
//
// Every component records into one shared StreamerStats; readers take a
// snapshot, which is plain data and serializable for logging.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StreamerStats {
    accepted: AtomicU64,
    dropped_after_close: AtomicU64,
    discarded: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    rejected: AtomicU64,
    replayed: AtomicU64,
}

impl StreamerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `put` was accepted while running.
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// A `put` arrived after shutdown began and was ignored.
    pub fn record_dropped_after_close(&self) {
        self.dropped_after_close.fetch_add(1, Ordering::Relaxed);
    }

    /// The queue evicted an entry to make room.
    pub fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self) {
        self.replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped_after_close: self.dropped_after_close.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
        }
    }
}

/// Immutable copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub dropped_after_close: u64,
    pub discarded: u64,
    pub delivered: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub rejected: u64,
    pub replayed: u64,
}

impl StatsSnapshot {
    /// Share of finished deliveries that succeeded (0.0 to 1.0).
    pub fn success_rate(&self) -> f64 {
        let finished = self.delivered + self.failed + self.rejected;
        if finished == 0 {
            return 1.0;
        }
        self.delivered as f64 / finished as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counters_from_many_threads() {
        let stats = Arc::new(StreamerStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_accepted();
                        stats.record_delivered();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.accepted, 8000);
        assert_eq!(snapshot.delivered, 8000);
        assert_eq!(snapshot.success_rate(), 1.0);
    }

    #[test]
    fn test_success_rate_counts_failures_and_rejections() {
        let stats = StreamerStats::new();
        stats.record_delivered();
        stats.record_failed();
        stats.record_rejected();
        stats.record_delivered();
        assert_eq!(stats.snapshot().success_rate(), 0.5);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = StreamerStats::new();
        stats.record_discarded();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["discarded"], 1);
        assert_eq!(json["replayed"], 0);
    }
}
