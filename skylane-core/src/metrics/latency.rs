//! Lock-free latency distribution.
//!
//! Sum and count are plain atomic adds. The running minimum and maximum are
//! maintained with compare-and-swap loops so concurrent request handlers never
//! block each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

const NO_SAMPLE: u64 = u64::MAX;

/// Latency totals and extremes, stored in nanoseconds.
#[derive(Debug)]
pub struct LatencyTracker {
    sum_ns: AtomicU64,
    count: AtomicU64,
    /// `u64::MAX` until the first sample arrives.
    min_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl LatencyTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            sum_ns: AtomicU64::new(0),
            count: AtomicU64::new(0),
            min_ns: AtomicU64::new(NO_SAMPLE),
            max_ns: AtomicU64::new(0),
        }
    }

    /// Record one observed latency.
    pub fn observe(&self, latency: Duration) {
        let ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX - 1);

        self.sum_ns.fetch_add(ns, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        update_extreme(&self.min_ns, ns, |candidate, current| candidate < current);
        update_extreme(&self.max_ns, ns, |candidate, current| candidate > current);
    }

    /// Zero all fields.
    pub fn reset(&self) {
        self.sum_ns.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.min_ns.store(NO_SAMPLE, Ordering::Relaxed);
        self.max_ns.store(0, Ordering::Relaxed);
    }

    /// Read the current values, or `None` if nothing has been observed.
    pub fn snapshot(&self) -> Option<LatencySnapshot> {
        let count = self.count.load(Ordering::Acquire);
        if count == 0 {
            return None;
        }
        let sum = self.sum_ns.load(Ordering::Relaxed);
        let min = match self.min_ns.load(Ordering::Relaxed) {
            NO_SAMPLE => 0,
            min => min,
        };
        let max = self.max_ns.load(Ordering::Relaxed);

        Some(LatencySnapshot {
            avg_ms: sum as f64 / count as f64 / 1e6,
            min_ms: min as f64 / 1e6,
            max_ms: max as f64 / 1e6,
            count,
        })
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace `slot` with `candidate` for as long as `improves(candidate, current)` holds.
///
/// A failed exchange means another thread stored a new value; the loop
/// re-checks against it and gives up as soon as the candidate no longer improves.
fn update_extreme(slot: &AtomicU64, candidate: u64, improves: impl Fn(u64, u64) -> bool) {
    let mut current = slot.load(Ordering::Acquire);

    while improves(candidate, current) {
        match slot.compare_exchange_weak(current, candidate, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => break,
            Err(updated) => current = updated,
        }
    }
}

/// A point-in-time view of the latency distribution, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySnapshot {
    /// Mean latency.
    pub avg_ms: f64,
    /// Smallest observed latency.
    pub min_ms: f64,
    /// Largest observed latency.
    pub max_ms: f64,
    /// Number of samples.
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_tracker_has_no_snapshot() {
        assert!(LatencyTracker::new().snapshot().is_none());
    }

    #[test]
    fn tracks_sum_min_max() {
        let tracker = LatencyTracker::new();
        tracker.observe(Duration::from_millis(4));
        tracker.observe(Duration::from_millis(2));
        tracker.observe(Duration::from_millis(6));

        let snap = tracker.snapshot().unwrap();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.min_ms, 2.0);
        assert_eq!(snap.max_ms, 6.0);
        assert_eq!(snap.avg_ms, 4.0);

        tracker.reset();
        assert!(tracker.snapshot().is_none());

        tracker.observe(Duration::from_millis(9));
        let snap = tracker.snapshot().unwrap();
        assert_eq!(snap.min_ms, 9.0);
        assert_eq!(snap.max_ms, 9.0);
    }

    #[test]
    fn concurrent_extremes_are_exact() {
        let tracker = Arc::new(LatencyTracker::new());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for i in 0..1_000u64 {
                        tracker.observe(Duration::from_nanos(1 + t * 1_000 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = tracker.snapshot().unwrap();
        assert_eq!(snap.count, 8_000);
        assert_eq!(snap.min_ms, 1.0 / 1e6);
        assert_eq!(snap.max_ms, 8_000.0 / 1e6);
    }
}
