//! Process-wide request metrics.
//!
//! Scalar counters are atomics and never take a lock. The status-code
//! histogram and the per-domain breakdown share one mutex; they are keyed by a
//! small set of values, so contention on it stays low.

pub mod latency;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use self::latency::{LatencySnapshot, LatencyTracker};

/// Counters for one routed domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DomainStats {
    /// Requests routed to this domain.
    pub requests: u64,
    /// Request body bytes received.
    pub bytes_in: u64,
    /// Response body bytes sent.
    pub bytes_out: u64,
    /// Requests answered with a status below 400.
    pub success_count: u64,
    /// Requests answered with an error status.
    pub error_count: u64,
    /// Sum of latencies, in nanoseconds.
    pub latency_sum_ns: u64,
    /// Number of latency samples.
    pub latency_count: u64,
}

/// The outcome of one routed request, as recorded per domain.
#[derive(Debug, Clone, Copy)]
pub struct DomainSample {
    /// Whether the request succeeded.
    pub success: bool,
    /// End-to-end latency.
    pub latency: Duration,
    /// Request body bytes.
    pub bytes_in: u64,
    /// Response body bytes.
    pub bytes_out: u64,
}

#[derive(Debug, Default)]
struct Breakdown {
    status_codes: BTreeMap<u16, u64>,
    domains: BTreeMap<String, DomainStats>,
}

/// The metrics aggregator shared by every request handler.
#[derive(Debug, Default)]
pub struct Metrics {
    total_requests: AtomicU64,
    total_responses: AtomicU64,
    active_requests: AtomicI64,
    latency: LatencyTracker,
    breakdown: Mutex<Breakdown>,
}

impl Metrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new request and return a guard that counts its response when dropped.
    pub fn start_request(&self) -> ActiveRequestGuard<'_> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        ActiveRequestGuard { metrics: self }
    }

    /// Count one response status code.
    pub fn record_status(&self, status: u16) {
        *self.breakdown.lock().status_codes.entry(status).or_default() += 1;
    }

    /// Record one latency sample.
    pub fn record_latency(&self, latency: Duration) {
        self.latency.observe(latency);
    }

    /// Record a request against its routed domain.
    pub fn record_domain(&self, domain: &str, sample: DomainSample) {
        let mut breakdown = self.breakdown.lock();
        let stats = breakdown.domains.entry(domain.to_string()).or_default();

        stats.requests += 1;
        stats.bytes_in += sample.bytes_in;
        stats.bytes_out += sample.bytes_out;
        stats.latency_sum_ns += u64::try_from(sample.latency.as_nanos()).unwrap_or(u64::MAX);
        stats.latency_count += 1;
        if sample.success {
            stats.success_count += 1;
        } else {
            stats.error_count += 1;
        }
    }

    /// Number of requests currently in flight.
    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    /// Take a point-in-time snapshot of every counter.
    pub fn stats(&self) -> MetricsSnapshot {
        let breakdown = self.breakdown.lock();
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_responses: self.total_responses.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
            status_codes: breakdown.status_codes.clone(),
            domains: breakdown.domains.clone(),
        }
    }

    /// Zero every counter and clear both maps.
    pub fn reset(&self) {
        let mut breakdown = self.breakdown.lock();
        self.total_requests.store(0, Ordering::Relaxed);
        self.total_responses.store(0, Ordering::Relaxed);
        self.active_requests.store(0, Ordering::Relaxed);
        self.latency.reset();
        breakdown.status_codes.clear();
        breakdown.domains.clear();
    }

    fn finish_request(&self) {
        self.total_responses.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A RAII guard that counts a response and releases the in-flight slot when
/// the request finishes and drops the guard.
#[derive(Debug)]
pub struct ActiveRequestGuard<'a> {
    metrics: &'a Metrics,
}

impl<'a> Drop for ActiveRequestGuard<'a> {
    fn drop(&mut self) {
        self.metrics.finish_request();
    }
}

/// A serializable view of [`Metrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests received.
    pub total_requests: u64,
    /// Responses sent.
    pub total_responses: u64,
    /// Requests in flight. May read negative right after a reset races with
    /// requests that started before it.
    pub active_requests: i64,
    /// Latency distribution, absent until the first sample.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencySnapshot>,
    /// Responses per status code.
    pub status_codes: BTreeMap<u16, u64>,
    /// Per-domain breakdown.
    pub domains: BTreeMap<String, DomainStats>,
}
