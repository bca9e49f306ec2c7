//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Window wait bucket boundaries (milliseconds)
/// Buckets: ≤0, ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, >12800 ms
const WAIT_BOUNDS: [u64; 10] = [0, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800];

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn wait_bucket_index(wait_ms: u64) -> usize {
    WAIT_BOUNDS.partition_point(|&bound| bound < wait_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(current_max, new_value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Total events ever processed (monotonic)
    events_total: AtomicU64,
    /// Events since last report (reset on report)
    events_since_report: AtomicU64,
    /// Sum of latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Event processing latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    sessions_started: AtomicU64,
    sessions_verified: AtomicU64,
    sessions_discrepancy: AtomicU64,
    sessions_aborted: AtomicU64,
    window_timeouts: AtomicU64,
    /// Sessions refused because no manifest was loaded
    manifest_refusals: AtomicU64,
    readings_accepted: AtomicU64,
    /// Readings that arrived outside an open window
    readings_discarded: AtomicU64,
    ambiguous_reconciliations: AtomicU64,
    /// Presence events ignored because the archway was already busy
    retriggers_ignored: AtomicU64,
    /// Ingress events dropped due to a full queue (monotonic)
    events_dropped: AtomicU64,
    /// Session reports dropped due to a full egress channel (monotonic)
    reports_dropped: AtomicU64,
    /// Time from presence to window grant (cumulative)
    window_wait_buckets: [AtomicU64; NUM_BUCKETS],
    window_wait_sum_ms: AtomicU64,
    /// Distinct entries in the loaded manifest (gauge)
    manifest_entries: AtomicU64,
    /// Sessions currently Present or Capturing (gauge)
    active_sessions: AtomicU64,
    /// Current event queue depth (updated by sampler)
    event_queue_depth: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_total: AtomicU64::new(0),
            events_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sessions_started: AtomicU64::new(0),
            sessions_verified: AtomicU64::new(0),
            sessions_discrepancy: AtomicU64::new(0),
            sessions_aborted: AtomicU64::new(0),
            window_timeouts: AtomicU64::new(0),
            manifest_refusals: AtomicU64::new(0),
            readings_accepted: AtomicU64::new(0),
            readings_discarded: AtomicU64::new(0),
            ambiguous_reconciliations: AtomicU64::new(0),
            retriggers_ignored: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            reports_dropped: AtomicU64::new(0),
            window_wait_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            window_wait_sum_ms: AtomicU64::new(0),
            manifest_entries: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            event_queue_depth: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record an event was processed with given latency (lock-free)
    #[inline]
    pub fn record_event_processed(&self, latency_us: u64) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.events_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_verified(&self) {
        self.sessions_verified.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_discrepancy(&self) {
        self.sessions_discrepancy.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_aborted(&self) {
        self.sessions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_window_timeout(&self) {
        self.window_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_manifest_refusal(&self) {
        self.manifest_refusals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reading_accepted(&self) {
        self.readings_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reading_discarded(&self) {
        self.readings_discarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ambiguous(&self) {
        self.ambiguous_reconciliations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_retrigger_ignored(&self) {
        self.retriggers_ignored.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an ingress event dropped due to channel full (lock-free)
    #[inline]
    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_report_dropped(&self) {
        self.reports_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time from presence to window grant
    #[inline]
    pub fn record_window_wait(&self, wait_ms: u64) {
        self.window_wait_buckets[wait_bucket_index(wait_ms)].fetch_add(1, Ordering::Relaxed);
        self.window_wait_sum_ms.fetch_add(wait_ms, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_manifest_entries(&self, entries: u64) {
        self.manifest_entries.store(entries, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_active_sessions(&self, sessions: u64) {
        self.active_sessions.store(sessions, Ordering::Relaxed);
    }

    /// Set current event queue depth (called by sampler)
    #[inline]
    pub fn set_event_queue_depth(&self, depth: u64) {
        self.event_queue_depth.store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sessions_verified(&self) -> u64 {
        self.sessions_verified.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sessions_discrepancy(&self) -> u64 {
        self.sessions_discrepancy.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sessions_aborted(&self) -> u64 {
        self.sessions_aborted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn window_timeouts(&self) -> u64 {
        self.window_timeouts.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn manifest_refusals(&self) -> u64 {
        self.manifest_refusals.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn readings_accepted(&self) -> u64 {
        self.readings_accepted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn readings_discarded(&self) -> u64 {
        self.readings_discarded.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn ambiguous_reconciliations(&self) -> u64 {
        self.ambiguous_reconciliations.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn retriggers_ignored(&self) -> u64 {
        self.retriggers_ignored.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn manifest_entries(&self) -> u64 {
        self.manifest_entries.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn event_queue_depth(&self) -> u64 {
        self.event_queue_depth.load(Ordering::Relaxed)
    }

    /// Cumulative window wait histogram and sum (ms)
    pub fn window_wait_histogram(&self) -> ([u64; NUM_BUCKETS], u64) {
        (load_buckets(&self.window_wait_buckets), self.window_wait_sum_ms.load(Ordering::Relaxed))
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let events_count = self.events_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let events_per_sec =
            if elapsed.as_secs_f64() > 0.0 { events_count as f64 / elapsed.as_secs_f64() } else { 0.0 };
        let avg_latency = if events_count > 0 { latency_sum / events_count } else { 0 };

        let (window_wait_buckets, wait_sum) = self.window_wait_histogram();
        let wait_count: u64 = window_wait_buckets.iter().sum();
        let window_wait_avg_ms = if wait_count > 0 { wait_sum / wait_count } else { 0 };

        MetricsSummary {
            events_total: self.events_total(),
            events_per_sec,
            avg_process_latency_us: avg_latency,
            max_process_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            sessions_started: self.sessions_started(),
            sessions_verified: self.sessions_verified(),
            sessions_discrepancy: self.sessions_discrepancy(),
            sessions_aborted: self.sessions_aborted(),
            window_timeouts: self.window_timeouts(),
            manifest_refusals: self.manifest_refusals(),
            readings_accepted: self.readings_accepted(),
            readings_discarded: self.readings_discarded(),
            ambiguous_reconciliations: self.ambiguous_reconciliations(),
            retriggers_ignored: self.retriggers_ignored(),
            events_dropped: self.events_dropped(),
            reports_dropped: self.reports_dropped.load(Ordering::Relaxed),
            window_wait_buckets,
            window_wait_avg_ms,
            manifest_entries: self.manifest_entries(),
            active_sessions: self.active_sessions(),
            event_queue_depth: self.event_queue_depth(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for egress)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_WAIT_BOUNDS: [u64; 10] = WAIT_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub events_total: u64,
    pub events_per_sec: f64,
    pub avg_process_latency_us: u64,
    pub max_process_latency_us: u64,
    /// Event processing latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub sessions_started: u64,
    pub sessions_verified: u64,
    pub sessions_discrepancy: u64,
    pub sessions_aborted: u64,
    pub window_timeouts: u64,
    pub manifest_refusals: u64,
    pub readings_accepted: u64,
    pub readings_discarded: u64,
    pub ambiguous_reconciliations: u64,
    pub retriggers_ignored: u64,
    pub events_dropped: u64,
    pub reports_dropped: u64,
    /// Presence-to-grant wait histogram (ms, cumulative)
    pub window_wait_buckets: [u64; NUM_BUCKETS],
    pub window_wait_avg_ms: u64,
    pub manifest_entries: u64,
    pub active_sessions: u64,
    pub event_queue_depth: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            events_total = %self.events_total,
            events_per_sec = format!("{:.1}", self.events_per_sec),
            avg_latency_us = %self.avg_process_latency_us,
            max_latency_us = %self.max_process_latency_us,
            p99_us = %self.lat_p99_us,
            sessions = %self.sessions_started,
            verified = %self.sessions_verified,
            discrepancy = %self.sessions_discrepancy,
            aborted = %self.sessions_aborted,
            window_timeouts = %self.window_timeouts,
            readings_discarded = %self.readings_discarded,
            events_dropped = %self.events_dropped,
            window_wait_avg_ms = %self.window_wait_avg_ms,
            manifest_entries = %self.manifest_entries,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.events_total(), 0);
        assert_eq!(metrics.sessions_started(), 0);
    }

    #[test]
    fn test_record_event() {
        let metrics = Metrics::new();

        metrics.record_event_processed(100);
        metrics.record_event_processed(200);
        assert_eq!(metrics.events_total(), 2);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 300);
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();

        metrics.record_event_processed(100);
        metrics.record_event_processed(200);
        metrics.record_event_processed(300);
        metrics.record_session_started();
        metrics.record_session_verified();
        metrics.set_manifest_entries(4);

        let summary = metrics.report();

        assert_eq!(summary.events_total, 3);
        assert_eq!(summary.avg_process_latency_us, 200);
        assert_eq!(summary.max_process_latency_us, 300);
        assert_eq!(summary.sessions_started, 1);
        assert_eq!(summary.sessions_verified, 1);
        assert_eq!(summary.manifest_entries, 4);

        // Periodic counters should be reset, monotonic ones kept
        assert_eq!(metrics.events_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency_max_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.report().sessions_started, 1);
    }

    #[test]
    fn test_report_empty() {
        let summary = Metrics::new().report();
        assert_eq!(summary.events_total, 0);
        assert_eq!(summary.avg_process_latency_us, 0);
        assert_eq!(summary.window_wait_avg_ms, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let m = metrics.clone();
                thread::spawn(move || {
                    for i in 0..1000 {
                        m.record_event_processed(i as u64);
                        m.record_reading_accepted();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.events_total(), 10_000);
        assert_eq!(metrics.readings_accepted(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10);
    }

    #[test]
    fn test_window_wait_histogram() {
        let metrics = Metrics::new();
        metrics.record_window_wait(0);
        metrics.record_window_wait(2190);
        metrics.record_window_wait(20_000);

        let (buckets, sum) = metrics.window_wait_histogram();
        assert_eq!(buckets[0], 1);
        assert_eq!(buckets[wait_bucket_index(2190)], 1);
        assert_eq!(buckets[10], 1);
        assert_eq!(sum, 22_190);
        assert_eq!(metrics.report().window_wait_avg_ms, 7396);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_event_processed(150);
        }

        let summary = metrics.report();
        assert_eq!(summary.lat_p50_us, 200);
        assert_eq!(summary.lat_p99_us, 200);
    }
}
