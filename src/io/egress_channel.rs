//! Typed channel for MQTT egress messages
//!
//! Provides a non-blocking way to hand session results and metrics to the
//! MQTT publisher. Uses bounded mpsc channels to prevent unbounded memory growth.

use crate::domain::session::SessionReport;
use crate::domain::types::epoch_ms;
use crate::infra::metrics::{MetricsSummary, METRICS_NUM_BUCKETS};
use serde::Serialize;
use tokio::sync::mpsc;

/// Messages that can be sent to the MQTT publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Retired session result
    Report(ReportPayload),
    /// Periodic metrics snapshot
    Metrics(MetricsPayload),
}

/// Payload for retired sessions (pre-serialized JSON)
#[derive(Debug, Serialize)]
pub struct ReportPayload {
    pub json: String,
}

/// Payload for metrics snapshot
#[derive(Debug, Serialize)]
pub struct MetricsPayload {
    /// Site identifier
    pub site: String,
    /// Timestamp (epoch ms)
    pub ts: u64,
    /// Total events processed
    pub events_total: u64,
    /// Events per second
    pub events_per_sec: f64,
    /// Average processing latency (microseconds)
    pub avg_latency_us: u64,
    /// Max processing latency (microseconds)
    pub max_latency_us: u64,
    /// Event processing latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub lat_p99_us: u64,
    pub sessions: u64,
    pub verified: u64,
    pub discrepancy: u64,
    pub aborted: u64,
    pub window_timeouts: u64,
    pub manifest_refusals: u64,
    pub readings_accepted: u64,
    pub readings_discarded: u64,
    pub events_dropped: u64,
    /// Presence-to-grant wait histogram (ms)
    pub wait_buckets: [u64; METRICS_NUM_BUCKETS],
    pub wait_avg_ms: u64,
    pub active_sessions: u64,
    pub manifest_entries: u64,
    /// Current event queue depth (snapshot)
    pub event_queue_depth: u64,
}

impl MetricsPayload {
    /// Create a metrics payload from a summary with site info
    pub fn from_summary(summary: MetricsSummary, site: String) -> Self {
        Self {
            site,
            ts: epoch_ms(),
            events_total: summary.events_total,
            events_per_sec: summary.events_per_sec,
            avg_latency_us: summary.avg_process_latency_us,
            max_latency_us: summary.max_process_latency_us,
            lat_buckets: summary.lat_buckets,
            lat_p99_us: summary.lat_p99_us,
            sessions: summary.sessions_started,
            verified: summary.sessions_verified,
            discrepancy: summary.sessions_discrepancy,
            aborted: summary.sessions_aborted,
            window_timeouts: summary.window_timeouts,
            manifest_refusals: summary.manifest_refusals,
            readings_accepted: summary.readings_accepted,
            readings_discarded: summary.readings_discarded,
            events_dropped: summary.events_dropped,
            wait_buckets: summary.window_wait_buckets,
            wait_avg_ms: summary.window_wait_avg_ms,
            active_sessions: summary.active_sessions,
            manifest_entries: summary.manifest_entries,
            event_queue_depth: summary.event_queue_depth,
        }
    }
}

/// Sender handle for egress messages
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, messages are dropped.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
}

impl EgressSender {
    pub fn new(tx: mpsc::Sender<EgressMessage>, site_id: String) -> Self {
        Self { tx, site_id }
    }

    /// Send a retired session for publishing; returns false if dropped
    pub fn send_report(&self, report: &SessionReport) -> bool {
        let payload = ReportPayload { json: report.to_json() };
        self.tx.try_send(EgressMessage::Report(payload)).is_ok()
    }

    /// Send a metrics snapshot
    pub fn send_metrics(&self, summary: MetricsSummary) {
        let payload = MetricsPayload::from_summary(summary, self.site_id.clone());
        let _ = self.tx.try_send(EgressMessage::Metrics(payload));
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
/// site_id is stamped on metrics payloads; reports already carry it.
pub fn create_egress_channel(buffer_size: usize, site_id: String) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, site_id), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::metrics::Metrics;

    #[test]
    fn test_metrics_payload_carries_site() {
        let metrics = Metrics::new();
        metrics.record_session_started();
        let payload = MetricsPayload::from_summary(metrics.report(), "dock-3".to_string());
        assert_eq!(payload.site, "dock-3");
        assert_eq!(payload.sessions, 1);

        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"wait_buckets\""));
    }

    #[tokio::test]
    async fn test_full_channel_drops() {
        let (sender, mut rx) = create_egress_channel(1, "s".to_string());
        sender.send_metrics(Metrics::new().report());
        sender.send_metrics(Metrics::new().report());

        assert!(matches!(rx.recv().await, Some(EgressMessage::Metrics(_))));
        assert!(rx.try_recv().is_err());
    }
}
