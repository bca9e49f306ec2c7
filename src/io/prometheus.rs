//! Prometheus metrics HTTP endpoint
//!
//! Exposes portal metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS, METRICS_WAIT_BOUNDS};
use crate::services::manifest_store::ManifestStore;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_core_metrics(&mut output, site_id, &summary);
    write_session_metrics(&mut output, site_id, &summary);
    write_reading_metrics(&mut output, site_id, &summary);
    write_queue_metrics(&mut output, site_id, &summary);

    output
}

fn write_core_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(output, "portal_events_total", "Total events processed", MetricType::Counter, site, summary.events_total);
    let _ = writeln!(output, "# HELP portal_events_per_sec Events processed per second");
    let _ = writeln!(output, "# TYPE portal_events_per_sec gauge");
    let _ = writeln!(output, "portal_events_per_sec{{site=\"{site}\"}} {:.2}", summary.events_per_sec);

    write_histogram(
        output,
        "portal_event_latency_us",
        "Event processing latency in microseconds",
        site,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.avg_process_latency_us,
    );
    write_metric(
        output,
        "portal_event_latency_p99_us",
        "99th percentile event latency",
        MetricType::Gauge,
        site,
        summary.lat_p99_us,
    );
}

fn write_session_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(output, "portal_sessions_total", "Sessions opened", MetricType::Counter, site, summary.sessions_started);
    let _ = writeln!(output, "# HELP portal_sessions_retired_total Sessions retired by outcome");
    let _ = writeln!(output, "# TYPE portal_sessions_retired_total counter");
    for (outcome, val) in [
        ("verified", summary.sessions_verified),
        ("discrepancy", summary.sessions_discrepancy),
        ("aborted", summary.sessions_aborted),
    ] {
        let _ = writeln!(output, "portal_sessions_retired_total{{site=\"{site}\",outcome=\"{outcome}\"}} {val}");
    }

    write_metric(
        output,
        "portal_window_timeouts_total",
        "Window requests that waited past the maximum",
        MetricType::Counter,
        site,
        summary.window_timeouts,
    );
    write_metric(
        output,
        "portal_manifest_refusals_total",
        "Verifications refused without a manifest",
        MetricType::Counter,
        site,
        summary.manifest_refusals,
    );
    write_histogram(
        output,
        "portal_window_wait_ms",
        "Presence to window grant wait in milliseconds",
        site,
        &summary.window_wait_buckets,
        &METRICS_WAIT_BOUNDS,
        summary.window_wait_avg_ms,
    );
    write_metric(
        output,
        "portal_active_sessions",
        "Sessions currently live",
        MetricType::Gauge,
        site,
        summary.active_sessions,
    );
    write_metric(
        output,
        "portal_manifest_entries",
        "Entries in the loaded manifest",
        MetricType::Gauge,
        site,
        summary.manifest_entries,
    );
}

fn write_reading_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "portal_readings_accepted_total",
        "Decode readings accepted inside a window",
        MetricType::Counter,
        site,
        summary.readings_accepted,
    );
    write_metric(
        output,
        "portal_readings_discarded_total",
        "Decode readings discarded outside a window or invalid",
        MetricType::Counter,
        site,
        summary.readings_discarded,
    );
    write_metric(
        output,
        "portal_ambiguous_total",
        "Reconciliations left ambiguous",
        MetricType::Counter,
        site,
        summary.ambiguous_reconciliations,
    );
    write_metric(
        output,
        "portal_retriggers_ignored_total",
        "Presence retriggers on a busy archway",
        MetricType::Counter,
        site,
        summary.retriggers_ignored,
    );
}

fn write_queue_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "portal_events_dropped_total",
        "Ingress events dropped due to channel full",
        MetricType::Counter,
        site,
        summary.events_dropped,
    );
    write_metric(
        output,
        "portal_reports_dropped_total",
        "Session reports dropped due to channel full",
        MetricType::Counter,
        site,
        summary.reports_dropped,
    );
    write_metric(
        output,
        "portal_event_queue_depth",
        "Current event queue depth",
        MetricType::Gauge,
        site,
        summary.event_queue_depth,
    );
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    manifest: ManifestStore,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &site_id),
        ),
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "ok".to_string()),
        (&Method::GET, "/manifest") => {
            let body = match manifest.snapshot() {
                Some(m) => serde_json::to_string(m.entries()).unwrap_or_else(|_| "[]".to_string()),
                None => "null".to_string(),
            };
            text_response(StatusCode::OK, "application/json", body)
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    manifest: ManifestStore,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let manifest = manifest.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, metrics.clone(), manifest.clone(), site_id.clone())
                            });

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
