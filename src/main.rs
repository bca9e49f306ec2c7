//! Pallet portal - scan orchestration for dual-archway pallet portals
//!
//! Detects pallets in each archway, arbitrates the shared capture window,
//! reconciles camera and IR decodes and verifies them against the job manifest.
//!
//! Module structure:
//! - `domain/` - Core business types (ScanSession, ScanEvent, BarcodeReading)
//! - `io/` - External interfaces (MQTT ingress/egress, JSONL egress, Prometheus)
//! - `services/` - Business logic (ScanOrchestrator, CaptureCoordinator, DecodeReconciler)
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use clap::Parser;
use pallet_portal::domain::SessionReport;
use pallet_portal::infra::{Config, Metrics};
use pallet_portal::io::{create_egress_channel, run_egress_worker, Egress, MqttPublisher};
use pallet_portal::services::{ManifestStore, ScanOrchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Ingress queue between MQTT and the orchestrator
const EVENT_QUEUE_CAPACITY: usize = 1000;
/// Retired session reports awaiting egress
const REPORT_QUEUE_CAPACITY: usize = 256;

/// Pallet portal - archway scan orchestration and manifest verification
#[derive(Parser, Debug)]
#[command(name = "pallet-portal", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/portal.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG overrides the default INFO level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git = %env!("GIT_HASH"), "pallet_portal_starting");

    let args = Args::parse();
    let config = Config::load_from_path(&Config::resolve_config_path(args.config.as_deref()));

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        mqtt_topic = %config.mqtt_topic(),
        archways = ?config.archway_ids(),
        window_ms = %config.window_ms(),
        guard_ms = %config.guard_ms(),
        max_wait_ms = %config.max_wait_ms(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    pallet_portal::infra::broker::start_embedded_broker(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let manifest = ManifestStore::new();
    if let Some(path) = config.manifest_file() {
        match manifest.load_file(path) {
            Ok(count) => info!(path = %path, entries = %count, "manifest_file_loaded"),
            Err(e) => warn!(path = %path, error = %format!("{e:#}"), "manifest_file_load_failed"),
        }
    }

    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (report_tx, report_rx) = mpsc::channel::<SessionReport>(REPORT_QUEUE_CAPACITY);

    // Start MQTT ingress
    let mqtt_config = config.clone();
    let mqtt_tx = event_tx.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) =
            pallet_portal::io::mqtt::start_mqtt_client(&mqtt_config, mqtt_tx, mqtt_metrics, mqtt_shutdown).await
        {
            error!(error = %e, "mqtt_client_error");
        }
    });

    // Sample queue depth for metrics; holds a weak handle so the queue can close
    let depth_tx = event_tx.downgrade();
    drop(event_tx);
    let depth_metrics = metrics.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(500));
        loop {
            interval.tick().await;
            let Some(tx) = depth_tx.upgrade() else { break };
            depth_metrics.set_event_queue_depth((tx.max_capacity() - tx.capacity()) as u64);
        }
    });

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_manifest = manifest.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = pallet_portal::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_manifest,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    // Periodic metrics log
    let log_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            log_metrics.report().log();
        }
    });

    // MQTT egress publisher (if enabled)
    let egress_sender = if config.mqtt_egress_enabled() {
        let (egress_sender, egress_rx) = create_egress_channel(1000, config.site_id().to_string());

        let publisher = MqttPublisher::new(&config, egress_rx);
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });

        let metrics_egress = egress_sender.clone();
        let metrics_for_egress = metrics.clone();
        let egress_interval = config.mqtt_egress_metrics_interval_secs().max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(egress_interval));
            loop {
                interval.tick().await;
                metrics_egress.send_metrics(metrics_for_egress.report());
            }
        });

        Some(egress_sender)
    } else {
        None
    };

    let egress = Egress::new(config.egress_file());
    let egress_worker = tokio::spawn(run_egress_worker(egress, report_rx, egress_sender, metrics.clone()));

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "ctrl_c_handler_failed");
            return;
        }
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Consumes events until shutdown; dropping it closes the report channel
    let mut orchestrator = ScanOrchestrator::new(config, manifest, metrics, report_tx);
    orchestrator.run(event_rx, shutdown_rx).await;
    drop(orchestrator);

    if let Err(e) = egress_worker.await {
        error!(error = %e, "egress_worker_join_failed");
    }

    info!("pallet_portal_shutdown_complete");
    Ok(())
}
