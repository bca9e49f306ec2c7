//! End-to-end scan flow through the orchestrator loop and the egress worker

use pallet_portal::domain::{ArchwayId, ReadingSource, ScanEvent, ScanEventKind, SessionOutcome, SessionReport};
use pallet_portal::infra::{Config, Metrics};
use pallet_portal::io::{run_egress_worker, Egress};
use pallet_portal::services::{ManifestStore, ScanOrchestrator};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::{mpsc, watch};

fn presence(archway: u8, present: bool) -> ScanEvent {
    ScanEvent::new(ScanEventKind::Presence { archway: ArchwayId(archway), present }, 0)
}

fn camera(archway: u8, code: &str, confidence: f32) -> ScanEvent {
    ScanEvent::new(
        ScanEventKind::Reading {
            archway: ArchwayId(archway),
            source: ReadingSource::CameraLeft,
            code: code.to_string(),
            confidence,
        },
        0,
    )
}

fn missing(report: &SessionReport) -> Vec<&str> {
    report.result.as_ref().map_or_else(Vec::new, |r| r.missing.iter().map(String::as_str).collect())
}

async fn next_report(rx: &mut mpsc::Receiver<SessionReport>) -> SessionReport {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("report within timeout")
        .expect("report channel open")
}

#[tokio::test]
async fn test_two_archways_share_the_window() {
    let dir = tempdir().unwrap();
    let manifest_path = dir.path().join("barcodes.txt");
    fs::write(&manifest_path, "\u{feff}PAL1, PAL2*2\n").unwrap();

    let manifest = ManifestStore::new();
    assert_eq!(manifest.load_file(&manifest_path).unwrap(), 2);

    let config = Config::default().with_capture(300, 20, 5000);
    let metrics = Arc::new(Metrics::new());
    let (event_tx, event_rx) = mpsc::channel(64);
    let (report_tx, mut report_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut orchestrator = ScanOrchestrator::new(config, manifest, metrics.clone(), report_tx);
    let handle = tokio::spawn(async move { orchestrator.run(event_rx, shutdown_rx).await });

    event_tx.send(presence(1, true)).await.unwrap();
    event_tx.send(presence(2, true)).await.unwrap();
    event_tx.send(camera(1, "PAL1", 0.9)).await.unwrap();
    // Archway 2 has no window yet
    event_tx.send(camera(2, "PAL2", 0.9)).await.unwrap();

    // Each pallet is checked against the whole job, so the other entry is missing
    let first = next_report(&mut report_rx).await;
    assert_eq!(first.archway, ArchwayId(1));
    assert_eq!(first.outcome, SessionOutcome::Discrepancy);
    assert_eq!(missing(&first), vec!["PAL2"]);

    // Archway 2 is granted after the guard interval
    tokio::time::sleep(Duration::from_millis(60)).await;
    event_tx.send(camera(2, "PAL2", 0.9)).await.unwrap();

    let second = next_report(&mut report_rx).await;
    assert_eq!(second.archway, ArchwayId(2));
    assert_eq!(second.outcome, SessionOutcome::Discrepancy);
    assert_eq!(missing(&second), vec!["PAL1"]);
    assert!(second.result.as_ref().unwrap().matched.contains("PAL2"));
    let window_gap = second.window_start.unwrap().saturating_sub(first.t1);
    assert!(window_gap < 1000);

    let job = second.job.unwrap();
    assert_eq!((job.scanned, job.expected, job.complete), (2, 3, false));

    assert_eq!(metrics.readings_discarded(), 1);
    assert_eq!(metrics.sessions_discrepancy(), 2);
    assert_eq!(metrics.sessions_verified(), 0);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reports_reach_jsonl_egress() {
    let dir = tempdir().unwrap();
    let egress_path = dir.path().join("out").join("sessions.jsonl");

    let config = Config::default().with_capture(100, 20, 5000);
    let metrics = Arc::new(Metrics::new());
    let (event_tx, event_rx) = mpsc::channel(64);
    let (report_tx, report_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let egress = Egress::new(egress_path.to_str().unwrap());
    let worker = tokio::spawn(run_egress_worker(egress, report_rx, None, metrics.clone()));

    let mut orchestrator = ScanOrchestrator::new(config, ManifestStore::new(), metrics.clone(), report_tx);
    let handle = tokio::spawn(async move { orchestrator.run(event_rx, shutdown_rx).await });

    // No manifest: verification is refused but the readings are kept
    event_tx.send(presence(1, true)).await.unwrap();
    event_tx.send(camera(1, "PAL9", 0.8)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();

    let content = fs::read_to_string(&egress_path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1);

    let report: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(report["archway"], 1);
    assert_eq!(report["outcome"], "aborted");
    assert_eq!(report["reason"], "manifest-not-loaded");
    assert_eq!(report["readings"].as_array().unwrap().len(), 1);
    assert_eq!(metrics.manifest_refusals(), 1);
}
