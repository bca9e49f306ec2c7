//! Session egress - writes retired session reports to file
//!
//! Reports are written in JSONL format (one JSON object per line)
//! to the file specified in config, and optionally forwarded to MQTT.

use crate::domain::session::SessionReport;
use crate::infra::metrics::Metrics;
use crate::io::egress_channel::EgressSender;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Egress writer for session reports
pub struct Egress {
    file_path: String,
}

impl Egress {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "egress_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Append one report to the egress file; false on I/O failure
    pub fn write_report(&self, report: &SessionReport) -> bool {
        let json = report.to_json();

        match self.append_line(&json) {
            Ok(()) => {
                debug!(
                    sid = %report.sid,
                    archway = %report.archway,
                    outcome = %report.outcome.as_str(),
                    "session_egressed"
                );
                true
            }
            Err(e) => {
                error!(sid = %report.sid, error = %e, "session_egress_failed");
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;

        Ok(())
    }
}

/// Drain session reports from the orchestrator until its sender is dropped
///
/// Each report is appended to the JSONL file and, when MQTT egress is
/// enabled, forwarded to the publisher.
pub async fn run_egress_worker(
    egress: Egress,
    mut report_rx: mpsc::Receiver<SessionReport>,
    mqtt: Option<EgressSender>,
    metrics: Arc<Metrics>,
) {
    while let Some(report) = report_rx.recv().await {
        egress.write_report(&report);
        if let Some(sender) = &mqtt {
            if !sender.send_report(&report) {
                metrics.record_report_dropped();
                warn!(sid = %report.sid, "mqtt_result_dropped");
            }
        }
    }
    info!("egress_worker_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ScanError;
    use crate::domain::session::ScanSession;
    use crate::domain::types::ArchwayId;
    use crate::io::egress_channel::{create_egress_channel, EgressMessage};
    use std::fs;
    use std::time::Instant;
    use tempfile::tempdir;

    fn aborted_report() -> SessionReport {
        let mut session = ScanSession::open(ArchwayId(2), Instant::now(), 1_767_617_600_000);
        session.abort(ScanError::PresenceLost(ArchwayId(2))).unwrap();
        session.retire().unwrap();
        session.report("dock-1", None)
    }

    #[test]
    fn test_write_report() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("sessions.jsonl");
        let egress = Egress::new(file_path.to_str().unwrap());

        let report = aborted_report();
        assert!(egress.write_report(&report));

        let content = fs::read_to_string(&file_path).unwrap();
        assert!(content.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["sid"], report.sid);
        assert_eq!(parsed["site"], "dock-1");
        assert_eq!(parsed["reason"], "presence-lost");
    }

    #[test]
    fn test_append_mode_and_parent_dirs() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("nested").join("sessions.jsonl");
        let egress = Egress::new(file_path.to_str().unwrap());

        egress.write_report(&aborted_report());
        egress.write_report(&aborted_report());

        let content = fs::read_to_string(&file_path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_worker_writes_and_forwards() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("sessions.jsonl");
        let egress = Egress::new(file_path.to_str().unwrap());

        let (report_tx, report_rx) = mpsc::channel(4);
        let (sender, mut egress_rx) = create_egress_channel(4, "dock-1".to_string());
        let worker = tokio::spawn(run_egress_worker(egress, report_rx, Some(sender), Arc::new(Metrics::new())));

        report_tx.send(aborted_report()).await.unwrap();
        drop(report_tx);
        worker.await.unwrap();

        assert_eq!(fs::read_to_string(&file_path).unwrap().lines().count(), 1);
        assert!(matches!(egress_rx.recv().await, Some(EgressMessage::Report(_))));
    }
}
