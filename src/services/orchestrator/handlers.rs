//! Event handlers for the ScanOrchestrator
//!
//! Each handler processes one event kind, advancing the archway's session
//! and emitting a report whenever a session retires.

use super::ScanOrchestrator;
use crate::domain::error::ScanError;
use crate::domain::result::JobProgressSnapshot;
use crate::domain::session::{ScanSession, SessionOutcome, SessionState};
use crate::domain::types::{ArchwayId, BarcodeReading, ManifestEntry, ReadingSource};
use crate::services::coordinator::{CoordinatorEvent, WindowDecision};
use crate::services::verification::VerificationEngine;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

impl ScanOrchestrator {
    /// Feed a raw ultrasonic sample through the archway's presence monitor
    pub(crate) fn handle_distance(
        &mut self,
        archway: ArchwayId,
        sensor: u8,
        distance_in: Option<f64>,
        ts: u64,
        now: Instant,
    ) {
        let Some(monitor) = self.monitors.get_mut(&archway) else {
            warn!(archway = %archway, "distance_unknown_archway");
            return;
        };
        if let Some(present) = monitor.on_sample(sensor, distance_in) {
            self.handle_presence(archway, present, ts, now);
        }
    }

    /// Handle a presence transition for one archway
    ///
    /// Presence opens a session and requests a capture window. Re-entrant
    /// presence while the archway is busy is ignored. Losing presence before
    /// the window closes aborts the session and frees the window.
    pub(crate) fn handle_presence(&mut self, archway: ArchwayId, present: bool, ts: u64, now: Instant) {
        let Some(monitor) = self.monitors.get_mut(&archway) else {
            warn!(archway = %archway, "presence_unknown_archway");
            return;
        };
        monitor.force(present);

        if present {
            self.open_session(archway, ts, now);
        } else {
            self.presence_lost(archway, now);
        }
    }

    fn open_session(&mut self, archway: ArchwayId, ts: u64, now: Instant) {
        if self.sessions.get(&archway).is_some_and(|s| s.is_active()) {
            self.metrics.record_retrigger_ignored();
            debug!(archway = %archway, "presence_retrigger_ignored");
            return;
        }

        let mut session = ScanSession::open(archway, now, ts);
        self.metrics.record_session_started();
        info!(archway = %archway, sid = %session.sid, "session_opened");

        let duration = Duration::from_millis(self.config.window_ms());
        match self.coordinator.request_window(archway, session.sid.clone(), duration, now) {
            Ok(WindowDecision::Granted(window)) => {
                self.metrics.record_window_wait(0);
                if let Err(e) = session.begin_capture(window) {
                    error!(archway = %archway, sid = %session.sid, error = %e, "capture_start_failed");
                }
                self.sessions.insert(archway, session);
            }
            Ok(WindowDecision::Deferred { displaced }) => {
                if let Some(old) = displaced {
                    warn!(archway = %archway, displaced_sid = %old.sid, "window_request_displaced");
                }
                debug!(archway = %archway, sid = %session.sid, "session_waiting_for_window");
                self.sessions.insert(archway, session);
            }
            Err(e) => {
                warn!(archway = %archway, sid = %session.sid, error = %e, code = %e.code(), "window_request_rejected");
                if session.abort(e).is_ok() {
                    self.retire(session, None);
                }
            }
        }
    }

    fn presence_lost(&mut self, archway: ArchwayId, now: Instant) {
        let Some(mut session) = self.sessions.remove(&archway) else {
            debug!(archway = %archway, "presence_cleared");
            return;
        };

        let state = session.state();
        self.coordinator.cancel(archway, now);
        let discarded = session.readings.len();
        match session.abort(ScanError::PresenceLost(archway)) {
            Ok(()) => {
                info!(
                    archway = %archway,
                    sid = %session.sid,
                    state = %state.as_str(),
                    readings_discarded = %discarded,
                    "session_presence_lost"
                );
                self.retire(session, None);
            }
            Err(e) => {
                error!(archway = %archway, sid = %session.sid, error = %e, "session_abort_failed");
            }
        }
    }

    /// Accept a decode attempt if the archway's window is open
    pub(crate) fn handle_reading(
        &mut self,
        archway: ArchwayId,
        source: ReadingSource,
        code: &str,
        confidence: f32,
        ts: u64,
        now: Instant,
    ) {
        if !(0.0..=1.0).contains(&confidence) {
            let err = ScanError::InvalidReading(format!("confidence {confidence} out of range"));
            warn!(archway = %archway, source = %source.as_str(), error = %err, "reading_rejected");
            self.metrics.record_reading_discarded();
            return;
        }

        match self.sessions.get_mut(&archway) {
            Some(session) if session.accepts_readings_at(now) => {
                session.add_reading(BarcodeReading::new(source, code, confidence, ts));
                self.metrics.record_reading_accepted();
                debug!(
                    archway = %archway,
                    sid = %session.sid,
                    source = %source.as_str(),
                    code = %code,
                    confidence = %confidence,
                    "reading_accepted"
                );
            }
            other => {
                self.metrics.record_reading_discarded();
                debug!(
                    archway = %archway,
                    source = %source.as_str(),
                    code = %code,
                    state = %other.map_or(SessionState::Idle, |s| s.state()).as_str(),
                    "reading_outside_window"
                );
            }
        }
    }

    /// Replace the manifest; the next verification uses the new snapshot
    pub(crate) fn handle_manifest_load(&mut self, entries: Vec<ManifestEntry>) {
        match self.manifest.load(entries) {
            Ok(count) => {
                self.progress.reset(self.manifest.snapshot());
                self.metrics.set_manifest_entries(count as u64);
                if count == 0 {
                    warn!("manifest_cleared");
                }
            }
            Err(e) => {
                warn!(error = %e, code = %e.code(), "manifest_load_rejected");
            }
        }
    }

    pub(crate) fn handle_coordinator_event(&mut self, event: CoordinatorEvent, now: Instant) {
        match event {
            CoordinatorEvent::Granted { sid, window, waited } => {
                let archway = window.archway;
                match self.sessions.get_mut(&archway) {
                    Some(session) if session.sid == sid && session.state() == SessionState::Present => {
                        self.metrics.record_window_wait(waited.as_millis() as u64);
                        if let Err(e) = session.begin_capture(window) {
                            error!(archway = %archway, sid = %sid, error = %e, "capture_start_failed");
                            self.coordinator.cancel(archway, now);
                        }
                    }
                    _ => {
                        // Session went away between request and grant
                        warn!(archway = %archway, sid = %sid, "window_grant_orphaned");
                        self.coordinator.cancel(archway, now);
                    }
                }
            }
            CoordinatorEvent::TimedOut { archway, sid, waited } => {
                let matches = self.sessions.get(&archway).is_some_and(|s| s.sid == sid);
                if !matches {
                    return;
                }
                let Some(mut session) = self.sessions.remove(&archway) else {
                    return;
                };
                self.metrics.record_window_timeout();
                let reason = ScanError::WindowTimeout { archway, waited_ms: waited.as_millis() as u64 };
                match session.abort(reason) {
                    Ok(()) => self.retire(session, None),
                    Err(e) => error!(archway = %archway, sid = %sid, error = %e, "session_abort_failed"),
                }
            }
        }
    }

    /// Close an elapsed window: reconcile, verify and retire the session
    pub(crate) fn close_window(&mut self, archway: ArchwayId, now: Instant) {
        let Some(mut session) = self.sessions.remove(&archway) else {
            return;
        };
        self.coordinator.release(archway, now);

        if let Err(e) = session.begin_reconcile() {
            error!(archway = %archway, sid = %session.sid, error = %e, "reconcile_start_failed");
            return;
        }

        let reconciliation = self.reconciler.reconcile(&session.readings);
        if reconciliation.ambiguous {
            self.metrics.record_ambiguous();
            warn!(
                archway = %archway,
                sid = %session.sid,
                codes = ?reconciliation.code_values(),
                "reconciliation_ambiguous"
            );
        }
        debug!(
            archway = %archway,
            sid = %session.sid,
            readings = %session.readings.len(),
            codes = ?reconciliation.code_values(),
            discarded = %reconciliation.discarded,
            "window_reconciled"
        );

        // One snapshot per verification; later reloads do not affect it
        let snapshot = self.manifest.snapshot();
        match VerificationEngine::verify(&reconciliation.codes, snapshot.as_deref()) {
            Ok(result) => {
                let job = snapshot.as_ref().map(|m| self.progress.record(m, &reconciliation.codes));
                match session.complete(reconciliation, result) {
                    Ok(_) => self.retire(session, job),
                    Err(e) => error!(archway = %archway, sid = %session.sid, error = %e, "session_complete_failed"),
                }
            }
            Err(e) => {
                self.metrics.record_manifest_refusal();
                error!(
                    archway = %archway,
                    sid = %session.sid,
                    readings = %session.readings.len(),
                    code = %e.code(),
                    "verification_refused_manifest_not_loaded"
                );
                session.reconciliation = Some(reconciliation);
                match session.abort(e) {
                    Ok(()) => self.retire(session, None),
                    Err(e) => error!(archway = %archway, sid = %session.sid, error = %e, "session_abort_failed"),
                }
            }
        }
    }

    /// Return the session to Idle and hand its report to the egress worker
    fn retire(&mut self, mut session: ScanSession, job: Option<JobProgressSnapshot>) {
        if let Err(e) = session.retire() {
            error!(archway = %session.archway, sid = %session.sid, error = %e, "session_retire_failed");
            return;
        }

        match session.outcome {
            Some(SessionOutcome::Verified) => self.metrics.record_session_verified(),
            Some(SessionOutcome::Discrepancy) => self.metrics.record_session_discrepancy(),
            _ => self.metrics.record_session_aborted(),
        }

        let report = session.report(self.config.site_id(), job);
        info!(
            archway = %report.archway,
            sid = %report.sid,
            outcome = %report.outcome.as_str(),
            reason = %report.reason.unwrap_or("-"),
            codes = %report.codes.len(),
            duration_ms = %report.duration_ms,
            "session_retired"
        );

        match self.report_tx.try_send(report) {
            Ok(()) => {}
            Err(TrySendError::Full(report)) => {
                self.metrics.record_report_dropped();
                warn!(sid = %report.sid, "session_report_dropped_channel_full");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("session_report_channel_closed");
            }
        }
    }
}
