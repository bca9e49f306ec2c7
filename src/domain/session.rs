//! Scan session data model and state machine
//!
//! A session is opened by a presence event on one archway and retired back to
//! `Idle` once its result has been reported. Transitions are validated so a
//! session can never skip a stage:
//!
//! ```text
//! Idle -> Present -> Capturing -> Reconciling -> Verified | Discrepancy -> Idle
//!            |            |             |
//!            +------------+-------------+--> Idle (aborted)
//! ```

use crate::domain::error::ScanError;
use crate::domain::result::{JobProgressSnapshot, ReconciledCode, Reconciliation, VerificationResult};
use crate::domain::types::{epoch_ms, ArchwayId, BarcodeReading, SessionId};
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Present,
    Capturing,
    Reconciling,
    Verified,
    Discrepancy,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Present => "present",
            SessionState::Capturing => "capturing",
            SessionState::Reconciling => "reconciling",
            SessionState::Verified => "verified",
            SessionState::Discrepancy => "discrepancy",
        }
    }

    /// Whether `self -> to` is a legal transition
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Idle, Present)
                | (Present, Capturing)
                | (Present, Idle)
                | (Capturing, Reconciling)
                | (Capturing, Idle)
                | (Reconciling, Verified)
                | (Reconciling, Discrepancy)
                | (Reconciling, Idle)
                | (Verified, Idle)
                | (Discrepancy, Idle)
        )
    }
}

/// Final outcome reported to the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Verified,
    Discrepancy,
    Aborted,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Verified => "verified",
            SessionOutcome::Discrepancy => "discrepancy",
            SessionOutcome::Aborted => "aborted",
        }
    }
}

/// A granted capture window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureWindow {
    /// Monotonic grant sequence number
    pub seq: u64,
    pub archway: ArchwayId,
    pub started_at: Instant,
    pub deadline: Instant,
}

impl CaptureWindow {
    pub fn duration(&self) -> Duration {
        self.deadline.saturating_duration_since(self.started_at)
    }

    #[inline]
    pub fn is_open_at(&self, now: Instant) -> bool {
        now >= self.started_at && now < self.deadline
    }
}

/// One pallet pass through one archway
#[derive(Debug, Clone)]
pub struct ScanSession {
    pub sid: SessionId,
    pub archway: ArchwayId,
    state: SessionState,
    pub presence_at: Instant,
    /// Presence event timestamp (epoch ms)
    pub presence_ts: u64,
    pub window: Option<CaptureWindow>,
    pub window_started_ts: Option<u64>,
    pub readings: Vec<BarcodeReading>,
    pub reconciliation: Option<Reconciliation>,
    pub result: Option<VerificationResult>,
    pub outcome: Option<SessionOutcome>,
    pub reason: Option<ScanError>,
    pub ended_ts: Option<u64>,
}

impl ScanSession {
    /// Open a session for a presence event (`Idle -> Present`)
    pub fn open(archway: ArchwayId, presence_at: Instant, presence_ts: u64) -> Self {
        Self {
            sid: SessionId::new(),
            archway,
            state: SessionState::Present,
            presence_at,
            presence_ts,
            window: None,
            window_started_ts: None,
            readings: Vec::with_capacity(16),
            reconciliation: None,
            result: None,
            outcome: None,
            reason: None,
            ended_ts: None,
        }
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Present or Capturing: the archway is busy with this session
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Present | SessionState::Capturing)
    }

    pub fn transition(&mut self, to: SessionState) -> Result<(), ScanError> {
        if !self.state.can_transition_to(to) {
            return Err(ScanError::InvalidTransition { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }

    /// `Present -> Capturing` with the granted window
    pub fn begin_capture(&mut self, window: CaptureWindow) -> Result<(), ScanError> {
        self.transition(SessionState::Capturing)?;
        self.window = Some(window);
        self.window_started_ts = Some(epoch_ms());
        Ok(())
    }

    /// True while capturing and inside the window
    pub fn accepts_readings_at(&self, now: Instant) -> bool {
        self.state == SessionState::Capturing && self.window.is_some_and(|w| w.is_open_at(now))
    }

    /// True once the capture window has run its full duration
    pub fn window_elapsed_at(&self, now: Instant) -> bool {
        self.state == SessionState::Capturing && self.window.is_some_and(|w| now >= w.deadline)
    }

    pub fn add_reading(&mut self, reading: BarcodeReading) {
        self.readings.push(reading);
    }

    /// `Capturing -> Reconciling`
    pub fn begin_reconcile(&mut self) -> Result<(), ScanError> {
        self.transition(SessionState::Reconciling)
    }

    /// `Reconciling -> Verified | Discrepancy`
    ///
    /// An ambiguous reconciliation always yields a discrepancy, as does any
    /// missing or extra code.
    pub fn complete(
        &mut self,
        reconciliation: Reconciliation,
        result: VerificationResult,
    ) -> Result<SessionState, ScanError> {
        let next = if result.is_clean() && !reconciliation.ambiguous {
            SessionState::Verified
        } else {
            SessionState::Discrepancy
        };
        self.transition(next)?;

        if reconciliation.ambiguous {
            self.reason = Some(ScanError::AmbiguousReconciliation(reconciliation.ambiguous_count()));
        } else if reconciliation.codes.is_empty() {
            self.reason = Some(ScanError::NoReading);
        }
        self.outcome = Some(match next {
            SessionState::Verified => SessionOutcome::Verified,
            _ => SessionOutcome::Discrepancy,
        });
        self.reconciliation = Some(reconciliation);
        self.result = Some(result);
        self.ended_ts = Some(epoch_ms());
        Ok(next)
    }

    /// Abort to `Idle` from Present, Capturing or Reconciling
    ///
    /// Readings are discarded unless the abort reason requires them to be kept
    /// for inspection (manifest refusal).
    pub fn abort(&mut self, reason: ScanError) -> Result<(), ScanError> {
        self.transition(SessionState::Idle)?;
        if !matches!(reason, ScanError::ManifestNotLoaded) {
            self.readings.clear();
        }
        self.outcome = Some(SessionOutcome::Aborted);
        self.reason = Some(reason);
        self.ended_ts = Some(epoch_ms());
        Ok(())
    }

    /// `Verified | Discrepancy -> Idle`; aborted sessions are already idle
    pub fn retire(&mut self) -> Result<(), ScanError> {
        if self.state != SessionState::Idle {
            self.transition(SessionState::Idle)?;
        }
        Ok(())
    }

    /// Build the report handed to the result sink
    pub fn report(&self, site: &str, job: Option<JobProgressSnapshot>) -> SessionReport {
        let ended = self.ended_ts.unwrap_or_else(epoch_ms);
        let codes = self
            .reconciliation
            .as_ref()
            .map(|r| r.codes.iter().map(ReportCode::from).collect())
            .unwrap_or_default();
        let keep_readings = matches!(
            self.reason,
            Some(ScanError::AmbiguousReconciliation(_)) | Some(ScanError::ManifestNotLoaded)
        );

        SessionReport {
            site: site.to_string(),
            sid: self.sid.to_string(),
            archway: self.archway,
            outcome: self.outcome.unwrap_or(SessionOutcome::Aborted),
            reason: self.reason.as_ref().map(|e| e.code()),
            detail: self.reason.as_ref().map(|e| e.to_string()),
            t0: self.presence_ts,
            window_start: self.window_started_ts,
            t1: ended,
            duration_ms: ended.saturating_sub(self.presence_ts),
            reading_count: self.readings.len(),
            codes,
            result: self.result.clone(),
            readings: if keep_readings { self.readings.clone() } else { Vec::new() },
            job,
        }
    }
}

/// Reconciled code summary inside a report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportCode {
    pub code: String,
    pub sources: Vec<&'static str>,
    pub confidence: f32,
    pub reads: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub absorbed: Vec<String>,
    pub ambiguous: bool,
}

impl From<&ReconciledCode> for ReportCode {
    fn from(code: &ReconciledCode) -> Self {
        let mut sources: Vec<&'static str> = code.readings.iter().map(|r| r.source.as_str()).collect();
        sources.sort_unstable();
        sources.dedup();
        let mut absorbed: Vec<String> = code.absorbed.iter().map(|r| r.normalized()).collect();
        absorbed.sort();
        absorbed.dedup();
        Self {
            code: code.code.clone(),
            sources,
            confidence: code.confidence(),
            reads: code.readings.len(),
            absorbed,
            ambiguous: code.ambiguous,
        }
    }
}

/// Result of a retired session, as emitted to the report sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub site: String,
    pub sid: String,
    pub archway: ArchwayId,
    pub outcome: SessionOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Presence timestamp (epoch ms)
    pub t0: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_start: Option<u64>,
    /// Retirement timestamp (epoch ms)
    pub t1: u64,
    pub duration_ms: u64,
    pub reading_count: usize,
    pub codes: Vec<ReportCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<VerificationResult>,
    /// Raw readings, kept only when they need manual inspection
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub readings: Vec<BarcodeReading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobProgressSnapshot>,
}

impl SessionReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
