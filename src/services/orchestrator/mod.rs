//! Scan orchestration and event processing
//!
//! The ScanOrchestrator is the single serialized consumer of scan events. It
//! coordinates:
//! - Presence detection per archway (raw distance samples or presence events)
//! - Session lifecycle (open, capture, reconcile, verify, retire)
//! - Capture window arbitration across archways
//! - Session report emission to the egress worker
//!
//! Producers only ever submit `ScanEvent`s through the bounded queue; all
//! session state lives here.

mod handlers;

use crate::domain::session::{ScanSession, SessionState, SessionReport};
use crate::domain::types::{ArchwayId, ScanEvent, ScanEventKind};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::coordinator::{CaptureCoordinator, CoordinatorConfig};
use crate::services::manifest_store::ManifestStore;
use crate::services::presence::{PresenceConfig, PresenceMonitor};
use crate::services::progress::JobProgress;
use crate::services::reconciler::{DecodeReconciler, ReconcileConfig};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Upper bound on how long the loop sleeps when nothing is scheduled
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Central event processor for scan sessions
pub struct ScanOrchestrator {
    /// Live (non-idle) sessions by archway
    pub(crate) sessions: FxHashMap<ArchwayId, ScanSession>,
    /// Presence hysteresis per configured archway
    pub(crate) monitors: FxHashMap<ArchwayId, PresenceMonitor>,
    /// Single system-wide capture window
    pub(crate) coordinator: CaptureCoordinator,
    pub(crate) reconciler: DecodeReconciler,
    /// Expected codes for the current job
    pub(crate) manifest: ManifestStore,
    pub(crate) progress: JobProgress,
    pub(crate) config: Config,
    pub(crate) metrics: Arc<Metrics>,
    /// Retired session reports for the egress worker
    pub(crate) report_tx: mpsc::Sender<SessionReport>,
    /// Latest instant handed to the state machines; time never runs backwards
    pub(crate) last_tick: Option<Instant>,
}

impl ScanOrchestrator {
    pub fn new(
        config: Config,
        manifest: ManifestStore,
        metrics: Arc<Metrics>,
        report_tx: mpsc::Sender<SessionReport>,
    ) -> Self {
        let presence = PresenceConfig {
            trigger_in: config.presence_trigger_in(),
            release_in: config.presence_release_in(),
            hard_min_in: config.presence_hard_min_in(),
            max_in: config.presence_max_in(),
            present_samples: config.presence_present_samples(),
            absent_samples: config.presence_absent_samples(),
        };
        let monitors = config
            .archway_ids()
            .iter()
            .map(|&id| (ArchwayId(id), PresenceMonitor::new(ArchwayId(id), presence)))
            .collect();

        let coordinator = CaptureCoordinator::new(CoordinatorConfig {
            window: Duration::from_millis(config.window_ms()),
            guard: Duration::from_millis(config.guard_ms()),
            max_wait: Duration::from_millis(config.max_wait_ms()),
        });
        let reconciler = DecodeReconciler::new(ReconcileConfig {
            near_duplicate_distance: config.near_duplicate_distance(),
            confidence_tie_epsilon: config.confidence_tie_epsilon(),
            min_confidence: config.min_confidence(),
        });

        let mut progress = JobProgress::new();
        progress.reset(manifest.snapshot());
        metrics.set_manifest_entries(manifest.snapshot().map_or(0, |m| m.len() as u64));

        Self {
            sessions: FxHashMap::default(),
            monitors,
            coordinator,
            reconciler,
            manifest,
            progress,
            config,
            metrics,
            report_tx,
            last_tick: None,
        }
    }

    /// Consume events until the queue closes or shutdown is signalled
    pub async fn run(&mut self, mut event_rx: mpsc::Receiver<ScanEvent>, mut shutdown: watch::Receiver<bool>) {
        info!(archways = ?self.config.archway_ids(), "orchestrator_started");

        loop {
            let wake_at = self.next_wakeup().unwrap_or_else(|| Instant::now() + IDLE_TICK);

            // Timer fires only once the queue is empty; queued readings land before their window closes
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = event_rx.recv() => {
                    match event {
                        Some(e) => self.process_event(e),
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake_at)) => {
                    self.tick_at(Instant::now());
                }
            }
        }

        info!(live_sessions = %self.sessions.len(), "orchestrator_stopped");
    }

    /// Process a single event, dispatching to the appropriate handler
    ///
    /// Uses the event's `received_at` as the current time, after first
    /// applying any deadlines that fell due before it. An event stamped
    /// earlier than the last tick is handled at the last tick.
    pub fn process_event(&mut self, event: ScanEvent) {
        let process_start = Instant::now();
        let now = self.advance_clock(event.received_at);
        self.tick_at(now);

        match event.kind {
            ScanEventKind::Distance { archway, sensor, distance_in } => {
                self.handle_distance(archway, sensor, distance_in, event.event_time, now);
            }
            ScanEventKind::Presence { archway, present } => {
                self.handle_presence(archway, present, event.event_time, now);
            }
            ScanEventKind::Reading { archway, source, code, confidence } => {
                self.handle_reading(archway, source, &code, confidence, event.event_time, now);
            }
            ScanEventKind::ManifestLoad(entries) => {
                self.handle_manifest_load(entries);
            }
        }

        self.metrics.set_active_sessions(self.sessions.len() as u64);
        let latency_us = process_start.elapsed().as_micros() as u64;
        self.metrics.record_event_processed(latency_us);
    }

    /// Apply every deadline due at `now`: close elapsed windows, then grant
    /// or time out pending window requests
    pub fn tick_at(&mut self, now: Instant) {
        let now = self.advance_clock(now);
        let mut elapsed: Vec<(u64, ArchwayId)> = self
            .sessions
            .values()
            .filter(|s| s.window_elapsed_at(now))
            .filter_map(|s| s.window.map(|w| (w.seq, s.archway)))
            .collect();
        elapsed.sort_unstable();
        for (_, archway) in elapsed {
            self.close_window(archway, now);
        }

        for event in self.coordinator.poll(now) {
            self.handle_coordinator_event(event, now);
        }

        self.metrics.set_active_sessions(self.sessions.len() as u64);
    }

    /// Clamp `now` to the latest instant already seen
    fn advance_clock(&mut self, now: Instant) -> Instant {
        let now = self.last_tick.map_or(now, |last| now.max(last));
        self.last_tick = Some(now);
        now
    }

    /// Earliest instant at which `tick_at` has work to do
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.coordinator.next_wakeup()
    }

    /// Current state for an archway (`Idle` when no session is live)
    pub fn session_state(&self, archway: ArchwayId) -> SessionState {
        self.sessions.get(&archway).map_or(SessionState::Idle, |s| s.state())
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }
}
