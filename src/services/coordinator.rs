//! Capture window arbitration across archways
//!
//! One capture window exists system-wide, so neighbouring archways never
//! capture at the same time and cannot read each other's labels. Requests that
//! cannot be granted immediately wait in a FIFO holding at most one request per
//! archway. The coordinator never reads the clock itself: every operation takes
//! `now`, and `next_wakeup` tells the event loop when polling can next change
//! anything.

use crate::domain::error::ScanError;
use crate::domain::session::CaptureWindow;
use crate::domain::types::{ArchwayId, SessionId};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Nominal capture window duration
    pub window: Duration,
    /// Quiet interval between one window closing and the next opening
    pub guard: Duration,
    /// Longest a request may wait before it fails with `window-timeout`
    pub max_wait: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(2000),
            guard: Duration::from_millis(200),
            max_wait: Duration::from_millis(5000),
        }
    }
}

/// A queued window request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    pub archway: ArchwayId,
    pub sid: SessionId,
    pub duration: Duration,
    pub requested_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowDecision {
    Granted(CaptureWindow),
    /// Queued; carries the request it replaced for the same archway, if any
    Deferred { displaced: Option<WindowRequest> },
}

/// State changes produced by `poll`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    Granted { sid: SessionId, window: CaptureWindow, waited: Duration },
    TimedOut { archway: ArchwayId, sid: SessionId, waited: Duration },
}

#[derive(Debug, Clone)]
struct ActiveWindow {
    window: CaptureWindow,
    sid: SessionId,
}

pub struct CaptureCoordinator {
    config: CoordinatorConfig,
    active: Option<ActiveWindow>,
    queue: VecDeque<WindowRequest>,
    /// When the last window closed; the guard interval runs from here
    last_closed: Option<Instant>,
    next_seq: u64,
}

impl CaptureCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config, active: None, queue: VecDeque::with_capacity(4), last_closed: None, next_seq: 1 }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The window currently open, if any
    pub fn active(&self) -> Option<&CaptureWindow> {
        self.active.as_ref().map(|a| &a.window)
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_pending(&self, archway: ArchwayId) -> bool {
        self.queue.iter().any(|r| r.archway == archway)
    }

    /// Request a window for `archway`
    ///
    /// Granted immediately when the slot is free, nobody is queued ahead and
    /// the guard interval has passed; otherwise queued.
    pub fn request_window(
        &mut self,
        archway: ArchwayId,
        sid: SessionId,
        duration: Duration,
        now: Instant,
    ) -> Result<WindowDecision, ScanError> {
        if self.active.as_ref().is_some_and(|a| a.window.archway == archway) {
            return Err(ScanError::WindowAlreadyHeld(archway));
        }

        let request = WindowRequest { archway, sid, duration, requested_at: now };

        if self.queue.is_empty() && self.slot_ready_at(now) {
            let window = self.grant(request, now);
            return Ok(WindowDecision::Granted(window));
        }

        // Only the newest presence matters: replace in place, keep queue position
        if let Some(slot) = self.queue.iter_mut().find(|r| r.archway == archway) {
            let displaced = std::mem::replace(slot, request);
            debug!(archway = %archway, displaced_sid = %displaced.sid, "window_request_replaced");
            return Ok(WindowDecision::Deferred { displaced: Some(displaced) });
        }

        debug!(
            archway = %archway,
            sid = %request.sid,
            queue_depth = %(self.queue.len() + 1),
            "window_request_queued"
        );
        self.queue.push_back(request);
        Ok(WindowDecision::Deferred { displaced: None })
    }

    /// Close the archway's window after it ran its course
    ///
    /// The guard interval counts from the nominal deadline, so a late close
    /// does not push the next grant further out.
    pub fn release(&mut self, archway: ArchwayId, now: Instant) -> bool {
        match &self.active {
            Some(a) if a.window.archway == archway => {
                let closed_at = now.min(a.window.deadline);
                debug!(archway = %archway, seq = %a.window.seq, "window_released");
                self.active = None;
                self.last_closed = Some(closed_at);
                true
            }
            _ => false,
        }
    }

    /// Release the archway's window early, or withdraw its pending request
    pub fn cancel(&mut self, archway: ArchwayId, now: Instant) -> bool {
        if self.active.as_ref().is_some_and(|a| a.window.archway == archway) {
            info!(archway = %archway, "window_cancelled");
            self.active = None;
            self.last_closed = Some(now);
            return true;
        }

        let before = self.queue.len();
        self.queue.retain(|r| r.archway != archway);
        let withdrawn = self.queue.len() != before;
        if withdrawn {
            debug!(archway = %archway, "window_request_withdrawn");
        }
        withdrawn
    }

    /// Expire overdue requests, then grant the queue head if the slot is ready
    pub fn poll(&mut self, now: Instant) -> Vec<CoordinatorEvent> {
        let mut events = Vec::new();
        let max_wait = self.config.max_wait;

        let mut i = 0;
        while i < self.queue.len() {
            let waited = now.saturating_duration_since(self.queue[i].requested_at);
            if waited >= max_wait {
                if let Some(expired) = self.queue.remove(i) {
                    warn!(
                        archway = %expired.archway,
                        sid = %expired.sid,
                        waited_ms = %waited.as_millis(),
                        "window_request_timeout"
                    );
                    events.push(CoordinatorEvent::TimedOut { archway: expired.archway, sid: expired.sid, waited });
                }
            } else {
                i += 1;
            }
        }

        if self.slot_ready_at(now) {
            if let Some(request) = self.queue.pop_front() {
                let waited = now.saturating_duration_since(request.requested_at);
                let sid = request.sid.clone();
                let window = self.grant(request, now);
                events.push(CoordinatorEvent::Granted { sid, window, waited });
            }
        }

        events
    }

    /// Earliest instant at which `poll` (or closing the open window) can make progress
    pub fn next_wakeup(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |t: Instant| next = Some(next.map_or(t, |n: Instant| n.min(t)));

        if let Some(a) = &self.active {
            consider(a.window.deadline);
        } else if !self.queue.is_empty() {
            consider(self.guard_until().unwrap_or_else(|| {
                self.queue.iter().map(|r| r.requested_at).min().unwrap_or_else(Instant::now)
            }));
        }
        for request in &self.queue {
            consider(request.requested_at + self.config.max_wait);
        }
        next
    }

    fn guard_until(&self) -> Option<Instant> {
        self.last_closed.map(|closed| closed + self.config.guard)
    }

    fn slot_ready_at(&self, now: Instant) -> bool {
        self.active.is_none() && self.guard_until().map_or(true, |until| now >= until)
    }

    fn grant(&mut self, request: WindowRequest, now: Instant) -> CaptureWindow {
        let window = CaptureWindow {
            seq: self.next_seq,
            archway: request.archway,
            started_at: now,
            deadline: now + request.duration,
        };
        self.next_seq += 1;
        info!(
            archway = %request.archway,
            sid = %request.sid,
            seq = %window.seq,
            duration_ms = %request.duration.as_millis(),
            waited_ms = %now.saturating_duration_since(request.requested_at).as_millis(),
            "window_granted"
        );
        self.active = Some(ActiveWindow { window, sid: request.sid });
        window
    }
}
