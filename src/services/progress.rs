//! Job progress across sessions
//!
//! Counts matched occurrences against the manifest the sessions were verified
//! with. A different manifest snapshot starts a new job.

use crate::domain::result::{JobProgressSnapshot, ReconciledCode};
use crate::services::manifest_store::Manifest;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default)]
pub struct JobProgress {
    manifest: Option<Arc<Manifest>>,
    seen: BTreeMap<String, u32>,
    sessions: u32,
    completed: bool,
}

impl JobProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new job for `manifest`
    pub fn reset(&mut self, manifest: Option<Arc<Manifest>>) {
        self.manifest = manifest;
        self.seen.clear();
        self.sessions = 0;
        self.completed = false;
    }

    /// Add one verified session's codes
    pub fn record(&mut self, manifest: &Arc<Manifest>, codes: &[ReconciledCode]) -> JobProgressSnapshot {
        if !self.manifest.as_ref().is_some_and(|m| Arc::ptr_eq(m, manifest)) {
            self.reset(Some(Arc::clone(manifest)));
        }

        self.sessions += 1;
        for code in codes {
            if manifest.contains(&code.code) {
                *self.seen.entry(code.code.clone()).or_default() += 1;
            }
        }

        let snapshot = self.snapshot();
        if snapshot.complete && !self.completed {
            self.completed = true;
            info!(
                scanned = %snapshot.scanned,
                expected = %snapshot.expected,
                sessions = %snapshot.sessions,
                "manifest_complete"
            );
        }
        snapshot
    }

    pub fn snapshot(&self) -> JobProgressSnapshot {
        let Some(manifest) = &self.manifest else {
            return JobProgressSnapshot { sessions: self.sessions, ..Default::default() };
        };

        let scanned = manifest
            .entries()
            .iter()
            .map(|e| self.seen.get(&e.code).copied().unwrap_or(0).min(e.quantity))
            .fold(0u32, u32::saturating_add);
        let expected = manifest.total_quantity();

        JobProgressSnapshot { scanned, expected, sessions: self.sessions, complete: expected > 0 && scanned >= expected }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{BarcodeReading, ManifestEntry};
    use smallvec::smallvec;

    fn code(value: &str) -> ReconciledCode {
        ReconciledCode::new(value, smallvec![BarcodeReading::infrared(value, 1)])
    }

    fn manifest() -> Arc<Manifest> {
        Arc::new(Manifest::new(vec![ManifestEntry::new("PAL1", 2), ManifestEntry::new("PAL2", 1)]).unwrap())
    }

    #[test]
    fn test_progress_accumulates_until_complete() {
        let m = manifest();
        let mut progress = JobProgress::new();

        let snap = progress.record(&m, &[code("PAL1")]);
        assert_eq!((snap.scanned, snap.expected, snap.complete), (1, 3, false));

        progress.record(&m, &[code("PAL1"), code("PAL9")]);
        let snap = progress.record(&m, &[code("PAL2")]);
        assert_eq!(snap.scanned, 3);
        assert_eq!(snap.sessions, 3);
        assert!(snap.complete);
    }

    #[test]
    fn test_surplus_not_counted_twice() {
        let m = manifest();
        let mut progress = JobProgress::new();
        for _ in 0..4 {
            progress.record(&m, &[code("PAL1")]);
        }
        assert_eq!(progress.snapshot().scanned, 2);
    }

    #[test]
    fn test_new_manifest_restarts_job() {
        let mut progress = JobProgress::new();
        progress.record(&manifest(), &[code("PAL1")]);

        let next = manifest();
        let snap = progress.record(&next, &[code("PAL2")]);
        assert_eq!(snap.scanned, 1);
        assert_eq!(snap.sessions, 1);
    }
}
