//! Decode reconciliation
//!
//! Collapses the raw decode attempts of one capture window into one code per
//! physical label. Cameras and the IR scanner frequently disagree by a
//! character or two on the same label, so groups whose values are within a
//! small edit distance compete and the preferred one absorbs the rest.
//!
//! Preference order between two competing groups:
//! 1. higher confidence (differences within `confidence_tie_epsilon` tie)
//! 2. camera over infrared
//! 3. earliest capture timestamp
//!
//! When all three tie, both codes are emitted and flagged ambiguous.

use crate::domain::result::{ReconciledCode, Reconciliation};
use crate::domain::types::BarcodeReading;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileConfig {
    /// Maximum Levenshtein distance for two codes to be one label (0 disables)
    pub near_duplicate_distance: usize,
    pub confidence_tie_epsilon: f32,
    /// Camera reads below this are dropped
    pub min_confidence: f32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { near_duplicate_distance: 1, confidence_tie_epsilon: 0.05, min_confidence: 0.25 }
    }
}

pub struct DecodeReconciler {
    config: ReconcileConfig,
}

impl DecodeReconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Reconcile all readings collected in one window
    ///
    /// The result depends only on the set of distinct readings, never on
    /// their arrival order or on duplicates.
    pub fn reconcile(&self, readings: &[BarcodeReading]) -> Reconciliation {
        let mut groups: BTreeMap<String, SmallVec<[BarcodeReading; 4]>> = BTreeMap::new();
        let mut dropped: Vec<&BarcodeReading> = Vec::new();

        for reading in readings {
            let code = reading.normalized();
            if code.is_empty() || reading.confidence.is_nan() || reading.confidence < self.config.min_confidence {
                dropped.push(reading);
                continue;
            }
            groups.entry(code).or_default().push(reading.clone());
        }

        // Exact duplicates count once
        dropped.sort_by(|a, b| reading_order(a, b));
        dropped.dedup();
        let discarded = dropped.len();

        let mut remaining: Vec<ReconciledCode> = groups
            .into_iter()
            .map(|(code, mut group)| {
                group.sort_by(reading_order);
                group.dedup();
                ReconciledCode::new(&code, group)
            })
            .collect();

        let mut codes = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let best = (1..remaining.len()).fold(0, |best, i| {
                if self.prefer(&remaining[i], &remaining[best]) == Ordering::Greater {
                    i
                } else {
                    best
                }
            });
            let mut winner = remaining.remove(best);

            let mut i = 0;
            while i < remaining.len() {
                if !self.is_near_duplicate(&winner.code, &remaining[i].code) {
                    i += 1;
                    continue;
                }
                let mut other = remaining.remove(i);
                if self.prefer(&winner, &other) == Ordering::Equal {
                    debug!(code = %winner.code, other = %other.code, "reconcile_tie_unresolved");
                    winner.ambiguous = true;
                    other.ambiguous = true;
                    codes.push(other);
                } else {
                    debug!(winner = %winner.code, loser = %other.code, "reconcile_absorbed");
                    winner.absorbed.extend(other.readings);
                    winner.absorbed.append(&mut other.absorbed);
                }
            }
            winner.absorbed.sort_by(reading_order);
            codes.push(winner);
        }

        codes.sort_by(|a, b| a.code.cmp(&b.code));
        let ambiguous = codes.iter().any(|c| c.ambiguous);

        Reconciliation { codes, ambiguous, discarded }
    }

    fn is_near_duplicate(&self, a: &str, b: &str) -> bool {
        self.config.near_duplicate_distance > 0 && strsim::levenshtein(a, b) <= self.config.near_duplicate_distance
    }

    /// `Greater` when `a` should win over `b`
    fn prefer(&self, a: &ReconciledCode, b: &ReconciledCode) -> Ordering {
        let (ca, cb) = (a.confidence(), b.confidence());
        if (ca - cb).abs() > self.config.confidence_tie_epsilon {
            return ca.partial_cmp(&cb).unwrap_or(Ordering::Equal);
        }
        match (a.has_camera(), b.has_camera()) {
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            _ => {}
        }
        b.first_ts().cmp(&a.first_ts())
    }
}

/// Timestamp, then source, then confidence descending; code breaks the rest
fn reading_order(a: &BarcodeReading, b: &BarcodeReading) -> Ordering {
    a.ts.cmp(&b.ts)
        .then(a.source.cmp(&b.source))
        .then(b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal))
        .then_with(|| a.code.cmp(&b.code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::ReadingSource;

    fn reconciler() -> DecodeReconciler {
        DecodeReconciler::new(ReconcileConfig::default())
    }

    #[test]
    fn test_camera_and_ir_agree() {
        let readings = vec![BarcodeReading::camera("PAL12345", 0.82, 100), BarcodeReading::infrared("pal12345", 120)];
        let r = reconciler().reconcile(&readings);

        assert_eq!(r.code_values(), vec!["PAL12345"]);
        assert_eq!(r.codes[0].readings.len(), 2);
        assert!(!r.ambiguous);
    }

    #[test]
    fn test_duplicate_reading_is_idempotent() {
        let once = vec![BarcodeReading::camera("PAL111", 0.9, 100)];
        let twice = vec![BarcodeReading::camera("PAL111", 0.9, 100), BarcodeReading::camera("PAL111", 0.9, 100)];
        assert_eq!(reconciler().reconcile(&once), reconciler().reconcile(&twice));
    }

    #[test]
    fn test_duplicate_filtered_reading_counted_once() {
        let once = vec![BarcodeReading::camera("PAL111", 0.1, 100)];
        let twice = vec![BarcodeReading::camera("PAL111", 0.1, 100), BarcodeReading::camera("PAL111", 0.1, 100)];
        let r = reconciler().reconcile(&twice);
        assert_eq!(r.discarded, 1);
        assert_eq!(reconciler().reconcile(&once), r);

        // Same code at a different time is a separate attempt
        let apart = vec![BarcodeReading::camera("PAL111", 0.1, 100), BarcodeReading::camera("PAL111", 0.1, 200)];
        assert_eq!(reconciler().reconcile(&apart).discarded, 2);
    }

    #[test]
    fn test_arrival_order_irrelevant() {
        let mut readings = vec![
            BarcodeReading::camera("PAL222", 0.9, 100),
            BarcodeReading::infrared("PAL223", 110),
            BarcodeReading::new(ReadingSource::CameraRight, "PAL500", 0.7, 90),
            BarcodeReading::camera("PAL500", 0.6, 95),
        ];
        let forward = reconciler().reconcile(&readings);
        readings.reverse();
        assert_eq!(forward, reconciler().reconcile(&readings));
    }

    #[test]
    fn test_near_duplicate_higher_confidence_wins() {
        // IR at 1.0 beats camera at 0.9: confidence is checked before source
        let readings = vec![BarcodeReading::camera("PAL222", 0.9, 100), BarcodeReading::infrared("PAL223", 105)];
        let r = reconciler().reconcile(&readings);

        assert_eq!(r.code_values(), vec!["PAL223"]);
        assert_eq!(r.codes[0].absorbed.len(), 1);
        assert_eq!(r.codes[0].absorbed[0].code, "PAL222");
        assert!(!r.ambiguous);
    }

    #[test]
    fn test_confidence_tie_prefers_camera() {
        let readings = vec![BarcodeReading::camera("PAL222", 0.98, 100), BarcodeReading::infrared("PAL223", 90)];
        let r = reconciler().reconcile(&readings);
        assert_eq!(r.code_values(), vec!["PAL222"]);
    }

    #[test]
    fn test_source_tie_prefers_earliest() {
        let readings = vec![
            BarcodeReading::camera("PAL222", 0.9, 150),
            BarcodeReading::new(ReadingSource::CameraRight, "PAL223", 0.9, 100),
        ];
        let r = reconciler().reconcile(&readings);
        assert_eq!(r.code_values(), vec!["PAL223"]);
    }

    #[test]
    fn test_full_tie_is_ambiguous() {
        let readings = vec![
            BarcodeReading::camera("PAL222", 0.9, 100),
            BarcodeReading::new(ReadingSource::CameraRight, "PAL223", 0.9, 100),
        ];
        let r = reconciler().reconcile(&readings);

        assert_eq!(r.code_values(), vec!["PAL222", "PAL223"]);
        assert!(r.codes.iter().all(|c| c.ambiguous));
        assert!(r.ambiguous);
        assert_eq!(r.ambiguous_count(), 2);
    }

    #[test]
    fn test_distinct_codes_kept_apart() {
        let readings = vec![BarcodeReading::camera("PAL111", 0.9, 100), BarcodeReading::camera("PAL999", 0.9, 100)];
        let r = reconciler().reconcile(&readings);
        assert_eq!(r.code_values(), vec!["PAL111", "PAL999"]);
        assert!(!r.ambiguous);
    }

    #[test]
    fn test_low_confidence_and_empty_dropped() {
        let readings = vec![
            BarcodeReading::camera("PAL1", 0.1, 100),
            BarcodeReading::camera("   ", 0.9, 100),
            BarcodeReading::camera("PAL2", 0.5, 100),
        ];
        let r = reconciler().reconcile(&readings);
        assert_eq!(r.code_values(), vec!["PAL2"]);
        assert_eq!(r.discarded, 2);
    }

    #[test]
    fn test_distance_zero_disables_merging() {
        let reconciler = DecodeReconciler::new(ReconcileConfig { near_duplicate_distance: 0, ..Default::default() });
        let readings = vec![BarcodeReading::camera("PAL222", 0.9, 100), BarcodeReading::infrared("PAL223", 105)];
        assert_eq!(reconciler.reconcile(&readings).code_values(), vec!["PAL222", "PAL223"]);
    }

    #[test]
    fn test_empty_window() {
        let r = reconciler().reconcile(&[]);
        assert!(r.codes.is_empty());
        assert!(!r.ambiguous);
    }
}
