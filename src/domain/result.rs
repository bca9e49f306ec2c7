//! Reconciliation and verification result types

use crate::domain::types::BarcodeReading;
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};

/// One authoritative code per physical label, with the readings that support it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledCode {
    /// Normalized code value
    pub code: String,
    /// Readings whose normalized value equals `code`, ordered by timestamp
    pub readings: SmallVec<[BarcodeReading; 4]>,
    /// Near-duplicate readings that lost the tie-break to this code
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub absorbed: Vec<BarcodeReading>,
    /// Set when a tie-break could not separate this code from a near-duplicate
    pub ambiguous: bool,
}

impl ReconciledCode {
    pub fn new(code: &str, readings: SmallVec<[BarcodeReading; 4]>) -> Self {
        Self { code: code.to_string(), readings, absorbed: Vec::new(), ambiguous: false }
    }

    /// Best confidence among the supporting readings
    pub fn confidence(&self) -> f32 {
        self.readings.iter().map(|r| r.confidence).fold(0.0, f32::max)
    }

    /// True if any supporting reading came from a camera
    pub fn has_camera(&self) -> bool {
        self.readings.iter().any(|r| r.source.is_camera())
    }

    /// Earliest supporting capture timestamp
    pub fn first_ts(&self) -> u64 {
        self.readings.iter().map(|r| r.ts).min().unwrap_or(u64::MAX)
    }
}

/// Output of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reconciliation {
    /// Reconciled codes sorted by code value
    pub codes: Vec<ReconciledCode>,
    /// True if any tie-break failed
    pub ambiguous: bool,
    /// Distinct readings dropped before grouping (empty code or low confidence)
    pub discarded: usize,
}

impl Reconciliation {
    pub fn ambiguous_count(&self) -> usize {
        self.codes.iter().filter(|c| c.ambiguous).count()
    }

    pub fn code_values(&self) -> Vec<&str> {
        self.codes.iter().map(|c| c.code.as_str()).collect()
    }
}

/// Manifest comparison outcome
///
/// Classification is per occurrence: each observed occurrence of a code is
/// either matched (up to the expected quantity) or extra.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub matched: BTreeSet<String>,
    pub missing: BTreeSet<String>,
    /// Unlisted codes and surplus occurrences, with their occurrence count
    pub extra: BTreeMap<String, u32>,
    /// `seen - expected` per manifest entry
    pub deltas: BTreeMap<String, i64>,
}

impl VerificationResult {
    /// Zero missing and zero extra
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

/// Progress through the current manifest across sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobProgressSnapshot {
    /// Matched occurrences so far
    pub scanned: u32,
    /// Total expected occurrences on the manifest
    pub expected: u32,
    pub sessions: u32,
    pub complete: bool,
}
