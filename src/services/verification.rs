//! Manifest verification
//!
//! Pure comparison of reconciled codes against one manifest snapshot. Each
//! reconciled code is one observed occurrence; occurrences up to a manifest
//! entry's quantity are matched, the rest are extra.

use crate::domain::error::ScanError;
use crate::domain::result::{ReconciledCode, VerificationResult};
use crate::services::manifest_store::Manifest;
use std::collections::BTreeMap;

pub struct VerificationEngine;

impl VerificationEngine {
    /// Verify a multiset of reconciled codes (one session or several)
    pub fn verify(codes: &[ReconciledCode], manifest: Option<&Manifest>) -> Result<VerificationResult, ScanError> {
        let mut seen: BTreeMap<&str, u32> = BTreeMap::new();
        for code in codes {
            *seen.entry(code.code.as_str()).or_default() += 1;
        }
        Self::verify_counts(&seen, manifest)
    }

    /// Verify pre-counted occurrences
    pub fn verify_counts(seen: &BTreeMap<&str, u32>, manifest: Option<&Manifest>) -> Result<VerificationResult, ScanError> {
        let manifest = match manifest {
            Some(m) if !m.is_empty() => m,
            _ => return Err(ScanError::ManifestNotLoaded),
        };

        let mut result = VerificationResult::default();

        for entry in manifest.entries() {
            let count = seen.get(entry.code.as_str()).copied().unwrap_or(0);
            if count == 0 {
                result.missing.insert(entry.code.clone());
            } else {
                result.matched.insert(entry.code.clone());
            }
            if count > entry.quantity {
                result.extra.insert(entry.code.clone(), count - entry.quantity);
            }
            result.deltas.insert(entry.code.clone(), i64::from(count) - i64::from(entry.quantity));
        }

        for (&code, &count) in seen {
            if count > 0 && !manifest.contains(code) {
                result.extra.insert(code.to_string(), count);
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{BarcodeReading, ManifestEntry};
    use smallvec::smallvec;

    fn code(value: &str) -> ReconciledCode {
        ReconciledCode::new(value, smallvec![BarcodeReading::camera(value, 0.9, 100)])
    }

    fn manifest(entries: &[(&str, u32)]) -> Manifest {
        Manifest::new(entries.iter().map(|(c, q)| ManifestEntry::new(c, *q)).collect()).unwrap()
    }

    #[test]
    fn test_all_matched() {
        let m = manifest(&[("PAL12345", 1)]);
        let result = VerificationEngine::verify(&[code("PAL12345")], Some(&m)).unwrap();

        assert!(result.is_clean());
        assert!(result.matched.contains("PAL12345"));
        assert_eq!(result.deltas["PAL12345"], 0);
    }

    #[test]
    fn test_empty_window_all_missing() {
        let m = manifest(&[("PAL999", 1)]);
        let result = VerificationEngine::verify(&[], Some(&m)).unwrap();

        assert!(result.missing.contains("PAL999"));
        assert!(result.matched.is_empty());
        assert_eq!(result.deltas["PAL999"], -1);
    }

    #[test]
    fn test_unlisted_code_is_extra() {
        let m = manifest(&[("PAL1", 1)]);
        let result = VerificationEngine::verify(&[code("PAL1"), code("PAL7")], Some(&m)).unwrap();

        assert_eq!(result.extra.get("PAL7"), Some(&1));
        assert!(!result.is_clean());
    }

    #[test]
    fn test_surplus_occurrences_are_extra() {
        let m = manifest(&[("PAL1", 2)]);
        let codes = [code("PAL1"), code("PAL1"), code("PAL1")];
        let result = VerificationEngine::verify(&codes, Some(&m)).unwrap();

        assert!(result.matched.contains("PAL1"));
        assert_eq!(result.extra.get("PAL1"), Some(&1));
        assert_eq!(result.deltas["PAL1"], 1);
    }

    #[test]
    fn test_partial_quantity_is_only_a_delta() {
        let m = manifest(&[("PAL1", 3)]);
        let result = VerificationEngine::verify(&[code("PAL1")], Some(&m)).unwrap();

        assert!(result.is_clean());
        assert_eq!(result.deltas["PAL1"], -2);
    }

    #[test]
    fn test_refused_without_manifest() {
        let err = VerificationEngine::verify(&[code("PAL1")], None).unwrap_err();
        assert_eq!(err, ScanError::ManifestNotLoaded);

        let empty = Manifest::new(Vec::new()).unwrap();
        assert_eq!(VerificationEngine::verify(&[], Some(&empty)).unwrap_err(), ScanError::ManifestNotLoaded);
    }
}
