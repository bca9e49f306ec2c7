//! Error taxonomy for the scan core
//!
//! Every variant carries a stable short code (`ScanError::code`) that is
//! written into session reports and log lines.

use crate::domain::session::SessionState;
use crate::domain::types::ArchwayId;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScanError {
    #[error("archway {archway} waited {waited_ms} ms without a capture window")]
    WindowTimeout { archway: ArchwayId, waited_ms: u64 },
    #[error("capture window closed without any decode attempt")]
    NoReading,
    #[error("reconciliation left {0} conflicting codes unresolved")]
    AmbiguousReconciliation(usize),
    #[error("manifest not loaded")]
    ManifestNotLoaded,
    #[error("presence lost on archway {0} before the capture completed")]
    PresenceLost(ArchwayId),
    #[error("archway {0} already holds the capture window")]
    WindowAlreadyHeld(ArchwayId),
    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },
    #[error("invalid reading: {0}")]
    InvalidReading(String),
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
}

impl ScanError {
    /// Stable code used in reports
    pub fn code(&self) -> &'static str {
        match self {
            ScanError::WindowTimeout { .. } => "window-timeout",
            ScanError::NoReading => "no-reading",
            ScanError::AmbiguousReconciliation(_) => "ambiguous-reconciliation",
            ScanError::ManifestNotLoaded => "manifest-not-loaded",
            ScanError::PresenceLost(_) => "presence-lost",
            ScanError::WindowAlreadyHeld(_) => "window-already-held",
            ScanError::InvalidTransition { .. } => "invalid-transition",
            ScanError::InvalidReading(_) => "invalid-reading",
            ScanError::InvalidManifest(_) => "invalid-manifest",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            ScanError::WindowTimeout { archway: ArchwayId(2), waited_ms: 5000 }.code(),
            "window-timeout"
        );
        assert_eq!(ScanError::ManifestNotLoaded.code(), "manifest-not-loaded");
        assert_eq!(ScanError::AmbiguousReconciliation(2).code(), "ambiguous-reconciliation");
    }

    #[test]
    fn test_display() {
        let err = ScanError::WindowTimeout { archway: ArchwayId(2), waited_ms: 5000 };
        assert_eq!(err.to_string(), "archway 2 waited 5000 ms without a capture window");
    }
}
