//! Domain models - core business types and session model
//!
//! This module contains the canonical data types used throughout the system:
//! - `ScanSession` - one pallet's pass through an archway
//! - `ScanEvent` - inputs to the orchestrator (presence, readings, manifest)
//! - `BarcodeReading` - a single decode attempt from a camera or the IR reader
//! - `VerificationResult` - reconciled codes compared with the manifest
//! - `ScanError` - failure reasons with stable codes

pub mod error;
pub mod result;
pub mod session;
pub mod types;

// Re-export commonly used types at module level
pub use error::ScanError;
pub use session::{ScanSession, SessionOutcome, SessionReport, SessionState};
pub use types::{ArchwayId, BarcodeReading, ManifestEntry, ReadingSource, ScanEvent, ScanEventKind};
