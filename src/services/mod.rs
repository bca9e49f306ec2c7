//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `orchestrator` - Central event processor and session lifecycle
//! - `presence` - Ultrasonic presence hysteresis per archway
//! - `coordinator` - Single capture window arbitration across archways
//! - `reconciler` - Multi-source decode reconciliation
//! - `verification` - Reconciled codes against the manifest
//! - `manifest_store` - Shared manifest snapshot
//! - `progress` - Job progress across sessions

pub mod coordinator;
pub mod manifest_store;
pub mod orchestrator;
pub mod presence;
pub mod progress;
pub mod reconciler;
pub mod verification;

// Re-export commonly used types
pub use manifest_store::{Manifest, ManifestStore};
pub use orchestrator::ScanOrchestrator;
