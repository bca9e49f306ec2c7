//! Manifest store - expected codes for the current shipping job
//!
//! Read-mostly. A load replaces the whole manifest behind one `Arc` swap, so
//! readers holding a snapshot never observe a partial update. An empty load
//! leaves the store unloaded.

use crate::domain::error::ScanError;
use crate::domain::types::{normalize_code, ManifestEntry};
use anyhow::Context;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Immutable manifest snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Entries in first-appearance order, one per normalized code
    entries: Vec<ManifestEntry>,
    by_code: BTreeMap<String, u32>,
}

impl Manifest {
    /// Build a manifest, merging duplicate codes by summing quantities
    pub fn new(entries: Vec<ManifestEntry>) -> Result<Self, ScanError> {
        let mut merged: Vec<ManifestEntry> = Vec::with_capacity(entries.len());
        let mut by_code: BTreeMap<String, u32> = BTreeMap::new();

        for entry in entries {
            let code = normalize_code(&entry.code);
            if code.is_empty() {
                return Err(ScanError::InvalidManifest("empty code".to_string()));
            }
            if entry.quantity == 0 {
                return Err(ScanError::InvalidManifest(format!("{code}: quantity must be >= 1")));
            }
            match by_code.get_mut(&code) {
                Some(qty) => {
                    *qty = qty.checked_add(entry.quantity).ok_or_else(|| {
                        ScanError::InvalidManifest(format!("{code}: quantity overflows u32"))
                    })?;
                    if let Some(existing) = merged.iter_mut().find(|e| e.code == code) {
                        existing.quantity = *qty;
                    }
                }
                None => {
                    by_code.insert(code.clone(), entry.quantity);
                    merged.push(ManifestEntry { code, quantity: entry.quantity });
                }
            }
        }

        Ok(Self { entries: merged, by_code })
    }

    /// Parse `barcodes.txt` style text
    ///
    /// Tokens are split on whitespace and commas. A code is listed once no
    /// matter how often it repeats. `CODE*N` sets a quantity of N; when one
    /// code carries several quantities the largest is kept. A leading UTF-8
    /// BOM is ignored.
    pub fn parse_text(text: &str) -> Result<Self, ScanError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut entries: Vec<ManifestEntry> = Vec::new();

        for token in text.split(|c: char| c.is_whitespace() || c == ',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (code, quantity) = match token.rsplit_once('*') {
                Some((code, qty)) => {
                    let qty = qty.parse::<u32>().map_err(|_| {
                        ScanError::InvalidManifest(format!("bad quantity in '{token}'"))
                    })?;
                    (code, qty)
                }
                None => (token, 1),
            };
            let entry = ManifestEntry::new(code, quantity);
            match entries.iter_mut().find(|e| e.code == entry.code) {
                Some(existing) => existing.quantity = existing.quantity.max(entry.quantity),
                None => entries.push(entry),
            }
        }

        Self::new(entries)
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn quantity(&self, code: &str) -> Option<u32> {
        self.by_code.get(code).copied()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.by_code.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of expected quantities, saturating at `u32::MAX`
    pub fn total_quantity(&self) -> u32 {
        self.entries.iter().fold(0u32, |total, e| total.saturating_add(e.quantity))
    }
}

/// Shared, atomically replaced manifest holder
#[derive(Debug, Clone, Default)]
pub struct ManifestStore {
    current: Arc<RwLock<Option<Arc<Manifest>>>>,
}

impl ManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the manifest. An empty list unloads the store.
    ///
    /// Returns the number of distinct entries now loaded.
    pub fn load(&self, entries: Vec<ManifestEntry>) -> Result<usize, ScanError> {
        if entries.is_empty() {
            self.unload();
            return Ok(0);
        }
        let manifest = Manifest::new(entries)?;
        Ok(self.install(manifest))
    }

    /// Install an already parsed manifest
    pub fn install(&self, manifest: Manifest) -> usize {
        let count = manifest.len();
        if count == 0 {
            self.unload();
            return 0;
        }
        info!(entries = %count, total_quantity = %manifest.total_quantity(), "manifest_loaded");
        *self.current.write() = Some(Arc::new(manifest));
        count
    }

    /// Load a manifest text file from disk
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<usize> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest file {}", path.display()))?;
        let manifest = Manifest::parse_text(&text)
            .with_context(|| format!("Failed to parse manifest file {}", path.display()))?;
        if manifest.is_empty() {
            warn!(path = %path.display(), "manifest_file_empty");
        }
        Ok(self.install(manifest))
    }

    pub fn unload(&self) {
        let was_loaded = self.current.write().take().is_some();
        if was_loaded {
            warn!("manifest_unloaded");
        }
    }

    /// Current snapshot, or `None` when not loaded
    pub fn snapshot(&self) -> Option<Arc<Manifest>> {
        self.current.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.current.read().is_some()
    }
}
