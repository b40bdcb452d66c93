//! Scan storage: trait plus in-memory and file-backed implementations.
//!
//! The file-backed store keeps one JSON document per request and one per
//! change record under a configurable directory:
//! ```text
//! {root}/
//!   scans/
//!     {scan_id}.json
//!   changes/
//!     {scan_id}.json
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use portwatch_core::{ChangeRecord, ScanId, ScanMode, ScanStatus};

use crate::{NewScan, ScanOutcome, StoredScan};

/// Errors that can occur during scan storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Scan not found: {0}")]
    NotFound(ScanId),

    #[error("Scan {0} is already finalized")]
    AlreadyFinalized(ScanId),

    #[error("Integrity check failed for scan {0}: stored hash does not match content")]
    IntegrityViolation(ScanId),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Query parameters for listing scans.
#[derive(Debug, Default)]
pub struct ScanQuery {
    /// Case-insensitive substring of the target literal.
    pub target: Option<String>,
    pub mode: Option<ScanMode>,
    pub status: Option<ScanStatus>,
    /// Only scans accepted at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only scans accepted at or before this instant.
    pub until: Option<DateTime<Utc>>,
}

/// The persistence collaborator used by the scan coordinator.
pub trait ScanStore: Send + Sync {
    /// Persist a newly accepted request in the `Running` state, allocating
    /// the next sequence id.
    fn create(&self, scan: NewScan) -> Result<StoredScan, StoreError>;

    /// Move a running request to its terminal state. Fails if it already
    /// reached one.
    fn finalize(&self, id: ScanId, outcome: ScanOutcome) -> Result<StoredScan, StoreError>;

    /// Retrieve a scan by id, verifying integrity.
    fn get(&self, id: ScanId) -> Result<StoredScan, StoreError>;

    /// The most recent `Completed` scan of `target` with an id below `before`.
    fn latest_completed_before(
        &self,
        target: &str,
        before: ScanId,
    ) -> Result<Option<StoredScan>, StoreError>;

    /// List scans matching the query, newest first.
    fn list(&self, query: &ScanQuery) -> Result<Vec<StoredScan>, StoreError>;

    /// Persist a change record. Records are never updated afterwards.
    fn record_change(&self, change: &ChangeRecord) -> Result<(), StoreError>;

    /// Change records created for the given scan.
    fn changes_for(&self, scan_id: ScanId) -> Result<Vec<ChangeRecord>, StoreError>;
}

/// Check whether a scan matches the given query filters.
fn matches_query(scan: &StoredScan, query: &ScanQuery) -> bool {
    if let Some(target) = &query.target {
        if !scan.target.to_lowercase().contains(&target.to_lowercase()) {
            return false;
        }
    }
    if let Some(mode) = &query.mode {
        if &scan.mode != mode {
            return false;
        }
    }
    if let Some(status) = &query.status {
        if &scan.status != status {
            return false;
        }
    }
    if query.since.is_some_and(|since| scan.created_at < since) {
        return false;
    }
    if query.until.is_some_and(|until| scan.created_at > until) {
        return false;
    }
    true
}

fn finalize_record(scan: &mut StoredScan, outcome: ScanOutcome) -> Result<(), StoreError> {
    if scan.status.is_terminal() {
        return Err(StoreError::AlreadyFinalized(scan.id));
    }
    scan.finalize(outcome);
    Ok(())
}

// ── In-memory ─────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    last_id: u64,
    scans: BTreeMap<ScanId, StoredScan>,
    changes: Vec<ChangeRecord>,
}

/// Process-local store. Suitable for tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemoryScanStore {
    state: Mutex<MemoryState>,
}

impl MemoryScanStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ScanStore for MemoryScanStore {
    fn create(&self, scan: NewScan) -> Result<StoredScan, StoreError> {
        let mut state = self.lock()?;
        state.last_id += 1;
        let stored = StoredScan::new(ScanId(state.last_id), scan);
        state.scans.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn finalize(&self, id: ScanId, outcome: ScanOutcome) -> Result<StoredScan, StoreError> {
        let mut state = self.lock()?;
        let scan = state.scans.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        finalize_record(scan, outcome)?;
        Ok(scan.clone())
    }

    fn get(&self, id: ScanId) -> Result<StoredScan, StoreError> {
        let state = self.lock()?;
        let scan = state.scans.get(&id).ok_or(StoreError::NotFound(id))?;
        if !scan.verify_integrity() {
            return Err(StoreError::IntegrityViolation(id));
        }
        Ok(scan.clone())
    }

    fn latest_completed_before(
        &self,
        target: &str,
        before: ScanId,
    ) -> Result<Option<StoredScan>, StoreError> {
        let state = self.lock()?;
        let prior = state
            .scans
            .range(..before)
            .rev()
            .map(|(_, scan)| scan)
            .find(|scan| scan.target == target && scan.status == ScanStatus::Completed);

        match prior {
            Some(scan) if !scan.verify_integrity() => Err(StoreError::IntegrityViolation(scan.id)),
            other => Ok(other.cloned()),
        }
    }

    fn list(&self, query: &ScanQuery) -> Result<Vec<StoredScan>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .scans
            .values()
            .rev()
            .filter(|scan| matches_query(scan, query))
            .cloned()
            .collect())
    }

    fn record_change(&self, change: &ChangeRecord) -> Result<(), StoreError> {
        self.lock()?.changes.push(change.clone());
        Ok(())
    }

    fn changes_for(&self, scan_id: ScanId) -> Result<Vec<ChangeRecord>, StoreError> {
        Ok(self
            .lock()?
            .changes
            .iter()
            .filter(|c| c.scan_id == scan_id)
            .cloned()
            .collect())
    }
}

// ── File-backed ───────────────────────────────────────────────────

/// File-system backed store.
///
/// All writes are serialized through one lock that also owns the id
/// sequence, so concurrent coordinators never allocate the same id.
pub struct FileScanStore {
    root: PathBuf,
    last_id: Mutex<u64>,
}

impl FileScanStore {
    /// Open (or create) a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("scans"))?;
        fs::create_dir_all(root.join("changes"))?;

        let last_id = scan_ids(&root.join("scans"))?.into_iter().max().unwrap_or(0);
        tracing::debug!(root = %root.display(), last_id, "Scan store opened");

        Ok(Self {
            root,
            last_id: Mutex::new(last_id),
        })
    }

    fn scan_path(&self, id: ScanId) -> PathBuf {
        self.root.join("scans").join(format!("{}.json", id.0))
    }

    fn change_path(&self, id: ScanId) -> PathBuf {
        self.root.join("changes").join(format!("{}.json", id.0))
    }

    fn write_lock(&self) -> Result<MutexGuard<'_, u64>, StoreError> {
        self.last_id.lock().map_err(|_| StoreError::Poisoned)
    }

    fn write_scan(&self, scan: &StoredScan) -> Result<(), StoreError> {
        let path = self.scan_path(scan.id);
        fs::write(&path, serde_json::to_string_pretty(scan)?)?;
        tracing::debug!(scan_id = %scan.id, path = %path.display(), "Scan saved");
        Ok(())
    }

    /// Read a scan without verifying integrity.
    fn read_scan(&self, id: ScanId) -> Result<StoredScan, StoreError> {
        let path = self.scan_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id));
        }
        let json = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    fn read_verified(&self, id: ScanId) -> Result<StoredScan, StoreError> {
        let scan = self.read_scan(id)?;
        if !scan.verify_integrity() {
            return Err(StoreError::IntegrityViolation(id));
        }
        Ok(scan)
    }

    /// All stored ids, newest first.
    fn ids_desc(&self) -> Result<Vec<ScanId>, StoreError> {
        let mut ids = scan_ids(&self.root.join("scans"))?;
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids.into_iter().map(ScanId).collect())
    }
}

/// Collect the numeric ids of all `{id}.json` files in a directory.
fn scan_ids(dir: &Path) -> Result<Vec<u64>, StoreError> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            ids.push(id);
        }
    }
    Ok(ids)
}

impl ScanStore for FileScanStore {
    fn create(&self, scan: NewScan) -> Result<StoredScan, StoreError> {
        let mut last_id = self.write_lock()?;
        let stored = StoredScan::new(ScanId(*last_id + 1), scan);
        self.write_scan(&stored)?;
        *last_id += 1;
        Ok(stored)
    }

    fn finalize(&self, id: ScanId, outcome: ScanOutcome) -> Result<StoredScan, StoreError> {
        let _guard = self.write_lock()?;
        let mut scan = self.read_scan(id)?;
        finalize_record(&mut scan, outcome)?;
        self.write_scan(&scan)?;
        Ok(scan)
    }

    fn get(&self, id: ScanId) -> Result<StoredScan, StoreError> {
        self.read_verified(id)
    }

    fn latest_completed_before(
        &self,
        target: &str,
        before: ScanId,
    ) -> Result<Option<StoredScan>, StoreError> {
        for id in self.ids_desc()?.into_iter().filter(|id| *id < before) {
            let scan = self.read_scan(id)?;
            if scan.target == target && scan.status == ScanStatus::Completed {
                if !scan.verify_integrity() {
                    return Err(StoreError::IntegrityViolation(id));
                }
                return Ok(Some(scan));
            }
        }
        Ok(None)
    }

    fn list(&self, query: &ScanQuery) -> Result<Vec<StoredScan>, StoreError> {
        let mut results = Vec::new();
        for id in self.ids_desc()? {
            let scan = self.read_scan(id)?;
            if matches_query(&scan, query) {
                results.push(scan);
            }
        }
        Ok(results)
    }

    fn record_change(&self, change: &ChangeRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock()?;
        let path = self.change_path(change.scan_id);

        let mut changes: Vec<ChangeRecord> = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            Vec::new()
        };
        changes.push(change.clone());
        fs::write(&path, serde_json::to_string_pretty(&changes)?)?;

        tracing::debug!(
            scan_id = %change.scan_id,
            baseline_id = %change.baseline_id,
            "Change record saved"
        );
        Ok(())
    }

    fn changes_for(&self, scan_id: ScanId) -> Result<Vec<ChangeRecord>, StoreError> {
        let path = self.change_path(scan_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }
}
