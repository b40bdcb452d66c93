//! portwatch-store: Persistence of scan requests, results and change history.
//!
//! Every accepted request is stored as a [`StoredScan`] in the `Running`
//! state and finalized exactly once as `Completed` (with its canonical result)
//! or `Failed` (without one). Finalized records are content-hashed with
//! BLAKE3 so a tampered result is detected when it is read back as a
//! change-detection baseline.

pub mod hash;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use portwatch_core::{CanonicalResult, ScanId, ScanMode, ScanStatus};

pub use store::{FileScanStore, MemoryScanStore, ScanQuery, ScanStore, StoreError};

/// Parameters of a newly accepted request, as the requester supplied them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewScan {
    /// Canonical target literal.
    pub target: String,
    /// Raw port expression; empty when none was given.
    pub ports: String,
    /// Raw flag string; empty when none was given.
    pub flags: String,
    pub mode: ScanMode,
    pub concurrency: usize,
}

/// How a running request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Completed(CanonicalResult),
    Failed,
}

impl ScanOutcome {
    pub fn status(&self) -> ScanStatus {
        match self {
            Self::Completed(_) => ScanStatus::Completed,
            Self::Failed => ScanStatus::Failed,
        }
    }
}

/// A persisted scan request and, once completed, its canonical result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredScan {
    pub id: ScanId,
    pub target: String,
    pub ports: String,
    pub flags: String,
    pub mode: ScanMode,
    pub concurrency: usize,
    pub status: ScanStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<CanonicalResult>,
    /// BLAKE3 content hash (hex), set on finalization.
    pub content_hash: Option<String>,
}

impl StoredScan {
    pub fn new(id: ScanId, scan: NewScan) -> Self {
        Self {
            id,
            target: scan.target,
            ports: scan.ports,
            flags: scan.flags,
            mode: scan.mode,
            concurrency: scan.concurrency,
            status: ScanStatus::Running,
            created_at: Utc::now(),
            finished_at: None,
            result: None,
            content_hash: None,
        }
    }

    /// Move to a terminal state and seal the record with its content hash.
    pub fn finalize(&mut self, outcome: ScanOutcome) {
        self.status = outcome.status();
        self.result = match outcome {
            ScanOutcome::Completed(result) => Some(result),
            ScanOutcome::Failed => None,
        };
        self.finished_at = Some(Utc::now());
        self.content_hash = Some(self.compute_hash());
    }

    /// The request parameters, for re-running the same scan.
    pub fn parameters(&self) -> NewScan {
        NewScan {
            target: self.target.clone(),
            ports: self.ports.clone(),
            flags: self.flags.clone(),
            mode: self.mode,
            concurrency: self.concurrency,
        }
    }

    pub fn compute_hash(&self) -> String {
        hash::compute_scan_hash(self)
    }

    /// Running records carry no hash and always pass.
    pub fn verify_integrity(&self) -> bool {
        match &self.content_hash {
            Some(stored) => stored == &self.compute_hash(),
            None => self.status == ScanStatus::Running,
        }
    }
}
