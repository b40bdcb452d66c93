//! BLAKE3 content hashing for tamper evidence.
//!
//! Computes a deterministic hash of a finalized scan (excluding the
//! content_hash itself) so that any later modification is detectable.

use chrono::{DateTime, Utc};
use serde::Serialize;

use portwatch_core::{CanonicalResult, ScanId, ScanStatus};

use crate::StoredScan;

/// Hashable representation of a StoredScan (excludes content_hash).
#[derive(Serialize)]
struct HashableScan<'a> {
    id: &'a ScanId,
    target: &'a str,
    ports: &'a str,
    flags: &'a str,
    status: &'a ScanStatus,
    finished_at: &'a Option<DateTime<Utc>>,
    result: &'a Option<CanonicalResult>,
}

/// Compute the BLAKE3 hash of a scan's content. Returns the hex digest.
pub fn compute_scan_hash(scan: &StoredScan) -> String {
    let hashable = HashableScan {
        id: &scan.id,
        target: &scan.target,
        ports: &scan.ports,
        flags: &scan.flags,
        status: &scan.status,
        finished_at: &scan.finished_at,
        result: &scan.result,
    };

    let mut hasher = blake3::Hasher::new();
    // In-memory serialization of plain data cannot fail.
    if let Ok(json) = serde_json::to_vec(&hashable) {
        hasher.update(&json);
    }
    hasher.finalize().to_hex().to_string()
}
