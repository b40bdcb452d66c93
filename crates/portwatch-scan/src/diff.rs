//! Change detection: diff the open services of a completed scan against the
//! most recent prior completed scan of the same target.

use std::collections::BTreeSet;

use chrono::Utc;

use portwatch_core::{CanonicalResult, ChangeRecord, ScanId, ScanStatus};
use portwatch_store::{ScanStore, StoredScan};

/// Compare two results. `None` when the open-service surface is unchanged.
pub fn compute_change(
    scan_id: ScanId,
    current: &CanonicalResult,
    baseline_id: ScanId,
    baseline: &CanonicalResult,
) -> Option<ChangeRecord> {
    let new = current.open_services();
    let old = baseline.open_services();

    let added: BTreeSet<_> = new.difference(&old).cloned().collect();
    let removed: BTreeSet<_> = old.difference(&new).cloned().collect();

    if added.is_empty() && removed.is_empty() {
        return None;
    }

    Some(ChangeRecord {
        scan_id,
        baseline_id,
        added,
        removed,
        created_at: Utc::now(),
    })
}

/// Detect and persist the change record for a freshly completed scan.
///
/// Best effort: a missing baseline is a no-op, and store errors (including
/// a tampered baseline) are logged and skipped.
pub fn detect_changes(store: &dyn ScanStore, scan: &StoredScan) -> Option<ChangeRecord> {
    if scan.status != ScanStatus::Completed {
        return None;
    }
    let current = scan.result.as_ref()?;

    let baseline = match store.latest_completed_before(&scan.target, scan.id) {
        Ok(Some(baseline)) => baseline,
        Ok(None) => {
            tracing::debug!(scan_id = %scan.id, target = %scan.target, "No baseline, skipping change detection");
            return None;
        }
        Err(e) => {
            tracing::warn!(scan_id = %scan.id, target = %scan.target, error = %e, "Baseline lookup failed");
            return None;
        }
    };

    let Some(previous) = baseline.result.as_ref() else {
        tracing::warn!(scan_id = %scan.id, baseline_id = %baseline.id, "Baseline has no stored result");
        return None;
    };

    let change = compute_change(scan.id, current, baseline.id, previous)?;

    if let Err(e) = store.record_change(&change) {
        tracing::warn!(scan_id = %scan.id, error = %e, "Failed to record change");
        return None;
    }

    tracing::info!(
        scan_id = %scan.id,
        baseline_id = %baseline.id,
        added = change.added.len(),
        removed = change.removed.len(),
        "Service changes recorded"
    );
    Some(change)
}

#[cfg(test)]
mod tests {
    use portwatch_core::{
        HostRecord, PortRecord, PortState, Protocol, RunStats, ScanMode, ServiceFingerprint,
    };
    use portwatch_store::{MemoryScanStore, NewScan, ScanOutcome, ScanQuery, StoreError};

    use super::*;

    fn result(ports: &[(u16, &str, PortState)]) -> CanonicalResult {
        CanonicalResult {
            hosts: vec![HostRecord {
                address: "10.0.0.1".to_string(),
                mac: None,
                hostname: None,
                os: None,
                ports: ports
                    .iter()
                    .map(|(port, service, state)| PortRecord {
                        port: *port,
                        protocol: Protocol::Tcp,
                        state: *state,
                        service: Some(service.to_string()),
                        version: None,
                        scripts: Vec::new(),
                    })
                    .collect(),
                scripts: Vec::new(),
            }],
            stats: RunStats {
                started_at: Utc::now(),
                elapsed_secs: 1.0,
                hosts_up: 1,
                hosts_down: 0,
                hosts_total: 1,
                summary: String::new(),
            },
        }
    }

    fn completed(store: &MemoryScanStore, target: &str, outcome: ScanOutcome) -> StoredScan {
        let scan = store
            .create(NewScan {
                target: target.to_string(),
                ports: String::new(),
                flags: String::new(),
                mode: ScanMode::Single,
                concurrency: 1,
            })
            .unwrap();
        store.finalize(scan.id, outcome).unwrap()
    }

    #[test]
    fn test_added_and_removed() {
        let old = result(&[(80, "http", PortState::Open), (22, "ssh", PortState::Open)]);
        let new = result(&[(80, "http", PortState::Open), (443, "https", PortState::Open)]);

        let change = compute_change(ScanId(2), &new, ScanId(1), &old).unwrap();
        assert_eq!(change.added.into_iter().collect::<Vec<_>>(), vec![ServiceFingerprint::new(443, "https")]);
        assert_eq!(change.removed.into_iter().collect::<Vec<_>>(), vec![ServiceFingerprint::new(22, "ssh")]);
        assert_eq!(change.baseline_id, ScanId(1));
    }

    #[test]
    fn test_closed_ports_ignored() {
        let old = result(&[(80, "http", PortState::Open)]);
        let new = result(&[(80, "http", PortState::Open), (23, "telnet", PortState::Closed)]);
        assert!(compute_change(ScanId(2), &new, ScanId(1), &old).is_none());
    }

    #[test]
    fn test_service_rename_is_a_change() {
        let old = result(&[(8080, "http-proxy", PortState::Open)]);
        let new = result(&[(8080, "http", PortState::Open)]);
        let change = compute_change(ScanId(2), &new, ScanId(1), &old).unwrap();
        assert_eq!(change.added.len(), 1);
        assert_eq!(change.removed.len(), 1);
    }

    #[test]
    fn test_detect_against_store() {
        let store = MemoryScanStore::new();
        let first = completed(
            &store,
            "10.0.0.1",
            ScanOutcome::Completed(result(&[(22, "ssh", PortState::Open)])),
        );
        // Failed scans and other targets never serve as a baseline.
        completed(&store, "10.0.0.1", ScanOutcome::Failed);
        completed(
            &store,
            "10.0.0.2",
            ScanOutcome::Completed(result(&[(3389, "ms-wbt-server", PortState::Open)])),
        );
        let latest = completed(
            &store,
            "10.0.0.1",
            ScanOutcome::Completed(result(&[(22, "ssh", PortState::Open), (80, "http", PortState::Open)])),
        );

        assert!(detect_changes(&store, &first).is_none());

        let change = detect_changes(&store, &latest).unwrap();
        assert_eq!(change.baseline_id, first.id);
        assert_eq!(change.added.len(), 1);
        assert!(change.removed.is_empty());
        assert_eq!(store.changes_for(latest.id).unwrap(), vec![change]);
    }

    /// Accepts everything except change records.
    struct ReadOnlyChanges(MemoryScanStore);

    impl ScanStore for ReadOnlyChanges {
        fn create(&self, scan: NewScan) -> Result<StoredScan, StoreError> {
            self.0.create(scan)
        }
        fn finalize(&self, id: ScanId, outcome: ScanOutcome) -> Result<StoredScan, StoreError> {
            self.0.finalize(id, outcome)
        }
        fn get(&self, id: ScanId) -> Result<StoredScan, StoreError> {
            self.0.get(id)
        }
        fn latest_completed_before(&self, target: &str, before: ScanId) -> Result<Option<StoredScan>, StoreError> {
            self.0.latest_completed_before(target, before)
        }
        fn list(&self, query: &ScanQuery) -> Result<Vec<StoredScan>, StoreError> {
            self.0.list(query)
        }
        fn record_change(&self, _change: &ChangeRecord) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("read-only filesystem")))
        }
        fn changes_for(&self, scan_id: ScanId) -> Result<Vec<ChangeRecord>, StoreError> {
            self.0.changes_for(scan_id)
        }
    }

    #[test]
    fn test_unsaved_change_is_skipped() {
        let store = ReadOnlyChanges(MemoryScanStore::new());
        completed(&store.0, "10.0.0.1", ScanOutcome::Completed(result(&[(22, "ssh", PortState::Open)])));
        let latest = completed(
            &store.0,
            "10.0.0.1",
            ScanOutcome::Completed(result(&[(443, "https", PortState::Open)])),
        );

        assert!(detect_changes(&store, &latest).is_none());
        assert!(store.changes_for(latest.id).unwrap().is_empty());
    }

    #[test]
    fn test_failed_scan_skipped() {
        let store = MemoryScanStore::new();
        let failed = completed(&store, "10.0.0.1", ScanOutcome::Failed);
        assert!(detect_changes(&store, &failed).is_none());
    }
}
