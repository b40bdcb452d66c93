//! End-to-end coordinator behaviour against an in-process task runner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use portwatch_core::{
    BroadcastSink, ChangeRecord, EventPayload, HostRecord, PortRecord, PortState, Protocol,
    ScanEvent, ScanId, ScanStatus, ScanTask, ServiceFingerprint,
};
use portwatch_store::{
    FileScanStore, MemoryScanStore, NewScan, ScanOutcome, ScanQuery, ScanStore, StoreError,
    StoredScan,
};

use portwatch_scan::error::TaskError;
use portwatch_scan::relay::ProgressRelay;
use portwatch_scan::report::ToolReport;
use portwatch_scan::scheduler::{JobSpec, JobStore, Scheduler};
use portwatch_scan::spec::expand_ports;
use portwatch_scan::{
    RequestFailure, RequestInput, ScanCoordinator, ScanError, SpecError, SpecLimits, TaskRunner,
};

/// Reports each task's target as up with a configurable set of open services.
#[derive(Default)]
struct FakeRunner {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    /// Services per target; targets not listed expose their scanned ports.
    services: Mutex<HashMap<String, Vec<(u16, &'static str)>>>,
    /// Targets that fail with a non-zero exit.
    failing: Mutex<Vec<String>>,
}

impl FakeRunner {
    fn expose(&self, target: &str, services: &[(u16, &'static str)]) {
        self.services
            .lock()
            .unwrap()
            .insert(target.to_string(), services.to_vec());
    }

    fn fail(&self, target: &str) {
        self.failing.lock().unwrap().push(target.to_string());
    }
}

#[async_trait]
impl TaskRunner for FakeRunner {
    async fn run(&self, task: &ScanTask, relay: &ProgressRelay) -> Result<ToolReport, TaskError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        relay.line(&format!("Initiating scan of {}", task.target));
        tokio::time::sleep(Duration::from_millis(10)).await;
        relay.line("Connect Scan Timing: About 50.00% done");

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(&task.target) {
            return Err(TaskError::ToolExitedNonZero { code: 1 });
        }

        let configured = self.services.lock().unwrap().get(&task.target).cloned();
        let ports = match configured {
            Some(services) => services
                .into_iter()
                .map(|(port, name)| open_port(port, name))
                .collect(),
            None => task
                .ports
                .as_deref()
                .map(|p| expand_ports(p).unwrap())
                .unwrap_or_default()
                .into_iter()
                .rev()
                .map(|port| open_port(port, "unknown"))
                .collect(),
        };

        Ok(ToolReport {
            hosts: vec![HostRecord {
                address: task.target.clone(),
                mac: None,
                hostname: None,
                os: None,
                ports,
                scripts: Vec::new(),
            }],
            stats: None,
        })
    }
}

fn open_port(port: u16, service: &str) -> PortRecord {
    PortRecord {
        port,
        protocol: Protocol::Tcp,
        state: PortState::Open,
        service: Some(service.to_string()),
        version: None,
        scripts: Vec::new(),
    }
}

struct Harness {
    runner: Arc<FakeRunner>,
    store: Arc<MemoryScanStore>,
    sink: Arc<BroadcastSink>,
    coordinator: ScanCoordinator,
}

fn harness() -> Harness {
    let runner = Arc::new(FakeRunner::default());
    let store = Arc::new(MemoryScanStore::new());
    let sink = Arc::new(BroadcastSink::new(4096));
    let coordinator = ScanCoordinator::new(
        runner.clone(),
        store.clone(),
        sink.clone(),
        SpecLimits::default(),
    );
    Harness {
        runner,
        store,
        sink,
        coordinator,
    }
}

fn input(target: &str, ports: &str, mode: &str, concurrency: usize) -> RequestInput {
    RequestInput {
        target: target.to_string(),
        ports: ports.to_string(),
        flags: "-sV".to_string(),
        mode: mode.to_string(),
        concurrency: Some(concurrency),
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_host_wise_concurrency_bounded() {
    let h = harness();
    let accepted = h
        .coordinator
        .submit(input("10.0.0.0/28", "22", "single", 3))
        .unwrap();
    assert_eq!(accepted.command, "nmap -Pn -p 22 -sV 10.0.0.0/28");

    let report = accepted.handle.join().await.unwrap();

    assert_eq!(h.runner.calls.load(Ordering::SeqCst), 14);
    assert!(h.runner.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(report.scan.status, ScanStatus::Completed);

    let result = report.scan.result.unwrap();
    assert_eq!(result.hosts.len(), 14);
    assert_eq!(result.stats.hosts_total, 14);
    assert_eq!(result.stats.hosts_up, 14);
    assert_eq!(result.stats.hosts_down, 0);
}

#[tokio::test]
async fn test_concurrency_capped_by_host_count() {
    let h = harness();
    let report = h
        .coordinator
        .submit(input("10.0.0.0/30", "", "parallel", 100))
        .unwrap()
        .handle
        .join()
        .await
        .unwrap();

    assert_eq!(h.runner.calls.load(Ordering::SeqCst), 2);
    assert!(h.runner.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(report.scan.result.unwrap().stats.hosts_total, 2);
}

#[tokio::test]
async fn test_port_wise_union_sorted() {
    let h = harness();
    let report = h
        .coordinator
        .submit(input("10.0.0.1", "1-20,15-25", "parallel", 4))
        .unwrap()
        .handle
        .join()
        .await
        .unwrap();

    assert_eq!(h.runner.calls.load(Ordering::SeqCst), 4);
    let result = report.scan.result.unwrap();
    assert_eq!(result.hosts.len(), 1);
    let ports: Vec<u16> = result.hosts[0].ports.iter().map(|p| p.port).collect();
    assert_eq!(ports, (1..=25).collect::<Vec<_>>());
    assert_eq!(result.stats.hosts_total, 1);
    assert_eq!(result.stats.hosts_up, 1);
}

#[tokio::test]
async fn test_all_partitions_failed() {
    let h = harness();
    h.runner.fail("10.0.0.1");
    h.runner.fail("10.0.0.2");
    let mut rx = h.sink.subscribe();

    let report = h
        .coordinator
        .submit(input("10.0.0.0/30", "80", "single", 2))
        .unwrap()
        .handle
        .join()
        .await
        .unwrap();

    assert_eq!(report.scan.status, ScanStatus::Failed);
    assert!(report.scan.result.is_none());
    assert!(report.change.is_none());
    assert_eq!(
        report.failure,
        Some(RequestFailure::AllPartitionsFailed { total: 2 })
    );
    assert!(h.store.changes_for(report.scan.id).unwrap().is_empty());

    let events = drain(&mut rx);
    let errors = events
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::Error { .. }))
        .count();
    // One per task plus the request-level failure.
    assert_eq!(errors, 3);
    assert_eq!(events.last().unwrap().payload, EventPayload::Complete);
}

#[tokio::test]
async fn test_partial_failure_fails_request() {
    let h = harness();
    h.runner.fail("10.0.0.3");

    let report = h
        .coordinator
        .submit(input("10.0.0.0/29", "", "single", 4))
        .unwrap()
        .handle
        .join()
        .await
        .unwrap();

    // The other partitions still ran to completion.
    assert_eq!(h.runner.calls.load(Ordering::SeqCst), 6);
    assert_eq!(report.scan.status, ScanStatus::Failed);
    assert!(report.scan.result.is_none());
    assert_eq!(
        report.failure,
        Some(RequestFailure::PartitionsFailed {
            failed: 1,
            total: 6
        })
    );
}

#[tokio::test]
async fn test_change_detection_against_previous_scan() {
    let h = harness();
    h.runner.expose("10.0.0.1", &[(80, "http"), (22, "ssh")]);

    let first = h
        .coordinator
        .submit(input("10.0.0.1", "", "single", 1))
        .unwrap()
        .handle
        .join()
        .await
        .unwrap();
    assert!(first.change.is_none(), "no prior scan, no change");

    h.runner.expose("10.0.0.1", &[(80, "http"), (443, "https")]);
    let second = h
        .coordinator
        .submit(input("10.0.0.1", "", "single", 1))
        .unwrap()
        .handle
        .join()
        .await
        .unwrap();

    let change = second.change.unwrap();
    assert_eq!(change.baseline_id, first.scan.id);
    assert_eq!(change.scan_id, second.scan.id);
    assert_eq!(
        change.added.into_iter().collect::<Vec<_>>(),
        vec![ServiceFingerprint::new(443, "https")]
    );
    assert_eq!(
        change.removed.into_iter().collect::<Vec<_>>(),
        vec![ServiceFingerprint::new(22, "ssh")]
    );
    assert_eq!(h.coordinator.changes(second.scan.id).unwrap().len(), 1);

    // Same surface again: nothing recorded.
    let third = h
        .coordinator
        .submit(input("10.0.0.1", "", "single", 1))
        .unwrap()
        .handle
        .join()
        .await
        .unwrap();
    assert!(third.change.is_none());
    assert!(h.coordinator.changes(third.scan.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_target_rejected_before_dispatch() {
    let h = harness();
    let err = h
        .coordinator
        .submit(input("999.1.1.1", "", "single", 1))
        .unwrap_err();
    assert!(matches!(err, ScanError::Spec(SpecError::InvalidTarget(_))));

    let err = h
        .coordinator
        .submit(input("10.0.0.1", "22-", "single", 1))
        .unwrap_err();
    assert!(matches!(err, ScanError::Spec(SpecError::InvalidPortSpec(_))));

    assert_eq!(h.runner.calls.load(Ordering::SeqCst), 0);
    assert!(h.coordinator.history(&ScanQuery::default()).unwrap().is_empty());
}

#[tokio::test]
async fn test_rescan_is_independent_request() {
    let h = harness();
    let first = h
        .coordinator
        .submit(input("10.0.0.1", "22,80", "parallel", 2))
        .unwrap()
        .handle
        .join()
        .await
        .unwrap();

    let again = h.coordinator.rescan(first.scan.id).unwrap();
    assert_ne!(again.scan_id, first.scan.id);
    assert_eq!(again.command, "nmap -Pn -p 22,80 -sV 10.0.0.1");

    let second = again.handle.join().await.unwrap();
    assert_eq!(second.scan.parameters(), first.scan.parameters());
    assert_eq!(h.store.get(first.scan.id).unwrap().status, ScanStatus::Completed);

    let history = h.coordinator.history(&ScanQuery::default()).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, second.scan.id);
}

#[tokio::test]
async fn test_events_tagged_and_completed() {
    let h = harness();
    let mut rx = h.sink.subscribe();

    let report = h
        .coordinator
        .submit(input("10.0.0.1", "22", "single", 1))
        .unwrap()
        .handle
        .join()
        .await
        .unwrap();

    let events = drain(&mut rx);
    assert!(events.iter().all(|e| e.scan_id == report.scan.id));
    assert!(events
        .iter()
        .any(|e| e.payload == EventPayload::Progress { percent: 50 }));
    assert_eq!(events.last().unwrap().payload, EventPayload::Complete);
    assert_eq!(
        events
            .iter()
            .filter(|e| e.payload == EventPayload::Complete)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_scheduler_dispatches_due_jobs() {
    let h = harness();
    let jobs = JobStore::new(SpecLimits::default());
    let now = Utc::now();

    let due = jobs
        .submit(JobSpec {
            input: input("10.0.0.1", "22", "single", 1),
            run_at: now - chrono::Duration::seconds(1),
        })
        .unwrap();
    let later = jobs
        .submit(JobSpec {
            input: input("10.0.0.2", "22", "single", 1),
            run_at: now + chrono::Duration::hours(1),
        })
        .unwrap();

    let scheduler = Scheduler::new(jobs.clone(), h.coordinator.clone(), Duration::from_secs(1));

    let handles = scheduler.dispatch_due(now);
    assert_eq!(handles.len(), 1);
    for handle in handles {
        let report = handle.join().await.unwrap();
        assert_eq!(report.scan.target, "10.0.0.1");
        assert_eq!(jobs.get(due.id).unwrap().last_scan, Some(report.scan.id));
    }
    assert!(scheduler.dispatch_due(now).is_empty());

    let report = scheduler.run_now(later.id).unwrap().join().await.unwrap();
    assert_eq!(report.scan.target, "10.0.0.2");
    assert!(!jobs.get(later.id).unwrap().active);
}

#[tokio::test]
async fn test_tampered_baseline_skips_change_detection() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::default());
    let store = Arc::new(FileScanStore::new(dir.path()).unwrap());
    let coordinator = ScanCoordinator::new(
        runner.clone(),
        store.clone(),
        Arc::new(BroadcastSink::new(64)),
        SpecLimits::default(),
    );

    runner.expose("10.0.0.1", &[(22, "ssh")]);
    let first = coordinator
        .submit(input("10.0.0.1", "", "single", 1))
        .unwrap()
        .handle
        .join()
        .await
        .unwrap();
    assert_eq!(first.scan.status, ScanStatus::Completed);

    let path = dir.path().join("scans").join(format!("{}.json", first.scan.id.0));
    let mut stored: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    stored["result"]["stats"]["summary"] = serde_json::json!("edited by hand");
    std::fs::write(&path, serde_json::to_string_pretty(&stored).unwrap()).unwrap();

    runner.expose("10.0.0.1", &[(22, "ssh"), (443, "https")]);
    let second = coordinator
        .submit(input("10.0.0.1", "", "single", 1))
        .unwrap()
        .handle
        .join()
        .await
        .unwrap();

    // The unreadable baseline is skipped; the request itself still completes.
    assert_eq!(second.scan.status, ScanStatus::Completed);
    assert!(second.change.is_none());
    assert!(second.failure.is_none());
    assert!(store.changes_for(second.scan.id).unwrap().is_empty());
}

/// Stores everything except a completed result.
#[derive(Default)]
struct ResultRejectingStore(MemoryScanStore);

impl ScanStore for ResultRejectingStore {
    fn create(&self, scan: NewScan) -> Result<StoredScan, StoreError> {
        self.0.create(scan)
    }
    fn finalize(&self, id: ScanId, outcome: ScanOutcome) -> Result<StoredScan, StoreError> {
        match outcome {
            ScanOutcome::Completed(_) => Err(StoreError::Io(std::io::Error::other("disk full"))),
            ScanOutcome::Failed => self.0.finalize(id, outcome),
        }
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
    fn record_change(&self, change: &ChangeRecord) -> Result<(), StoreError> {
        self.0.record_change(change)
    }
    fn changes_for(&self, scan_id: ScanId) -> Result<Vec<ChangeRecord>, StoreError> {
        self.0.changes_for(scan_id)
    }
}

#[tokio::test]
async fn test_unstorable_result_still_reaches_terminal_state() {
    let store = Arc::new(ResultRejectingStore::default());
    let sink = Arc::new(BroadcastSink::new(64));
    let coordinator = ScanCoordinator::new(
        Arc::new(FakeRunner::default()),
        store.clone(),
        sink.clone(),
        SpecLimits::default(),
    );
    let mut rx = sink.subscribe();

    let accepted = coordinator
        .submit(input("10.0.0.1", "22", "single", 1))
        .unwrap();
    let scan_id = accepted.scan_id;
    let err = accepted.handle.join().await.unwrap_err();
    assert!(matches!(err, ScanError::Store(StoreError::Io(_))));

    let scan = store.get(scan_id).unwrap();
    assert_eq!(scan.status, ScanStatus::Failed);
    assert!(scan.result.is_none());

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e.payload, EventPayload::Error { .. })));
    assert_eq!(events.last().unwrap().payload, EventPayload::Complete);
}
