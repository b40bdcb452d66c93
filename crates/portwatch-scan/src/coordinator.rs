//! Request coordination: accept, partition, execute, merge, finalize, diff.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinHandle;

use portwatch_core::{ChangeRecord, EventSink, ScanId, ScanRequest};
use portwatch_store::{NewScan, ScanOutcome, ScanQuery, ScanStore, StoredScan};

use crate::diff;
use crate::error::{RequestFailure, Result};
use crate::executor::{self, TaskRunner};
use crate::merge;
use crate::partition;
use crate::relay::ProgressRelay;
use crate::spec::{self, RequestInput, SpecLimits};

/// Ties the pipeline stages to their collaborators. Cheap to clone.
#[derive(Clone)]
pub struct ScanCoordinator {
    runner: Arc<dyn TaskRunner>,
    store: Arc<dyn ScanStore>,
    sink: Arc<dyn EventSink>,
    limits: SpecLimits,
}

/// A request accepted for execution.
#[derive(Debug)]
pub struct Accepted {
    pub scan_id: ScanId,
    /// Command line shown to the requester.
    pub command: String,
    pub handle: ScanHandle,
}

/// Join handle for a dispatched request.
#[derive(Debug)]
pub struct ScanHandle {
    scan_id: ScanId,
    handle: JoinHandle<Result<ScanReport>>,
}

impl ScanHandle {
    pub fn scan_id(&self) -> ScanId {
        self.scan_id
    }

    /// Wait for the request to reach its terminal state.
    pub async fn join(self) -> Result<ScanReport> {
        self.handle.await?
    }
}

/// Terminal state of one request.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub scan: StoredScan,
    pub change: Option<ChangeRecord>,
    /// Set when the request was finalized as failed.
    pub failure: Option<RequestFailure>,
}

impl ScanCoordinator {
    pub fn new(
        runner: Arc<dyn TaskRunner>,
        store: Arc<dyn ScanStore>,
        sink: Arc<dyn EventSink>,
        limits: SpecLimits,
    ) -> Self {
        Self {
            runner,
            store,
            sink,
            limits,
        }
    }

    /// Validate and persist a request, then run it in the background.
    ///
    /// Validation errors are returned before anything is stored.
    pub fn submit(&self, input: RequestInput) -> Result<Accepted> {
        let request = spec::parse_request(&input, &self.limits)?;
        let command = spec::command_preview(&request);

        let stored = self.store.create(NewScan {
            target: request.target.literal(),
            ports: input.ports.trim().to_string(),
            flags: input.flags.trim().to_string(),
            mode: request.mode,
            concurrency: request.concurrency,
        })?;

        tracing::info!(
            scan_id = %stored.id,
            target = %stored.target,
            mode = %request.mode,
            concurrency = request.concurrency,
            command = %command,
            "Scan accepted"
        );

        let handle = self.dispatch(stored.id, request);
        Ok(Accepted {
            scan_id: stored.id,
            command,
            handle,
        })
    }

    /// Start a new request with the parameters of a stored one.
    pub fn rescan(&self, id: ScanId) -> Result<Accepted> {
        let prior = self.store.get(id)?;
        let params = prior.parameters();
        tracing::info!(scan_id = %id, target = %params.target, "Rescan requested");

        self.submit(RequestInput {
            target: params.target,
            ports: params.ports,
            flags: params.flags,
            mode: params.mode.as_str().to_string(),
            concurrency: Some(params.concurrency),
        })
    }

    pub fn history(&self, query: &ScanQuery) -> Result<Vec<StoredScan>> {
        Ok(self.store.list(query)?)
    }

    pub fn changes(&self, id: ScanId) -> Result<Vec<ChangeRecord>> {
        Ok(self.store.changes_for(id)?)
    }

    fn dispatch(&self, scan_id: ScanId, request: ScanRequest) -> ScanHandle {
        let coordinator = self.clone();
        let handle = tokio::spawn(async move { coordinator.run(scan_id, request).await });
        ScanHandle { scan_id, handle }
    }

    /// Last attempt to move a request out of `Running` after its result
    /// could not be stored.
    fn finalize_failed(&self, scan_id: ScanId) {
        match self.store.finalize(scan_id, ScanOutcome::Failed) {
            Ok(_) => tracing::warn!(scan_id = %scan_id, "Scan finalized as failed without its result"),
            Err(e) => tracing::error!(scan_id = %scan_id, error = %e, "Scan record left running"),
        }
    }

    /// Run an accepted request to its terminal state.
    ///
    /// Every partition runs to completion or failure. The request completes
    /// only if all of them succeeded; otherwise it is finalized as failed
    /// without a result.
    pub async fn run(&self, scan_id: ScanId, request: ScanRequest) -> Result<ScanReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let relay = ProgressRelay::new(scan_id, self.sink.clone());

        let part = partition::partition(scan_id, &request);
        tracing::info!(
            scan_id = %scan_id,
            target = %request.target,
            strategy = ?part.strategy,
            tasks = part.tasks.len(),
            concurrency = part.concurrency,
            "Scan dispatched"
        );

        let execution = executor::execute(self.runner.clone(), part.tasks, part.concurrency, &relay).await;

        let failure = if execution.all_failed() {
            Some(RequestFailure::AllPartitionsFailed {
                total: execution.total,
            })
        } else if execution.failed > 0 {
            Some(RequestFailure::PartitionsFailed {
                failed: execution.failed,
                total: execution.total,
            })
        } else {
            None
        };

        let outcome = match &failure {
            Some(_) => ScanOutcome::Failed,
            None => ScanOutcome::Completed(merge::merge(
                part.strategy,
                execution.reports,
                started_at,
                clock.elapsed().as_secs_f64(),
            )),
        };

        let completed = matches!(outcome, ScanOutcome::Completed(_));
        let scan = match self.store.finalize(scan_id, outcome) {
            Ok(scan) => scan,
            Err(e) => {
                tracing::error!(scan_id = %scan_id, error = %e, "Failed to finalize scan");
                if completed {
                    self.finalize_failed(scan_id);
                }
                relay.error(&e.to_string());
                relay.complete();
                return Err(e.into());
            }
        };

        if let Some(failure) = &failure {
            tracing::warn!(scan_id = %scan_id, error = %failure, "Scan failed");
            relay.error(&failure.to_string());
        }

        let change = diff::detect_changes(self.store.as_ref(), &scan);

        tracing::info!(
            scan_id = %scan_id,
            status = ?scan.status,
            changed = change.is_some(),
            elapsed_ms = clock.elapsed().as_millis(),
            "Scan finished"
        );
        relay.complete();

        Ok(ScanReport {
            scan,
            change,
            failure,
        })
    }
}
