//! Bounded task execution.
//!
//! Each partition runs on its own tokio task; a semaphore caps how many
//! hold a permit (and therefore a tool process) at once.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use portwatch_core::ScanTask;

use crate::error::TaskError;
use crate::relay::ProgressRelay;
use crate::report::ToolReport;

/// Runs one partition to completion.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &ScanTask, relay: &ProgressRelay) -> Result<ToolReport, TaskError>;
}

/// What a batch of tasks produced.
#[derive(Debug, Default)]
pub struct Execution {
    /// Successful reports, in completion order.
    pub reports: Vec<ToolReport>,
    pub failed: usize,
    pub total: usize,
}

impl Execution {
    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.failed == self.total
    }
}

/// Run every task with at most `concurrency` in flight and wait for all of
/// them. A failing task is reported on the relay and does not stop the rest.
pub async fn execute(
    runner: Arc<dyn TaskRunner>,
    tasks: Vec<ScanTask>,
    concurrency: usize,
    relay: &ProgressRelay,
) -> Execution {
    let total = tasks.len();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let reports = Arc::new(Mutex::new(Vec::with_capacity(total)));
    let mut handles = Vec::with_capacity(total);

    for task in tasks {
        let runner = runner.clone();
        let relay = relay.clone();
        let semaphore = semaphore.clone();
        let reports = reports.clone();

        handles.push(tokio::spawn(async move {
            // The semaphore is never closed while handles are outstanding.
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return false;
            };

            tracing::debug!(scan_id = %task.scan_id, task_id = %task.id, target = %task.target, "Task started");

            match runner.run(&task, &relay).await {
                Ok(report) => {
                    tracing::debug!(
                        scan_id = %task.scan_id,
                        task_id = %task.id,
                        hosts = report.hosts.len(),
                        "Task finished"
                    );
                    reports
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(report);
                    true
                }
                Err(e) => {
                    tracing::warn!(scan_id = %task.scan_id, task_id = %task.id, error = %e, "Task failed");
                    relay.error(&e.to_string());
                    false
                }
            }
        }));
    }

    let mut failed = 0;
    for handle in handles {
        match handle.await {
            Ok(true) => {}
            Ok(false) => failed += 1,
            Err(e) => {
                tracing::error!(scan_id = %relay.scan_id(), error = %e, "Task panicked");
                relay.error(&format!("Scan task aborted: {e}"));
                failed += 1;
            }
        }
    }

    let reports = std::mem::take(&mut *reports.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));

    Execution {
        reports,
        failed,
        total,
    }
}
