//! Scheduled scans.
//!
//! Jobs live in a [`JobStore`] arena keyed by [`JobId`]; every mutation goes
//! through its single write path. The [`Scheduler`] ticks at a fixed
//! interval, takes the jobs that are due and dispatches each one as a new
//! request through the coordinator.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, Duration, MissedTickBehavior};
use uuid::Uuid;

use portwatch_core::ScanId;

use crate::config::JobConfig;
use crate::coordinator::{ScanCoordinator, ScanHandle};
use crate::error::{Result, ScanError};
use crate::spec::{self, RequestInput, SpecLimits};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A one-off scan scheduled for a point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledJob {
    pub id: JobId,
    pub input: RequestInput,
    pub run_at: DateTime<Utc>,
    /// Cleared once the job has been taken for dispatch or cancelled.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    /// The request most recently started for this job.
    pub last_scan: Option<ScanId>,
}

/// What a requester supplies to schedule a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    pub input: RequestInput,
    pub run_at: DateTime<Utc>,
}

impl From<&JobConfig> for JobSpec {
    fn from(job: &JobConfig) -> Self {
        Self {
            input: RequestInput {
                target: job.target.clone(),
                ports: job.ports.clone(),
                flags: job.flags.clone(),
                mode: job.mode.clone(),
                concurrency: job.concurrency,
            },
            run_at: job.run_at,
        }
    }
}

/// Partial update of a scheduled job. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobUpdate {
    pub input: Option<RequestInput>,
    pub run_at: Option<DateTime<Utc>>,
    pub active: Option<bool>,
}

/// Shared arena of scheduled jobs.
#[derive(Debug, Clone, Default)]
pub struct JobStore {
    jobs: Arc<RwLock<BTreeMap<JobId, ScheduledJob>>>,
    limits: SpecLimits,
}

impl JobStore {
    pub fn new(limits: SpecLimits) -> Self {
        Self {
            jobs: Arc::default(),
            limits,
        }
    }

    /// The only place jobs are mutated.
    fn write<T>(&self, f: impl FnOnce(&mut BTreeMap<JobId, ScheduledJob>) -> T) -> T {
        let mut jobs = self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut jobs)
    }

    fn read<T>(&self, f: impl FnOnce(&BTreeMap<JobId, ScheduledJob>) -> T) -> T {
        let jobs = self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&jobs)
    }

    /// Schedule a job. The request is validated up front so a bad job is
    /// rejected now rather than at its run time.
    pub fn submit(&self, job: JobSpec) -> Result<ScheduledJob> {
        spec::parse_request(&job.input, &self.limits)?;

        let scheduled = ScheduledJob {
            id: JobId::new(),
            input: job.input,
            run_at: job.run_at,
            active: true,
            created_at: Utc::now(),
            last_scan: None,
        };
        self.write(|jobs| {
            jobs.insert(scheduled.id, scheduled.clone());
        });

        tracing::info!(job_id = %scheduled.id, target = %scheduled.input.target, run_at = %scheduled.run_at, "Job scheduled");
        Ok(scheduled)
    }

    pub fn update(&self, id: JobId, update: JobUpdate) -> Result<ScheduledJob> {
        if let Some(input) = &update.input {
            spec::parse_request(input, &self.limits)?;
        }

        self.write(|jobs| -> Result<ScheduledJob> {
            let job = jobs.get_mut(&id).ok_or(ScanError::JobNotFound(id))?;
            if let Some(input) = update.input {
                job.input = input;
            }
            if let Some(run_at) = update.run_at {
                job.run_at = run_at;
            }
            if let Some(active) = update.active {
                job.active = active;
            }
            tracing::info!(job_id = %id, run_at = %job.run_at, active = job.active, "Job updated");
            Ok(job.clone())
        })
    }

    /// Deactivate a job so it is never dispatched. The job stays listed and
    /// a scan it already started keeps running.
    pub fn cancel(&self, id: JobId) -> Result<ScheduledJob> {
        let job = self.write(|jobs| -> Result<ScheduledJob> {
            let job = jobs.get_mut(&id).ok_or(ScanError::JobNotFound(id))?;
            job.active = false;
            Ok(job.clone())
        })?;
        tracing::info!(job_id = %id, "Job cancelled");
        Ok(job)
    }

    pub fn get(&self, id: JobId) -> Option<ScheduledJob> {
        self.read(|jobs| jobs.get(&id).cloned())
    }

    /// All jobs ordered by run time.
    pub fn list(&self) -> Vec<ScheduledJob> {
        let mut jobs = self.read(|jobs| jobs.values().cloned().collect::<Vec<_>>());
        jobs.sort_by_key(|job| job.run_at);
        jobs
    }

    /// Take every active job due at `now`, marking each inactive.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<ScheduledJob> {
        let mut due = self.write(|jobs| {
            jobs.values_mut()
                .filter(|job| job.active && job.run_at <= now)
                .map(|job| {
                    job.active = false;
                    job.clone()
                })
                .collect::<Vec<_>>()
        });
        due.sort_by_key(|job| job.run_at);
        due
    }

    /// Take one job regardless of its run time.
    pub fn take(&self, id: JobId) -> Result<ScheduledJob> {
        self.write(|jobs| -> Result<ScheduledJob> {
            let job = jobs.get_mut(&id).ok_or(ScanError::JobNotFound(id))?;
            job.active = false;
            Ok(job.clone())
        })
    }

    fn record_scan(&self, id: JobId, scan_id: ScanId) {
        self.write(|jobs| {
            if let Some(job) = jobs.get_mut(&id) {
                job.last_scan = Some(scan_id);
            }
        });
    }
}

/// Dispatches due jobs as scan requests.
pub struct Scheduler {
    jobs: JobStore,
    coordinator: ScanCoordinator,
    tick: Duration,
}

impl Scheduler {
    pub fn new(jobs: JobStore, coordinator: ScanCoordinator, tick: Duration) -> Self {
        Self {
            jobs,
            coordinator,
            tick,
        }
    }

    /// Tick forever. Each dispatched scan is awaited on its own task so a
    /// slow scan never delays the next tick.
    pub async fn run(&self) {
        let mut ticker = interval(self.tick.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(tick_ms = self.tick.as_millis(), jobs = self.jobs.list().len(), "Scheduler started");

        loop {
            ticker.tick().await;
            for handle in self.dispatch_due(Utc::now()) {
                tokio::spawn(async move {
                    let scan_id = handle.scan_id();
                    match handle.join().await {
                        Ok(report) => {
                            tracing::info!(scan_id = %scan_id, status = ?report.scan.status, "Scheduled scan finished");
                        }
                        Err(e) => {
                            tracing::error!(scan_id = %scan_id, error = %e, "Scheduled scan failed");
                        }
                    }
                });
            }
        }
    }

    /// Dispatch every job due at `now` and return their handles.
    pub fn dispatch_due(&self, now: DateTime<Utc>) -> Vec<ScanHandle> {
        self.jobs
            .take_due(now)
            .into_iter()
            .filter_map(|job| self.start(job).ok())
            .collect()
    }

    /// Dispatch a job immediately, ignoring its run time.
    pub fn run_now(&self, id: JobId) -> Result<ScanHandle> {
        let job = self.jobs.take(id)?;
        self.start(job)
    }

    fn start(&self, job: ScheduledJob) -> Result<ScanHandle> {
        match self.coordinator.submit(job.input.clone()) {
            Ok(accepted) => {
                tracing::info!(job_id = %job.id, scan_id = %accepted.scan_id, "Scheduled scan triggered");
                self.jobs.record_scan(job.id, accepted.scan_id);
                Ok(accepted.handle)
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Scheduled scan rejected");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    fn job_spec(target: &str, run_at: DateTime<Utc>) -> JobSpec {
        JobSpec {
            input: RequestInput {
                target: target.to_string(),
                ports: "22".to_string(),
                ..Default::default()
            },
            run_at,
        }
    }

    #[test]
    fn test_submit_validates() {
        let store = JobStore::default();
        let err = store.submit(job_spec("999.1.1.1", Utc::now())).unwrap_err();
        assert!(matches!(err, ScanError::Spec(_)));
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_take_due_marks_inactive() {
        let store = JobStore::default();
        let now = Utc::now();
        let due = store.submit(job_spec("10.0.0.1", now - ChronoDuration::seconds(5))).unwrap();
        let later = store.submit(job_spec("10.0.0.2", now + ChronoDuration::hours(1))).unwrap();

        let taken = store.take_due(now);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].id, due.id);
        assert!(!store.get(due.id).unwrap().active);
        assert!(store.get(later.id).unwrap().active);

        // Taken jobs are never handed out twice.
        assert!(store.take_due(now).is_empty());
    }

    #[test]
    fn test_update_and_cancel() {
        let store = JobStore::default();
        let now = Utc::now();
        let job = store.submit(job_spec("10.0.0.1", now + ChronoDuration::hours(1))).unwrap();

        let updated = store
            .update(
                job.id,
                JobUpdate {
                    run_at: Some(now - ChronoDuration::seconds(1)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(updated.run_at < now);

        let bad = JobUpdate {
            input: Some(RequestInput {
                target: "10.0.0.1".to_string(),
                ports: "http".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(store.update(job.id, bad), Err(ScanError::Spec(_))));
        assert_eq!(store.get(job.id).unwrap().input.ports, "22");

        let cancelled = store.cancel(job.id).unwrap();
        assert!(!cancelled.active);
        // Still listed, but never handed out as due.
        assert_eq!(store.list(), vec![cancelled]);
        assert!(store.take_due(now + ChronoDuration::days(1)).is_empty());

        let missing = JobId::new();
        assert!(matches!(store.cancel(missing), Err(ScanError::JobNotFound(_))));
        assert!(matches!(store.take(missing), Err(ScanError::JobNotFound(_))));
    }

    #[test]
    fn test_list_ordered_by_run_time() {
        let store = JobStore::default();
        let now = Utc::now();
        store.submit(job_spec("10.0.0.3", now + ChronoDuration::minutes(3))).unwrap();
        store.submit(job_spec("10.0.0.1", now + ChronoDuration::minutes(1))).unwrap();
        store.submit(job_spec("10.0.0.2", now + ChronoDuration::minutes(2))).unwrap();

        let targets: Vec<_> = store.list().into_iter().map(|j| j.input.target).collect();
        assert_eq!(targets, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_job_from_config() {
        let config = JobConfig {
            target: "10.0.0.0/30".to_string(),
            ports: "80".to_string(),
            flags: "-sV".to_string(),
            mode: "parallel".to_string(),
            concurrency: Some(2),
            run_at: Utc::now(),
        };
        let job = JobSpec::from(&config);
        assert_eq!(job.input.target, "10.0.0.0/30");
        assert_eq!(job.input.concurrency, Some(2));
        assert_eq!(job.run_at, config.run_at);
    }
}
