//! Error types for the portwatch-scan crate.

use thiserror::Error;

use crate::scheduler::JobId;

/// Rejections raised while validating a request, before any task starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("Invalid IPv4/IPv6 address or network: {0}")]
    InvalidTarget(String),

    #[error("Invalid port specification: {0}")]
    InvalidPortSpec(String),

    #[error("Network {target} has more than {max_hosts} host addresses")]
    TargetTooLarge { target: String, max_hosts: usize },
}

/// Failure of a single partition. Reported through the progress relay and
/// contained to that partition.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Nmap command not found at {path}: {reason}")]
    ToolNotFound { path: String, reason: String },

    #[error("nmap exited with code {code}")]
    ToolExitedNonZero { code: i32 },

    #[error("Failed to read XML output: {0}")]
    OutputUnreadable(#[source] std::io::Error),

    #[error("Failed to parse XML: {0}")]
    OutputUnparsable(String),
}

/// Why a finalized request ended up `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestFailure {
    #[error("All {total} partitions failed")]
    AllPartitionsFailed { total: usize },

    #[error("{failed} of {total} partitions failed")]
    PartitionsFailed { failed: usize, total: usize },
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("Store error: {0}")]
    Store(#[from] portwatch_store::StoreError),

    #[error("Scheduled job not found: {0}")]
    JobNotFound(JobId),

    #[error("Scan task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, ScanError>;
