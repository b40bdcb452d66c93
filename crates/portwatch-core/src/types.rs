//! Core domain types for scan requests, their results, and service changes.
//!
//! A request is accepted as a [`ScanRequest`], split into one or more
//! [`ScanTask`]s, and every task that succeeds contributes host records to a
//! single [`CanonicalResult`]. Repeated scans of the same target are compared
//! through their open-service [`ServiceFingerprint`] sets.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Identifiers ───────────────────────────────────────────────────

/// Sequence number of a scan request. Allocated by the store, strictly
/// increasing, so a smaller id is always a chronologically earlier request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScanId(pub u64);

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of one partition of a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

// ── Requests ──────────────────────────────────────────────────────

/// How a single-host request with a port list is executed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    #[default]
    Single,
    Parallel,
}

impl ScanMode {
    /// Normalize a free-form mode hint. Anything unrecognized is `Single`.
    ///
    /// The legacy names `basic` and `threaded` are accepted as aliases.
    pub fn from_hint(hint: &str) -> Self {
        match hint.trim().to_lowercase().as_str() {
            "parallel" | "threaded" => Self::Parallel,
            _ => Self::Single,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Parallel => "parallel",
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated scan target: one address or one network block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTarget {
    Host(IpAddr),
    /// Always stored truncated to its network address.
    Network(IpNet),
}

impl ScanTarget {
    /// The canonical literal used to match repeated scans of the same target.
    pub fn literal(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(ip) => write!(f, "{ip}"),
            Self::Network(net) => write!(f, "{net}"),
        }
    }
}

/// A validated, immutable scan request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub target: ScanTarget,
    /// Port expression exactly as accepted (e.g. `22,80,1000-1002`).
    pub ports: Option<String>,
    /// Tokenized tool flags.
    pub flags: Vec<String>,
    pub mode: ScanMode,
    /// Upper bound on concurrently running partitions. Always >= 1.
    pub concurrency: usize,
}

/// One independently executable partition of a [`ScanRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTask {
    pub id: TaskId,
    pub scan_id: ScanId,
    /// Target literal handed to the tool (address or block).
    pub target: String,
    /// Port subset for this partition, in tool syntax.
    pub ports: Option<String>,
    pub flags: Vec<String>,
}

/// Lifecycle state of a persisted request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ScanStatus {
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

// ── Results ───────────────────────────────────────────────────────

/// A single host as reported by the probing tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostRecord {
    pub address: String,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub os: Option<OsGuess>,
    pub ports: Vec<PortRecord>,
    pub scripts: Vec<ScriptRecord>,
}

impl HostRecord {
    /// Open-service fingerprints exposed by this host.
    pub fn open_services(&self) -> impl Iterator<Item = ServiceFingerprint> + '_ {
        self.ports
            .iter()
            .filter(|p| p.state == PortState::Open)
            .map(PortRecord::fingerprint)
    }
}

/// Best operating system match with its accuracy percentage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OsGuess {
    pub name: String,
    pub accuracy: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortRecord {
    pub port: u16,
    pub protocol: Protocol,
    pub state: PortState,
    pub service: Option<String>,
    /// `product` and `version` joined with a space, whichever are present.
    pub version: Option<String>,
    pub scripts: Vec<ScriptRecord>,
}

impl PortRecord {
    pub fn fingerprint(&self) -> ServiceFingerprint {
        ServiceFingerprint {
            port: self.port,
            service: self.service.clone(),
        }
    }
}

/// Output of one NSE script run against a host or port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptRecord {
    pub id: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
    Other(String),
}

impl Protocol {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
            Self::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

/// Aggregate statistics for a whole request. Always derived from the
/// partitions or the tool's own report, never authored independently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunStats {
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub hosts_up: u32,
    pub hosts_down: u32,
    pub hosts_total: u32,
    pub summary: String,
}

/// The single merged outcome of a request, whatever its partitioning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalResult {
    pub hosts: Vec<HostRecord>,
    pub stats: RunStats,
}

impl CanonicalResult {
    /// Every open `(port, service)` pair across all hosts.
    pub fn open_services(&self) -> BTreeSet<ServiceFingerprint> {
        self.hosts.iter().flat_map(|h| h.open_services()).collect()
    }
}

// ── Change history ────────────────────────────────────────────────

/// The identity used to compare two scans of the same target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceFingerprint {
    pub port: u16,
    pub service: Option<String>,
}

impl ServiceFingerprint {
    pub fn new(port: u16, service: &str) -> Self {
        Self {
            port,
            service: Some(service.to_string()),
        }
    }
}

/// Service-level difference between a completed scan and its baseline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRecord {
    pub scan_id: ScanId,
    pub baseline_id: ScanId,
    pub added: BTreeSet<ServiceFingerprint>,
    pub removed: BTreeSet<ServiceFingerprint>,
    pub created_at: DateTime<Utc>,
}
