//! Configuration for the portwatch scan coordinator.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::spec::SpecLimits;

/// Top-level scan configuration.
///
/// Loaded from `portwatch.toml` `[scan]` section or
/// `PORTWATCH__SCAN__` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Path to the nmap binary (default: "nmap").
    #[serde(default = "default_nmap_path")]
    pub nmap_path: String,

    /// Partition concurrency used when a request gives no usable hint.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Directory for per-task XML output files. System temp dir if unset.
    #[serde(default)]
    pub output_dir: Option<String>,

    /// Largest network block (in host addresses) accepted as a target.
    #[serde(default = "default_max_hosts")]
    pub max_hosts: usize,

    /// Directory for persisted scans and change records.
    #[serde(default = "default_store_dir")]
    pub store_dir: String,

    /// How often the scheduler looks for due jobs.
    #[serde(default = "default_tick_secs")]
    pub scheduler_tick_secs: u64,

    /// Capacity of the live event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// One-off jobs loaded into the scheduler at daemon start.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// A scheduled scan declared in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub target: String,
    #[serde(default)]
    pub ports: String,
    #[serde(default)]
    pub flags: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    pub concurrency: Option<usize>,
    /// RFC 3339 timestamp of the run.
    pub run_at: DateTime<Utc>,
}

impl ScanConfig {
    pub fn limits(&self) -> SpecLimits {
        SpecLimits {
            default_concurrency: self.default_concurrency,
            max_hosts: self.max_hosts,
        }
    }
}

fn default_nmap_path() -> String {
    "nmap".to_string()
}

fn default_concurrency() -> usize {
    100
}

fn default_max_hosts() -> usize {
    65_536
}

fn default_store_dir() -> String {
    "./scans".to_string()
}

fn default_tick_secs() -> u64 {
    1
}

fn default_event_buffer() -> usize {
    1024
}

fn default_mode() -> String {
    "single".to_string()
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            nmap_path: default_nmap_path(),
            default_concurrency: default_concurrency(),
            output_dir: None,
            max_hosts: default_max_hosts(),
            store_dir: default_store_dir(),
            scheduler_tick_secs: default_tick_secs(),
            event_buffer: default_event_buffer(),
            jobs: Vec::new(),
        }
    }
}
