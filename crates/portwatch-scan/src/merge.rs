//! Result merging.
//!
//! Folds the reports of every successful partition into the single
//! [`CanonicalResult`] persisted for the request.

use chrono::{DateTime, Utc};

use portwatch_core::{CanonicalResult, HostRecord, PortRecord, RunStats};

use crate::partition::Strategy;
use crate::report::{run_summary, ReportedStats, ToolReport};

/// Merge partial reports. `started_at` is when partitioning began and
/// `elapsed_secs` the wall-clock time since.
pub fn merge(
    strategy: Strategy,
    reports: Vec<ToolReport>,
    started_at: DateTime<Utc>,
    elapsed_secs: f64,
) -> CanonicalResult {
    let result = match strategy {
        Strategy::HostWise { hosts } => merge_host_wise(hosts, reports, started_at, elapsed_secs),
        Strategy::PortWise => merge_port_wise(reports, started_at, elapsed_secs),
        Strategy::Single => pass_through(reports, started_at, elapsed_secs),
    };

    tracing::debug!(
        strategy = ?strategy,
        hosts = result.hosts.len(),
        hosts_up = result.stats.hosts_up,
        hosts_total = result.stats.hosts_total,
        "Merge complete"
    );
    result
}

/// One host per partition, concatenated in completion order.
fn merge_host_wise(
    requested: usize,
    reports: Vec<ToolReport>,
    started_at: DateTime<Utc>,
    elapsed_secs: f64,
) -> CanonicalResult {
    let mut hosts: Vec<HostRecord> = reports.into_iter().flat_map(|r| r.hosts).collect();
    for host in &mut hosts {
        normalize_ports(&mut host.ports);
    }

    let total = u32::try_from(requested).unwrap_or(u32::MAX);
    let up = u32::try_from(hosts.len()).unwrap_or(u32::MAX).min(total);
    let stats = synthesize(started_at, elapsed_secs, total, up);
    CanonicalResult { hosts, stats }
}

/// Same host in every partition: the first one is the base, ports are the
/// union of all partitions.
fn merge_port_wise(
    reports: Vec<ToolReport>,
    started_at: DateTime<Utc>,
    elapsed_secs: f64,
) -> CanonicalResult {
    let mut partials = reports.into_iter().flat_map(|r| r.hosts);

    let Some(mut base) = partials.next() else {
        // Host was down in every partition.
        return CanonicalResult {
            hosts: Vec::new(),
            stats: synthesize(started_at, elapsed_secs, 1, 0),
        };
    };

    for partial in partials {
        base.ports.extend(partial.ports);
    }
    normalize_ports(&mut base.ports);

    CanonicalResult {
        hosts: vec![base],
        stats: synthesize(started_at, elapsed_secs, 1, 1),
    }
}

fn pass_through(
    reports: Vec<ToolReport>,
    started_at: DateTime<Utc>,
    elapsed_secs: f64,
) -> CanonicalResult {
    let (hosts, reported) = match reports.into_iter().next() {
        Some(report) => (report.hosts, report.stats.unwrap_or_default()),
        None => (Vec::new(), ReportedStats::default()),
    };
    let seen = u32::try_from(hosts.len()).unwrap_or(u32::MAX);
    let stats = reported.into_run_stats(started_at, elapsed_secs, seen);
    CanonicalResult { hosts, stats }
}

fn synthesize(started_at: DateTime<Utc>, elapsed_secs: f64, total: u32, up: u32) -> RunStats {
    RunStats {
        started_at,
        elapsed_secs,
        hosts_up: up,
        hosts_down: total - up,
        hosts_total: total,
        summary: run_summary(started_at, total, up, elapsed_secs),
    }
}

/// Ascending by port number, one entry per port.
fn normalize_ports(ports: &mut Vec<PortRecord>) {
    ports.sort_by(|a, b| {
        a.port
            .cmp(&b.port)
            .then_with(|| a.protocol.as_str().cmp(b.protocol.as_str()))
            .then_with(|| a.service.cmp(&b.service))
    });
    ports.dedup_by_key(|p| p.port);
}
