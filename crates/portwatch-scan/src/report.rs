//! Typed conversion of a parsed nmap run into domain records.
//!
//! Every downstream consumer works on [`HostRecord`]/[`PortRecord`]; the raw
//! XML structs never leave this step.

use chrono::{DateTime, Utc};

use portwatch_core::{
    HostRecord, OsGuess, PortRecord, PortState, Protocol, RunStats, ScriptRecord,
};

use crate::error::TaskError;
use crate::nmap_xml::{self, NmapHost, NmapPort, NmapRun, Script};

/// What one tool invocation reported.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolReport {
    /// Hosts reported up, in the tool's order.
    pub hosts: Vec<HostRecord>,
    /// The tool's own run statistics, when it wrote any.
    pub stats: Option<ReportedStats>,
}

/// Run statistics as the tool reported them. Any field may be missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportedStats {
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_secs: Option<f64>,
    pub hosts_up: Option<u32>,
    pub hosts_down: Option<u32>,
    pub hosts_total: Option<u32>,
    pub summary: Option<String>,
}

impl ToolReport {
    /// Parse the XML the tool wrote and convert it in one step.
    pub fn parse(xml: &[u8]) -> Result<Self, TaskError> {
        Ok(Self::from_run(&nmap_xml::parse_nmap_xml(xml)?))
    }

    /// Only hosts the tool reported up become records, for every strategy.
    /// Down hosts survive only in the reported counts.
    pub fn from_run(run: &NmapRun) -> Self {
        let hosts = run
            .hosts
            .iter()
            .filter(|h| h.is_up())
            .filter_map(convert_host)
            .collect();

        let started_at = run.start.and_then(|secs| DateTime::from_timestamp(secs, 0));
        let stats = run.runstats.as_ref().map(|rs| {
            let finished = rs.finished.as_ref();
            let counts = rs.hosts.as_ref();
            ReportedStats {
                started_at,
                elapsed_secs: finished
                    .and_then(|f| f.elapsed.as_deref())
                    .and_then(|e| e.parse().ok()),
                hosts_up: counts.and_then(|c| c.up.as_deref()).and_then(|v| v.parse().ok()),
                hosts_down: counts
                    .and_then(|c| c.down.as_deref())
                    .and_then(|v| v.parse().ok()),
                hosts_total: counts
                    .and_then(|c| c.total.as_deref())
                    .and_then(|v| v.parse().ok()),
                summary: finished.and_then(|f| f.summary.clone()),
            }
        });

        Self { hosts, stats }
    }
}

impl ReportedStats {
    /// Fill the gaps in the tool's report from what the caller observed.
    pub fn into_run_stats(self, started_at: DateTime<Utc>, elapsed_secs: f64, hosts_seen: u32) -> RunStats {
        let elapsed_secs = self.elapsed_secs.unwrap_or(elapsed_secs);
        let hosts_up = self.hosts_up.unwrap_or(hosts_seen);
        let hosts_total = self.hosts_total.unwrap_or(hosts_up.max(1));
        let hosts_down = self
            .hosts_down
            .unwrap_or(hosts_total.saturating_sub(hosts_up));
        let started_at = self.started_at.unwrap_or(started_at);
        let summary = self
            .summary
            .unwrap_or_else(|| run_summary(started_at, hosts_total, hosts_up, elapsed_secs));

        RunStats {
            started_at,
            elapsed_secs,
            hosts_up,
            hosts_down,
            hosts_total,
            summary,
        }
    }
}

/// Human-readable one-line summary in the tool's own phrasing.
pub fn run_summary(at: DateTime<Utc>, total: u32, up: u32, elapsed_secs: f64) -> String {
    format!(
        "Nmap done at {}; {total} IP address(es) ({up} host(s) up) scanned in {elapsed_secs:.2} seconds",
        at.format("%Y-%m-%d %H:%M:%S")
    )
}

fn convert_host(host: &NmapHost) -> Option<HostRecord> {
    let address = host.ipv4().or_else(|| host.ipv6())?;

    let ports = host
        .ports
        .as_ref()
        .map(|p| p.ports.iter().map(convert_port).collect())
        .unwrap_or_default();

    Some(HostRecord {
        address: address.to_string(),
        mac: host.mac().map(String::from),
        hostname: host.hostname().map(String::from),
        os: host.best_os().map(|m| OsGuess {
            name: m.name.clone(),
            accuracy: m.accuracy.as_deref().and_then(|a| a.parse().ok()),
        }),
        ports,
        scripts: host
            .hostscript
            .as_ref()
            .map(|hs| convert_scripts(&hs.scripts))
            .unwrap_or_default(),
    })
}

fn convert_port(port: &NmapPort) -> PortRecord {
    let service = port.service.as_ref();
    let version = service.and_then(|svc| match (&svc.product, &svc.version) {
        (Some(p), Some(v)) => Some(format!("{p} {v}")),
        (Some(p), None) => Some(p.clone()),
        (None, Some(v)) => Some(v.clone()),
        (None, None) => None,
    });

    PortRecord {
        port: port.port_id,
        protocol: parse_protocol(&port.protocol),
        state: parse_port_state(&port.state.state),
        service: service.map(|svc| svc.name.clone()),
        version,
        scripts: convert_scripts(&port.scripts),
    }
}

fn convert_scripts(scripts: &[Script]) -> Vec<ScriptRecord> {
    scripts
        .iter()
        .map(|s| ScriptRecord {
            id: s.id.clone(),
            output: s.output.clone(),
        })
        .collect()
}

fn parse_protocol(proto: &str) -> Protocol {
    match proto.to_lowercase().as_str() {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        "sctp" => Protocol::Sctp,
        _ => Protocol::Other(proto.to_string()),
    }
}

fn parse_port_state(state: &str) -> PortState {
    match state.to_lowercase().as_str() {
        "open" => PortState::Open,
        "closed" => PortState::Closed,
        _ => PortState::Filtered,
    }
}
