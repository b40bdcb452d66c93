//! Scan request validation.
//!
//! Turns the free-form fields a requester submits into a [`ScanRequest`].
//! Pure: nothing here touches the store or spawns a task.

use std::net::IpAddr;
use std::sync::OnceLock;

use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};

use portwatch_core::{ScanMode, ScanRequest, ScanTarget};

use crate::error::SpecError;

/// Request fields as supplied by the requester.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestInput {
    pub target: String,
    #[serde(default)]
    pub ports: String,
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub mode: String,
    /// Concurrency hint; missing or zero falls back to the configured default.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

/// Bounds applied while validating a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecLimits {
    pub default_concurrency: usize,
    pub max_hosts: usize,
}

impl Default for SpecLimits {
    fn default() -> Self {
        Self {
            default_concurrency: 100,
            max_hosts: 65_536,
        }
    }
}

fn port_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\d+(?:-\d+)?(?:,\d+(?:-\d+)?)*$").expect("port pattern is valid")
    })
}

/// Validate every field and build the canonical request.
pub fn parse_request(input: &RequestInput, limits: &SpecLimits) -> Result<ScanRequest, SpecError> {
    let target = parse_target(&input.target, limits.max_hosts)?;
    let ports = parse_ports(&input.ports)?;

    let concurrency = match input.concurrency {
        Some(n) if n > 0 => n,
        _ => limits.default_concurrency.max(1),
    };

    Ok(ScanRequest {
        target,
        ports,
        flags: tokenize_flags(&input.flags),
        mode: ScanMode::from_hint(&input.mode),
        concurrency,
    })
}

/// Parse a single address or a network block.
///
/// Blocks are truncated to their network address (`10.0.0.7/24` becomes
/// `10.0.0.0/24`) and rejected when they hold more than `max_hosts` hosts.
pub fn parse_target(raw: &str, max_hosts: usize) -> Result<ScanTarget, SpecError> {
    let raw = raw.trim();
    if raw.contains('/') {
        let net: IpNet = raw
            .parse()
            .map_err(|_| SpecError::InvalidTarget(raw.to_string()))?;
        let net = net.trunc();
        if net.hosts().take(max_hosts.saturating_add(1)).count() > max_hosts {
            return Err(SpecError::TargetTooLarge {
                target: net.to_string(),
                max_hosts,
            });
        }
        Ok(ScanTarget::Network(net))
    } else {
        raw.parse::<IpAddr>()
            .map(ScanTarget::Host)
            .map_err(|_| SpecError::InvalidTarget(raw.to_string()))
    }
}

/// Validate a port expression. Empty input means "no port restriction".
pub fn parse_ports(raw: &str) -> Result<Option<String>, SpecError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    // Syntax first, then the numeric bounds.
    expand_ports(raw)?;
    Ok(Some(raw.to_string()))
}

/// Expand a port expression into its sorted, de-duplicated port numbers.
pub fn expand_ports(raw: &str) -> Result<Vec<u16>, SpecError> {
    if !port_pattern().is_match(raw) {
        return Err(SpecError::InvalidPortSpec(raw.to_string()));
    }

    let invalid = || SpecError::InvalidPortSpec(raw.to_string());
    let mut ports = Vec::new();
    for part in raw.split(',') {
        let (start, end) = match part.split_once('-') {
            Some((s, e)) => (s, e),
            None => (part, part),
        };
        let start: u16 = start.parse().map_err(|_| invalid())?;
        let end: u16 = end.parse().map_err(|_| invalid())?;
        if start == 0 || start > end {
            return Err(invalid());
        }
        ports.extend(start..=end);
    }
    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

/// Split a flag string the way a POSIX shell would. Unbalanced quoting
/// passes the whole string through as a single token.
pub fn tokenize_flags(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    shlex::split(raw).unwrap_or_else(|| vec![raw.to_string()])
}

/// The command line shown to the requester when a scan is accepted.
pub fn command_preview(request: &ScanRequest) -> String {
    let mut parts = vec!["nmap".to_string(), "-Pn".to_string()];
    if let Some(ports) = &request.ports {
        parts.push("-p".to_string());
        parts.push(ports.clone());
    }
    parts.extend(request.flags.iter().cloned());
    parts.push(request.target.literal());
    parts.join(" ")
}
