//! Work partitioning.
//!
//! Policy, in order:
//! 1. A network block with more than one host address is split host-wise.
//! 2. A `parallel` request with a port expression is split port-wise into
//!    contiguous, near-equal chunks.
//! 3. Anything else runs as one task.

use portwatch_core::{ScanId, ScanMode, ScanRequest, ScanTarget, ScanTask, TaskId};

use crate::spec::expand_ports;

/// How a request was split. Drives how partial results are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One task per host address of the block.
    HostWise { hosts: usize },
    /// One task per chunk of the port set, all against the same host.
    PortWise,
    /// The whole request as a single task.
    Single,
}

/// The tasks derived from one request and the pool size to run them with.
#[derive(Debug, Clone)]
pub struct Partition {
    pub strategy: Strategy,
    pub tasks: Vec<ScanTask>,
    /// Always between 1 and `tasks.len()`.
    pub concurrency: usize,
}

/// Split a request into tasks. Always yields at least one task.
pub fn partition(scan_id: ScanId, request: &ScanRequest) -> Partition {
    let limit = request.concurrency.max(1);

    if let ScanTarget::Network(net) = &request.target {
        let hosts: Vec<String> = net.hosts().map(|ip| ip.to_string()).collect();
        if hosts.len() > 1 {
            let count = hosts.len();
            let tasks = hosts
                .into_iter()
                .map(|host| task(scan_id, host, request.ports.clone(), request))
                .collect();
            return Partition {
                strategy: Strategy::HostWise { hosts: count },
                tasks,
                concurrency: limit.min(count),
            };
        }
    }

    if request.mode == ScanMode::Parallel {
        let ports = request
            .ports
            .as_deref()
            .and_then(|expr| expand_ports(expr).ok())
            .unwrap_or_default();

        if !ports.is_empty() {
            let target = request.target.literal();
            let tasks: Vec<ScanTask> = chunk_ports(&ports, limit)
                .into_iter()
                .map(|chunk| task(scan_id, target.clone(), Some(chunk), request))
                .collect();
            let concurrency = limit.min(tasks.len());
            return Partition {
                strategy: Strategy::PortWise,
                tasks,
                concurrency,
            };
        }
    }

    Partition {
        strategy: Strategy::Single,
        tasks: vec![task(
            scan_id,
            request.target.literal(),
            request.ports.clone(),
            request,
        )],
        concurrency: 1,
    }
}

/// Split sorted ports into `min(limit, len)` groups of `ceil(len / groups)`
/// consecutive entries, rendered as comma-separated port lists.
pub fn chunk_ports(ports: &[u16], limit: usize) -> Vec<String> {
    if ports.is_empty() {
        return Vec::new();
    }
    let groups = limit.max(1).min(ports.len());
    let size = ports.len().div_ceil(groups);

    ports
        .chunks(size)
        .map(|chunk| {
            chunk
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect()
}

fn task(scan_id: ScanId, target: String, ports: Option<String>, request: &ScanRequest) -> ScanTask {
    ScanTask {
        id: TaskId::new(),
        scan_id,
        target,
        ports,
        flags: request.flags.clone(),
    }
}
