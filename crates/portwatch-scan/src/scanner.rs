//! Nmap process wrapper.
//!
//! Executes nmap as a child process via `tokio::process::Command`, relays
//! its console output line by line while it runs, then parses the XML file
//! it wrote into a [`ToolReport`].

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use portwatch_core::ScanTask;

use crate::error::TaskError;
use crate::executor::TaskRunner;
use crate::relay::ProgressRelay;
use crate::report::ToolReport;

/// Wrapper around the nmap binary.
#[derive(Debug, Clone)]
pub struct NmapScanner {
    nmap_path: String,
    output_dir: PathBuf,
}

impl NmapScanner {
    pub fn new(nmap_path: &str, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            nmap_path: nmap_path.to_string(),
            output_dir: output_dir.into(),
        }
    }

    /// Verify nmap is installed and accessible.
    pub async fn verify_installation(&self) -> Result<String, TaskError> {
        let output = Command::new(&self.nmap_path)
            .arg("--version")
            .output()
            .await
            .map_err(|e| TaskError::ToolNotFound {
                path: self.nmap_path.clone(),
                reason: e.to_string(),
            })?;

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Where the XML output of `task` is written.
    pub fn output_path(&self, task: &ScanTask) -> PathBuf {
        self.output_dir
            .join(format!("nmap_{}_{}.xml", task.scan_id, task.id))
    }

    /// Full argument list for one task, excluding the program name.
    ///
    /// `-v` is added unless the flags already set a verbosity or debug level,
    /// so discovery lines always reach the relay.
    pub fn build_args(task: &ScanTask, output_path: &Path) -> Vec<String> {
        let mut args = vec!["-Pn".to_string()];
        if let Some(ports) = &task.ports {
            args.push("-p".to_string());
            args.push(ports.clone());
        }
        args.extend(task.flags.iter().cloned());
        args.push("-oX".to_string());
        args.push(output_path.display().to_string());
        if !task.flags.iter().any(|f| is_verbosity_flag(f)) {
            args.push("-v".to_string());
        }
        args.push(task.target.clone());
        args
    }
}

/// `-v`, `-vv`, `-v3`, `-d`, `-d2` and friends.
fn is_verbosity_flag(flag: &str) -> bool {
    let Some(rest) = flag.strip_prefix('-') else {
        return false;
    };
    let mut chars = rest.chars();
    match chars.next() {
        Some(lead @ ('v' | 'd')) => {
            let tail = chars.as_str();
            tail.chars().all(|c| c == lead) || tail.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

/// Removes the task's XML output file however the task ends.
struct OutputFile(PathBuf);

impl Drop for OutputFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.0.display(), error = %e, "Failed to remove nmap output file");
            }
        }
    }
}

/// Map how the child ended to a task error. A status that cannot be
/// collected, or one without an exit code (killed by a signal), is `-1`.
fn check_exit(status: std::io::Result<ExitStatus>) -> Result<(), TaskError> {
    let status = status.map_err(|e| {
        tracing::warn!(error = %e, "Failed to wait for nmap");
        TaskError::ToolExitedNonZero { code: -1 }
    })?;
    if status.success() {
        return Ok(());
    }
    Err(TaskError::ToolExitedNonZero {
        code: status.code().unwrap_or(-1),
    })
}

/// Forward every line of `reader` into `tx` until EOF.
async fn pump_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Stopped reading nmap output");
                break;
            }
        }
    }
}

#[async_trait]
impl TaskRunner for NmapScanner {
    async fn run(&self, task: &ScanTask, relay: &ProgressRelay) -> Result<ToolReport, TaskError> {
        let start = Instant::now();
        let output = OutputFile(self.output_path(task));
        let args = Self::build_args(task, &output.0);

        tracing::info!(
            scan_id = %task.scan_id,
            task_id = %task.id,
            target = %task.target,
            args = ?args,
            "Starting nmap scan"
        );

        let mut child = Command::new(&self.nmap_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskError::ToolNotFound {
                path: self.nmap_path.clone(),
                reason: e.to_string(),
            })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, tx.clone()));
        }
        drop(tx);

        while let Some(line) = rx.recv().await {
            relay.line(&line);
        }

        check_exit(child.wait().await)?;

        let xml = tokio::fs::read(&output.0)
            .await
            .map_err(TaskError::OutputUnreadable)?;
        let report = ToolReport::parse(&xml)?;

        tracing::info!(
            scan_id = %task.scan_id,
            task_id = %task.id,
            target = %task.target,
            hosts_up = report.hosts.len(),
            duration_ms = start.elapsed().as_millis(),
            "Nmap scan complete"
        );

        Ok(report)
    }
}
