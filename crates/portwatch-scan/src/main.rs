//! CLI entry point for the portwatch scan coordinator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use portwatch_core::{BroadcastSink, EventPayload, ScanId, ScanMode, ScanStatus};
use portwatch_store::{FileScanStore, ScanQuery};

use portwatch_scan::config::ScanConfig;
use portwatch_scan::scheduler::{JobSpec, JobStore, Scheduler};
use portwatch_scan::{NmapScanner, RequestInput, ScanCoordinator, ScanReport};

#[derive(Parser)]
#[command(name = "portwatch")]
#[command(about = "Partitioned nmap scans with service change detection")]
struct Cli {
    /// Config file prefix (default: portwatch).
    #[arg(short, long, default_value = "portwatch")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one scan and print its result as JSON.
    Scan {
        /// IPv4/IPv6 address or CIDR block.
        target: String,

        /// Port expression, e.g. 22,80,1000-2000.
        #[arg(short, long, default_value = "")]
        ports: String,

        /// Extra nmap flags, e.g. "-sV -T4".
        #[arg(short, long, default_value = "", allow_hyphen_values = true)]
        flags: String,

        /// Execution mode: single or parallel.
        #[arg(short, long, default_value = "single")]
        mode: String,

        /// Maximum concurrent nmap processes.
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Re-run a stored scan with the same parameters.
    Rescan { id: u64 },

    /// List stored scans, newest first.
    History {
        #[arg(long)]
        target: Option<String>,

        #[arg(long)]
        mode: Option<String>,

        /// running, completed or failed.
        #[arg(long)]
        status: Option<String>,

        /// Only scans accepted at or after this RFC 3339 timestamp.
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Only scans accepted at or before this RFC 3339 timestamp.
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },

    /// Show the change records of a scan.
    Changes { id: u64 },

    /// Run configured scheduled jobs until interrupted.
    Daemon,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();
    let config = load_scan_config(&cli.config)?;

    let store = Arc::new(FileScanStore::new(&config.store_dir)?);
    let sink = Arc::new(BroadcastSink::new(config.event_buffer));
    spawn_event_logger(&sink);

    let output_dir = config
        .output_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let scanner = NmapScanner::new(&config.nmap_path, output_dir);
    let coordinator = ScanCoordinator::new(
        Arc::new(scanner.clone()),
        store,
        sink,
        config.limits(),
    );

    match cli.command {
        Command::Scan {
            target,
            ports,
            flags,
            mode,
            concurrency,
        } => {
            verify_nmap(&scanner).await?;
            let accepted = coordinator.submit(RequestInput {
                target,
                ports,
                flags,
                mode,
                concurrency,
            })?;
            tracing::info!(scan_id = %accepted.scan_id, command = %accepted.command, "Scan started");
            print_report(&accepted.handle.join().await?)?;
        }
        Command::Rescan { id } => {
            verify_nmap(&scanner).await?;
            let accepted = coordinator.rescan(ScanId(id))?;
            tracing::info!(scan_id = %accepted.scan_id, command = %accepted.command, "Rescan started");
            print_report(&accepted.handle.join().await?)?;
        }
        Command::History {
            target,
            mode,
            status,
            since,
            until,
        } => {
            let query = ScanQuery {
                target,
                mode: mode.as_deref().map(ScanMode::from_hint),
                status: status.as_deref().map(parse_status).transpose()?,
                since,
                until,
            };
            let scans = coordinator.history(&query)?;
            println!("{}", serde_json::to_string_pretty(&scans)?);
        }
        Command::Changes { id } => {
            let changes = coordinator.changes(ScanId(id))?;
            println!("{}", serde_json::to_string_pretty(&changes)?);
        }
        Command::Daemon => {
            verify_nmap(&scanner).await?;
            let jobs = JobStore::new(config.limits());
            for job in &config.jobs {
                if let Err(e) = jobs.submit(JobSpec::from(job)) {
                    tracing::error!(target = %job.target, error = %e, "Invalid scheduled job, skipping");
                }
            }

            let scheduler = Scheduler::new(
                jobs,
                coordinator,
                Duration::from_secs(config.scheduler_tick_secs),
            );
            tokio::select! {
                _ = scheduler.run() => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutting down scheduler");
                }
            }
        }
    }

    Ok(())
}

async fn verify_nmap(scanner: &NmapScanner) -> anyhow::Result<()> {
    let version = scanner.verify_installation().await?;
    tracing::info!(nmap_version = %version.lines().next().unwrap_or_default().trim(), "Nmap verified");
    Ok(())
}

fn spawn_event_logger(sink: &BroadcastSink) {
    let mut rx = sink.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match &event.payload {
                EventPayload::Progress { percent } => {
                    tracing::info!(scan_id = %event.scan_id, percent, "Progress");
                }
                EventPayload::Update { message } => {
                    tracing::debug!(scan_id = %event.scan_id, message = %message, "Update");
                }
                EventPayload::Error { message } => {
                    tracing::warn!(scan_id = %event.scan_id, message = %message, "Scan error");
                }
                EventPayload::Complete => {
                    tracing::info!(scan_id = %event.scan_id, "Scan complete");
                }
            }
        }
    });
}

fn print_report(report: &ScanReport) -> anyhow::Result<()> {
    let out = serde_json::json!({
        "scan": report.scan,
        "change": report.change,
        "failure": report.failure.as_ref().map(ToString::to_string),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn parse_status(s: &str) -> anyhow::Result<ScanStatus> {
    match s.to_lowercase().as_str() {
        "running" => Ok(ScanStatus::Running),
        "completed" => Ok(ScanStatus::Completed),
        "failed" => Ok(ScanStatus::Failed),
        _ => anyhow::bail!("Invalid status: {s}. Choose: running, completed, failed"),
    }
}

fn load_scan_config(file_prefix: &str) -> anyhow::Result<ScanConfig> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("PORTWATCH")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    match cfg.get::<ScanConfig>("scan") {
        Ok(c) => Ok(c),
        Err(_) => Ok(ScanConfig::default()),
    }
}
