//! portwatch-core: Shared types for the portwatch scan coordinator.
//!
//! This crate provides the foundational types used across all portwatch crates:
//! - Scan requests, partitions and their lifecycle status
//! - Host, port and script records produced by the probing tool
//! - Merged results, service fingerprints and change records
//! - Live scan events and the sink they are published through

pub mod events;
pub mod types;

pub use events::{BroadcastSink, EventPayload, EventSink, ScanEvent};
pub use types::{
    CanonicalResult, ChangeRecord, HostRecord, OsGuess, PortRecord, PortState, Protocol,
    RunStats, ScanId, ScanMode, ScanRequest, ScanStatus, ScanTarget, ScanTask, ScriptRecord,
    ServiceFingerprint, TaskId,
};
