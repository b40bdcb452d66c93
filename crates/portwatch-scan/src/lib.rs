//! portwatch-scan: Partitioned nmap scan coordinator.
//!
//! Validates scan requests, splits them into bounded-concurrency nmap
//! invocations, relays live progress, merges the partial results into one
//! canonical result and records service-level changes against the previous
//! scan of the same target.

pub mod config;
pub mod coordinator;
pub mod diff;
pub mod error;
pub mod executor;
pub mod merge;
pub mod nmap_xml;
pub mod partition;
pub mod relay;
pub mod report;
pub mod scanner;
pub mod scheduler;
pub mod spec;

pub use coordinator::{Accepted, ScanCoordinator, ScanHandle, ScanReport};
pub use error::{RequestFailure, ScanError, SpecError, TaskError};
pub use executor::TaskRunner;
pub use scanner::NmapScanner;
pub use spec::{RequestInput, SpecLimits};
