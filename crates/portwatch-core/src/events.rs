//! Live scan events and the sink they are published through.
//!
//! Publication is fire-and-forget: a sink never reports failure back to the
//! caller, so a missing or lagging observer can never stall a running scan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::ScanId;

/// An event emitted while a scan request is running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanEvent {
    pub scan_id: ScanId,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl ScanEvent {
    pub fn new(scan_id: ScanId, payload: EventPayload) -> Self {
        Self {
            scan_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// The event payload, tagged by type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Percentage of the tool's current phase, clamped to 0..=100.
    Progress { percent: u8 },
    /// A status or discovery line from the tool's output.
    Update { message: String },
    /// A task or request level failure.
    Error { message: String },
    /// The request reached a terminal state.
    Complete,
}

/// The event-publishing collaborator.
pub trait EventSink: Send + Sync {
    /// Publish one event. Must not block and must swallow delivery failures.
    fn publish(&self, event: ScanEvent);

    fn progress(&self, scan_id: ScanId, percent: u8) {
        self.publish(ScanEvent::new(scan_id, EventPayload::Progress { percent }));
    }

    fn update(&self, scan_id: ScanId, message: &str) {
        self.publish(ScanEvent::new(
            scan_id,
            EventPayload::Update {
                message: message.to_string(),
            },
        ));
    }

    fn error(&self, scan_id: ScanId, message: &str) {
        self.publish(ScanEvent::new(
            scan_id,
            EventPayload::Error {
                message: message.to_string(),
            },
        ));
    }

    fn complete(&self, scan_id: ScanId) {
        self.publish(ScanEvent::new(scan_id, EventPayload::Complete));
    }
}

/// Fan-out sink backed by a tokio broadcast channel.
///
/// Clone is cheap. Events sent while nobody is subscribed are dropped.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ScanEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: ScanEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No event subscribers, dropping event");
        }
    }
}
