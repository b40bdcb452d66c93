//! Progress relay: classifies tool output lines and republishes them.

use std::sync::Arc;

use portwatch_core::{EventSink, ScanId};

/// What a single line of tool output means.
#[derive(Debug, Clone, PartialEq)]
pub enum LineClass<'a> {
    /// `Discovered open port 22/tcp on 10.0.0.1`
    Discovery(&'a str),
    /// A `% done` timing line with its parsed percentage.
    Progress { percent: Option<u8>, line: &'a str },
    /// Anything else.
    Status(&'a str),
}

/// Classify one raw output line. Blank lines yield `None`.
pub fn classify(raw: &str) -> Option<LineClass<'_>> {
    let line = raw.trim();
    if line.is_empty() {
        return None;
    }
    if line.contains("Discovered open port") {
        return Some(LineClass::Discovery(line));
    }
    if line.contains("% done") {
        return Some(LineClass::Progress {
            percent: parse_percent(line),
            line,
        });
    }
    Some(LineClass::Status(line))
}

/// `... About 42.50% done; ETC: ...` -> 42
fn parse_percent(line: &str) -> Option<u8> {
    let before = line.split('%').next()?;
    let value: f64 = before.split_whitespace().last()?.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(value.clamp(0.0, 100.0) as u8)
}

/// Publishes the classified output of every task of one request.
///
/// Clone is cheap; each worker holds its own copy.
#[derive(Clone)]
pub struct ProgressRelay {
    scan_id: ScanId,
    sink: Arc<dyn EventSink>,
}

impl ProgressRelay {
    pub fn new(scan_id: ScanId, sink: Arc<dyn EventSink>) -> Self {
        Self { scan_id, sink }
    }

    pub fn scan_id(&self) -> ScanId {
        self.scan_id
    }

    /// Relay one line of tool output.
    pub fn line(&self, raw: &str) {
        match classify(raw) {
            None => {}
            Some(LineClass::Discovery(line)) | Some(LineClass::Status(line)) => {
                self.sink.update(self.scan_id, line);
            }
            Some(LineClass::Progress { percent, line }) => {
                if let Some(percent) = percent {
                    self.sink.progress(self.scan_id, percent);
                }
                self.sink.update(self.scan_id, line);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.sink.error(self.scan_id, message);
    }

    pub fn complete(&self) {
        self.sink.complete(self.scan_id);
    }
}
