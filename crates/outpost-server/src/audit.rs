// outpost-server/src/audit.rs
// ============================================================================
// Module: Server Audit Log
// Description: Structured audit events for API calls and security decisions.
// Purpose: Record who did what to which subject, as JSON lines.
// Dependencies: serde, serde_json, time
// ============================================================================

//! ## Overview
//! Every API call and security-relevant server decision emits an
//! [`AuditEvent`] through the [`AuditSink`] interface. Sinks write JSON
//! lines; the stderr sink is the default for operators, the file sink is for
//! retention, and the noop sink is for tests.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use outpost_core::Timestamp;

// ============================================================================
// SECTION: Events
// ============================================================================

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The action was allowed and succeeded.
    Allowed,
    /// The action was denied by authentication or authorization.
    Denied,
    /// The action failed after authorization.
    Failed,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Event time.
    pub timestamp: Timestamp,
    /// Acting username, when authenticated.
    pub username: Option<String>,
    /// Action label, e.g. `flows.start` or `hunts.stop`.
    pub action: String,
    /// Subject identifier, when any.
    pub subject: Option<String>,
    /// Outcome.
    pub outcome: AuditOutcome,
    /// Short detail message.
    pub detail: Option<String>,
}

// ============================================================================
// SECTION: Sink Interface
// ============================================================================

/// Audit event sink.
pub trait AuditSink: Send + Sync {
    /// Records one event. Sinks must not fail the caller.
    fn record(&self, event: &AuditEvent);
}

/// Audit sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: &AuditEvent) {}
}

// ============================================================================
// SECTION: Stderr Sink
// ============================================================================

/// Audit sink writing JSON lines to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrAuditSink;

impl AuditSink for StderrAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(line) = render_line(event) {
            #[allow(clippy::print_stderr, reason = "stderr is this sink's output channel")]
            {
                eprintln!("{line}");
            }
        }
    }
}

// ============================================================================
// SECTION: File Sink
// ============================================================================

/// Audit sink appending JSON lines to a file.
#[derive(Debug)]
pub struct FileAuditSink {
    /// Open output file guarded for concurrent writers.
    file: Mutex<File>,
}

impl FileAuditSink {
    /// Opens or creates the audit file in append mode.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the file cannot be opened.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(line) = render_line(event)
            && let Ok(mut guard) = self.file.lock()
        {
            let _ = writeln!(guard, "{line}");
        }
    }
}

// ============================================================================
// SECTION: Rendering
// ============================================================================

/// Serialized audit line with a human-readable time prefix.
#[derive(Debug, Serialize)]
struct AuditLine<'a> {
    /// RFC 3339 rendering of the event time.
    time: String,
    /// The event itself.
    #[serde(flatten)]
    event: &'a AuditEvent,
}

/// Renders one event as a JSON line.
fn render_line(event: &AuditEvent) -> Result<String, serde_json::Error> {
    let time = OffsetDateTime::from_unix_timestamp_nanos(
        i128::from(event.timestamp.as_micros()) * 1_000,
    )
    .ok()
    .and_then(|stamp| stamp.format(&Rfc3339).ok())
    .unwrap_or_else(|| event.timestamp.to_string());
    serde_json::to_string(&AuditLine { time, event })
}
