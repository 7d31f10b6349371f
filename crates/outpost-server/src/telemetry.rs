// outpost-server/src/telemetry.rs
// ============================================================================
// Module: Server Telemetry
// Description: Metric events and sinks for server observability.
// Purpose: Count polls, decrypt failures, flow transitions, and bytes moved.
// Dependencies: std
// ============================================================================

//! ## Overview
//! The server emits typed metric events through the [`ServerMetrics`]
//! interface. Hosts plug in an exporter; tests use [`CountingMetrics`] to
//! assert on event counts; [`NoopMetrics`] discards everything.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Mutex;

// ============================================================================
// SECTION: Events
// ============================================================================

/// Typed server metric events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerMetricEvent {
    /// An agent poll was served successfully.
    PollOk,
    /// An agent poll was rejected before decoding completed.
    PollRejected,
    /// A bundle failed HMAC or decryption checks and was dropped.
    DecryptFailure,
    /// A bundle failed the nonce monotonicity check and was dropped.
    ReplayDropped,
    /// A malformed wire message was dropped.
    MalformedDropped,
    /// A deferred well-known message handler failed.
    HandlerFailed,
    /// An inline blob upload failed to persist.
    BlobWriteFailure,
    /// A client enrolled.
    ClientEnrolled,
    /// A client crash was recorded.
    ClientCrash,
    /// A flow reached a terminal state.
    FlowCompleted,
    /// An outbound message was dropped at the retransmission limit.
    RetransmissionDropped,
    /// A hunt was stopped by a ceiling breach.
    HuntCeilingStop,
}

// ============================================================================
// SECTION: Metrics Interface
// ============================================================================

/// Metrics sink for server events.
pub trait ServerMetrics: Send + Sync {
    /// Records one occurrence of an event.
    fn increment(&self, event: ServerMetricEvent);

    /// Records bytes received from agents.
    fn add_received_bytes(&self, bytes: u64);

    /// Records bytes sent to agents.
    fn add_sent_bytes(&self, bytes: u64);
}

/// Metrics sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl ServerMetrics for NoopMetrics {
    fn increment(&self, _event: ServerMetricEvent) {}

    fn add_received_bytes(&self, _bytes: u64) {}

    fn add_sent_bytes(&self, _bytes: u64) {}
}

/// In-memory counting metrics for tests and the stats endpoint.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    /// Event counters.
    counters: Mutex<HashMap<ServerMetricEvent, u64>>,
    /// Byte counters: `(received, sent)`.
    bytes: Mutex<(u64, u64)>,
}

impl CountingMetrics {
    /// Creates a zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the count for one event.
    #[must_use]
    pub fn count(&self, event: ServerMetricEvent) -> u64 {
        self.counters.lock().map(|guard| guard.get(&event).copied().unwrap_or(0)).unwrap_or(0)
    }

    /// Returns `(received, sent)` byte totals.
    #[must_use]
    pub fn byte_totals(&self) -> (u64, u64) {
        self.bytes.lock().map(|guard| *guard).unwrap_or((0, 0))
    }
}

impl ServerMetrics for CountingMetrics {
    fn increment(&self, event: ServerMetricEvent) {
        if let Ok(mut guard) = self.counters.lock() {
            *guard.entry(event).or_insert(0) += 1;
        }
    }

    fn add_received_bytes(&self, bytes: u64) {
        if let Ok(mut guard) = self.bytes.lock() {
            guard.0 = guard.0.saturating_add(bytes);
        }
    }

    fn add_sent_bytes(&self, bytes: u64) {
        if let Ok(mut guard) = self.bytes.lock() {
            guard.1 = guard.1.saturating_add(bytes);
        }
    }
}
