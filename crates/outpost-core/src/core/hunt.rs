// outpost-core/src/core/hunt.rs
// ============================================================================
// Module: Outpost Hunt Records
// Description: Fleet-wide flow fan-out templates with rules and ceilings.
// Purpose: Provide stable, serializable hunt state for the dispatcher.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! A hunt is a flow factory: a flow template fanned out over the matching
//! client population under admission control. Hunt rows carry the rule set,
//! throttle window, global ceilings, and aggregate counters. When any ceiling
//! is exceeded the hunt transitions to `Stopped` and no further fan-out
//! occurs; already-dispatched child flows continue.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::client::Client;
use crate::core::identifiers::FlowName;
use crate::core::identifiers::HuntId;
use crate::core::identifiers::Username;
use crate::core::payload::Payload;
use crate::core::time::DurationMicros;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Hunt State
// ============================================================================

/// Lifecycle state of a hunt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HuntState {
    /// Created but not yet fanning out.
    Paused,
    /// Actively fanning out to matching clients.
    Started,
    /// Halted by a ceiling breach or an operator; no further fan-out.
    Stopped,
    /// Reached its client limit; no further fan-out.
    Completed,
}

impl HuntState {
    /// Returns true when the hunt may dispatch new child flows.
    #[must_use]
    pub const fn can_dispatch(self) -> bool {
        matches!(self, Self::Started)
    }
}

// ============================================================================
// SECTION: Client Rules
// ============================================================================

/// Predicate over client attributes used for hunt targeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientRule {
    /// Matches when the client OS is one of the named systems.
    Os {
        /// Accepted OS names, compared case-insensitively.
        os_names: Vec<String>,
    },
    /// Matches when the client carries any of the named labels.
    Label {
        /// Accepted label names.
        label_names: Vec<String>,
    },
    /// Matches when the client enrolled within the given age.
    Age {
        /// Maximum client age.
        max_age: DurationMicros,
    },
}

impl ClientRule {
    /// Evaluates the rule against a client at the given time.
    #[must_use]
    pub fn matches(&self, client: &Client, now: Timestamp) -> bool {
        match self {
            Self::Os { os_names } => {
                let os = client.knowledge_base.os.to_lowercase();
                os_names.iter().any(|name| name.to_lowercase() == os)
            }
            Self::Label { label_names } => client
                .labels
                .iter()
                .any(|label| label_names.iter().any(|name| *name == label.name)),
            Self::Age { max_age } => now.since(client.first_seen) <= *max_age,
        }
    }
}

/// How multiple rules combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMatchMode {
    /// All rules must match.
    #[default]
    All,
    /// Any rule may match.
    Any,
}

/// Rule set evaluated against each polling client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRuleSet {
    /// Combination mode.
    #[serde(default)]
    pub match_mode: RuleMatchMode,
    /// Rules to evaluate. An empty set matches every client.
    #[serde(default)]
    pub rules: Vec<ClientRule>,
}

impl ClientRuleSet {
    /// Evaluates the rule set against a client at the given time.
    #[must_use]
    pub fn matches(&self, client: &Client, now: Timestamp) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        match self.match_mode {
            RuleMatchMode::All => self.rules.iter().all(|rule| rule.matches(client, now)),
            RuleMatchMode::Any => self.rules.iter().any(|rule| rule.matches(client, now)),
        }
    }
}

// ============================================================================
// SECTION: Hunt Record
// ============================================================================

/// Persistent record for one hunt, keyed by [`HuntId`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hunt {
    /// Hunt identifier.
    pub hunt_id: HuntId,
    /// Username that created the hunt.
    pub creator: Username,
    /// Operator description.
    pub description: String,
    /// Flow class dispatched to each matching client.
    pub flow_name: FlowName,
    /// Flow class arguments template.
    pub flow_args: Payload,
    /// Client targeting rules.
    pub client_rule_set: ClientRuleSet,
    /// Maximum dispatches per minute; zero disables throttling (rapid mode).
    pub client_rate: u32,
    /// Maximum total clients; fan-out completes at this count.
    pub client_limit: u64,
    /// Maximum crashed clients before the hunt stops.
    pub crash_limit: u64,
    /// Maximum average CPU seconds per client before the hunt stops.
    pub avg_cpu_seconds_per_client_limit: f64,
    /// Maximum average network bytes per client before the hunt stops.
    pub avg_network_bytes_per_client_limit: u64,
    /// Maximum average results per client before the hunt stops.
    pub avg_results_per_client_limit: u64,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Lifecycle state.
    pub state: HuntState,
    /// Number of clients dispatched to.
    pub num_clients: u64,
    /// Number of child flows that finished successfully.
    pub num_successful: u64,
    /// Number of child flows that terminated with an error.
    pub num_failed: u64,
    /// Number of child flows that crashed the agent.
    pub num_crashed: u64,
    /// Number of results persisted across all child flows.
    pub num_results: u64,
    /// Total CPU seconds across all child flows.
    pub total_cpu_seconds: f64,
    /// Total network bytes across all child flows.
    pub total_network_bytes: u64,
    /// Start of the current throttle window.
    pub throttle_window_start: Timestamp,
    /// Dispatches within the current throttle window.
    pub dispatches_this_window: u32,
}

/// Counter deltas applied atomically to a hunt row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HuntCounterDelta {
    /// Increment for successfully finished child flows.
    pub num_successful: u64,
    /// Increment for failed child flows.
    pub num_failed: u64,
    /// Increment for crashed child flows.
    pub num_crashed: u64,
    /// Increment for persisted results.
    pub num_results: u64,
    /// CPU seconds to accumulate.
    pub total_cpu_seconds: f64,
    /// Network bytes to accumulate.
    pub total_network_bytes: u64,
}

/// Outcome of an atomic hunt admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HuntAdmissionDecision {
    /// The dispatch was admitted; counters were updated.
    Admitted,
    /// The client limit is reached; the hunt should complete.
    LimitReached,
    /// The throttle window is exhausted; retry on a later scan.
    Throttled,
    /// The hunt is not in a dispatching state.
    NotRunning,
}

/// Result of an atomic hunt admission attempt with the updated row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HuntAdmission {
    /// Admission decision.
    pub decision: HuntAdmissionDecision,
    /// Hunt row after the attempt.
    pub hunt: Hunt,
}

impl Hunt {
    /// Returns the ceiling breached by the current counters, when any.
    ///
    /// Averages use `total / num_clients`; ceilings set to zero are disabled.
    #[must_use]
    pub fn breached_ceiling(&self) -> Option<&'static str> {
        if self.crash_limit > 0 && self.num_crashed >= self.crash_limit {
            return Some("crash limit exceeded");
        }
        if self.num_clients == 0 {
            return None;
        }
        let clients = self.num_clients;
        if self.avg_results_per_client_limit > 0
            && self.num_results / clients > self.avg_results_per_client_limit
        {
            return Some("average results per client limit exceeded");
        }
        if self.avg_cpu_seconds_per_client_limit > 0.0 {
            #[allow(clippy::cast_precision_loss, reason = "client counts stay far below 2^52")]
            let avg_cpu = self.total_cpu_seconds / clients as f64;
            if avg_cpu > self.avg_cpu_seconds_per_client_limit {
                return Some("average cpu seconds per client limit exceeded");
            }
        }
        if self.avg_network_bytes_per_client_limit > 0
            && self.total_network_bytes / clients > self.avg_network_bytes_per_client_limit
        {
            return Some("average network bytes per client limit exceeded");
        }
        None
    }
}
