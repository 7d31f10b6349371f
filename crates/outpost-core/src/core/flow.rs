// outpost-core/src/core/flow.rs
// ============================================================================
// Module: Outpost Flow Records
// Description: Persistent flow, request, response, and outbound message records.
// Purpose: Provide stable, serializable state for the flow engine and queues.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! A flow is a persistent multi-step investigation driven by the server. The
//! engine persists everything between states: the state name, accumulated
//! counters, and a per-flow typed state blob. Requests and responses form the
//! correlation layer between the engine and the agent; outbound client
//! messages are the leased transport queue feeding the poll loop.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::identifiers::ClientId;
use crate::core::identifiers::FlowId;
use crate::core::identifiers::FlowName;
use crate::core::identifiers::HuntId;
use crate::core::identifiers::MessageId;
use crate::core::identifiers::RequestId;
use crate::core::identifiers::ResponseId;
use crate::core::identifiers::Username;
use crate::core::payload::Payload;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Flow State
// ============================================================================

/// Lifecycle state of a flow. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// The flow has outstanding work.
    Running,
    /// The flow completed successfully.
    Finished,
    /// The flow terminated with an error.
    Error,
    /// The agent crashed while servicing the flow.
    Crashed,
}

impl FlowState {
    /// Returns true for terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

// ============================================================================
// SECTION: Resource Usage
// ============================================================================

/// CPU usage reported in a terminal status, split user/system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    /// User CPU seconds.
    pub user_seconds: f64,
    /// System CPU seconds.
    pub system_seconds: f64,
}

impl CpuUsage {
    /// Returns total CPU seconds.
    #[must_use]
    pub fn total_seconds(&self) -> f64 {
        self.user_seconds + self.system_seconds
    }
}

// ============================================================================
// SECTION: Status
// ============================================================================

/// Result kind carried by a terminal status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// The action completed successfully.
    Ok,
    /// The action failed with a generic error.
    GenericError,
    /// The agent process was killed while running the action.
    ClientKilled,
    /// The action exceeded its network quota on the agent.
    NetworkLimitExceeded,
    /// The action exceeded its CPU quota on the agent.
    CpuLimitExceeded,
    /// The server dropped the request after too many retransmissions.
    RetransmissionLimitExceeded,
}

impl StatusKind {
    /// Returns true when the status indicates success.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Terminal status of a request, always the highest response id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Result kind.
    pub kind: StatusKind,
    /// Human-readable error message for non-ok kinds.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Agent-side backtrace for non-ok kinds.
    #[serde(default)]
    pub backtrace: Option<String>,
    /// CPU consumed servicing the request.
    #[serde(default)]
    pub cpu_used: CpuUsage,
    /// Network bytes consumed servicing the request.
    #[serde(default)]
    pub network_bytes_sent: u64,
}

impl Status {
    /// Creates a successful status with the given resource usage.
    #[must_use]
    pub const fn ok(cpu_used: CpuUsage, network_bytes_sent: u64) -> Self {
        Self {
            kind: StatusKind::Ok,
            error_message: None,
            backtrace: None,
            cpu_used,
            network_bytes_sent,
        }
    }

    /// Creates an error status with the given kind and message.
    #[must_use]
    pub fn error(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            error_message: Some(message.into()),
            backtrace: None,
            cpu_used: CpuUsage::default(),
            network_bytes_sent: 0,
        }
    }
}

// ============================================================================
// SECTION: Flow Record
// ============================================================================

/// Persistent record for one flow, keyed by `(ClientId, FlowId)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Client the flow runs on.
    pub client_id: ClientId,
    /// Flow identifier, unique per client.
    pub flow_id: FlowId,
    /// Parent flow, when this is a child flow.
    #[serde(default)]
    pub parent_flow_id: Option<FlowId>,
    /// Request id in the parent that this child reports completion to.
    #[serde(default)]
    pub parent_request_id: Option<RequestId>,
    /// Hunt that spawned this flow, when any.
    #[serde(default)]
    pub parent_hunt_id: Option<HuntId>,
    /// Registered flow class name.
    pub flow_name: FlowName,
    /// Flow class arguments.
    pub args: Payload,
    /// Username that created the flow.
    pub creator: Username,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Last update timestamp.
    pub updated_at: Timestamp,
    /// Current lifecycle state.
    pub state: FlowState,
    /// Per-flow typed state blob owned by the flow class.
    #[serde(default)]
    pub persistent_state: Value,
    /// CPU seconds consumed by the flow across all requests.
    pub cpu_time_used: f64,
    /// Network bytes consumed by the flow across all requests.
    pub network_bytes_sent: u64,
    /// CPU budget in seconds; zero means unlimited.
    pub cpu_limit_seconds: f64,
    /// Network budget in bytes; zero means unlimited.
    pub network_bytes_limit: u64,
    /// Next request id eligible for processing.
    pub next_request_to_process: RequestId,
    /// Next outbound request id to assign.
    pub next_outbound_id: RequestId,
    /// Cooperative termination reason; observed by the next state callback.
    #[serde(default)]
    pub pending_termination: Option<String>,
    /// Worker currently holding the processing lease.
    #[serde(default)]
    pub processing_owner: Option<String>,
    /// Deadline of the processing lease.
    #[serde(default)]
    pub processing_deadline: Option<Timestamp>,
    /// Number of times the flow has been leased for processing.
    pub processing_lease_count: u64,
    /// Error message for terminal error states.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Backtrace for terminal error states.
    #[serde(default)]
    pub backtrace: Option<String>,
    /// Number of results persisted by the flow.
    pub result_count: u64,
}

impl Flow {
    /// Returns the long flow id `client_id/flow_id`.
    #[must_use]
    pub fn long_id(&self) -> String {
        format!("{}/{}", self.client_id, self.flow_id)
    }
}

// ============================================================================
// SECTION: Flow Request
// ============================================================================

/// Server-to-agent unit of work, keyed by `(ClientId, FlowId, RequestId)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRequest {
    /// Client the request targets.
    pub client_id: ClientId,
    /// Flow the request belongs to.
    pub flow_id: FlowId,
    /// Request identifier from the in-flow counter.
    pub request_id: RequestId,
    /// Action name to invoke on the agent; `None` for internal requests
    /// serviced by child flows or inline states.
    #[serde(default)]
    pub action: Option<String>,
    /// Action argument payload.
    pub args: Payload,
    /// Name of the state callback that consumes the responses.
    pub next_state: String,
    /// True once the request is complete and awaiting engine processing.
    pub needs_processing: bool,
    /// Number of responses expected, when known ahead of completion.
    #[serde(default)]
    pub responses_expected: Option<u64>,
    /// Creation timestamp.
    pub created_at: Timestamp,
}

// ============================================================================
// SECTION: Flow Response
// ============================================================================

/// Response body union: payload, terminal status, or iterator continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Regular typed payload.
    Message(Payload),
    /// Terminal status; at most one per request, always the highest id.
    Status(Status),
    /// Iterator continuation token for chunked actions.
    Iterator(Value),
}

impl ResponseBody {
    /// Returns the status when this is a terminal response.
    #[must_use]
    pub const fn as_status(&self) -> Option<&Status> {
        match self {
            Self::Status(status) => Some(status),
            Self::Message(_) | Self::Iterator(_) => None,
        }
    }
}

/// Agent-to-server reply, keyed by `(ClientId, FlowId, RequestId, ResponseId)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResponse {
    /// Client the response came from.
    pub client_id: ClientId,
    /// Flow the response belongs to.
    pub flow_id: FlowId,
    /// Request the response answers.
    pub request_id: RequestId,
    /// Response identifier, strictly increasing within the request.
    pub response_id: ResponseId,
    /// Response body.
    pub body: ResponseBody,
    /// Receive timestamp.
    pub received_at: Timestamp,
}

// ============================================================================
// SECTION: Flow Result
// ============================================================================

/// Typed result persisted by a flow's `send_reply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResult {
    /// Client the result belongs to.
    pub client_id: ClientId,
    /// Flow that produced the result.
    pub flow_id: FlowId,
    /// Hunt the flow belongs to, when any; denormalized for hunt reads.
    #[serde(default)]
    pub hunt_id: Option<HuntId>,
    /// Result payload.
    pub payload: Payload,
    /// Persist timestamp.
    pub timestamp: Timestamp,
}

// ============================================================================
// SECTION: Outbound Client Message
// ============================================================================

/// Outbound queue entry carrying one flow request to the agent.
///
/// Present iff its flow request has no terminal status yet; deleted when the
/// status response arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Client the message is queued for.
    pub client_id: ClientId,
    /// Message identifier, unique per client.
    pub message_id: MessageId,
    /// Session the embedded request belongs to.
    pub session_id: String,
    /// Flow the embedded request belongs to.
    pub flow_id: FlowId,
    /// Request id of the embedded request.
    pub request_id: RequestId,
    /// Action name to invoke.
    pub action: String,
    /// Action argument payload.
    pub args: Payload,
    /// Remaining CPU budget in seconds granted to the action; zero unlimited.
    pub cpu_limit_seconds: f64,
    /// Remaining network budget in bytes granted to the action; zero unlimited.
    pub network_bytes_limit: u64,
    /// Hint that the agent should poll again promptly.
    pub require_fastpoll: bool,
    /// Current lease owner, when leased.
    #[serde(default)]
    pub lease_owner: Option<String>,
    /// Current lease deadline, when leased.
    #[serde(default)]
    pub lease_deadline: Option<Timestamp>,
    /// Number of times the message has been leased (delivery attempts).
    pub lease_count: u64,
    /// Creation timestamp.
    pub created_at: Timestamp,
}

// ============================================================================
// SECTION: Flow Processing Queue
// ============================================================================

/// Work-queue entry signaling that a flow has requests ready to advance.
///
/// Deduplicated by `(ClientId, FlowId)`; `delivery_time` defers wake-ups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowProcessingRequest {
    /// Client of the flow to process.
    pub client_id: ClientId,
    /// Flow to process.
    pub flow_id: FlowId,
    /// Enqueue timestamp.
    pub written_at: Timestamp,
    /// Earliest time the request may be leased, for delayed wake-ups.
    #[serde(default)]
    pub delivery_time: Option<Timestamp>,
}

// ============================================================================
// SECTION: Message Handler Queue
// ============================================================================

/// Inbound record for well-known server-side side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHandlerRequest {
    /// Well-known handler name.
    pub handler_name: String,
    /// Request identifier, unique per handler.
    pub request_id: u64,
    /// Client that sent the message.
    pub client_id: ClientId,
    /// Message payload.
    pub payload: Payload,
    /// Receive timestamp.
    pub received_at: Timestamp,
    /// Current lease deadline, when leased by a worker.
    #[serde(default)]
    pub lease_deadline: Option<Timestamp>,
}
