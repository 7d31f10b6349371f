// outpost-core/src/core/message.rs
// ============================================================================
// Module: Outpost Agent Messages
// Description: The message record exchanged between agents and the server.
// Purpose: Provide the typed unit of transport for polls and responses.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! An agent message is the unit of transport in both directions: outbound it
//! carries an action request with quotas and scheduling hints; inbound it
//! carries an ordered response for a flow request or a well-known handler.
//! Authentication state is assigned by the cipher layer on receive and never
//! trusted from the wire.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::flow::ResponseBody;
use crate::core::identifiers::ClientId;
use crate::core::identifiers::RequestId;
use crate::core::identifiers::ResponseId;
use crate::core::identifiers::SessionId;

// ============================================================================
// SECTION: Authentication State
// ============================================================================

/// Authentication state of a decoded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// The bundle carrying the message verified against the peer key.
    Authenticated,
    /// Verification failed or was impossible; only the enrollment session
    /// may carry such messages.
    Unauthenticated,
}

// ============================================================================
// SECTION: Priority
// ============================================================================

/// Delivery priority hint for outbound messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low,
    /// Normal investigative work.
    #[default]
    Medium,
    /// Interactive work; agents should fast-poll.
    High,
}

// ============================================================================
// SECTION: Agent Message
// ============================================================================

/// Message exchanged between an agent and the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Routing session: a long flow id or a well-known handler id.
    pub session_id: SessionId,
    /// Request the message belongs to.
    pub request_id: RequestId,
    /// Response ordinal within the request; zero for outbound requests.
    pub response_id: ResponseId,
    /// Action name to invoke; set on outbound requests only.
    #[serde(default)]
    pub name: Option<String>,
    /// Message body: payload, terminal status, or iterator continuation.
    pub body: ResponseBody,
    /// Originating client, when known.
    #[serde(default)]
    pub source: Option<ClientId>,
    /// Authentication state assigned by the cipher layer on receive.
    pub auth_state: AuthState,
    /// Outbound queue task id used to acknowledge delivery leases.
    #[serde(default)]
    pub task_id: u64,
    /// CPU budget in seconds granted to the action; zero unlimited.
    #[serde(default)]
    pub cpu_limit_seconds: f64,
    /// Network budget in bytes granted to the action; zero unlimited.
    #[serde(default)]
    pub network_bytes_limit: u64,
    /// Hint that the agent should poll again promptly.
    #[serde(default)]
    pub require_fastpoll: bool,
    /// Delivery priority hint.
    #[serde(default)]
    pub priority: Priority,
}

impl AgentMessage {
    /// Returns true when the message carries a terminal status body.
    #[must_use]
    pub const fn is_status(&self) -> bool {
        self.body.as_status().is_some()
    }
}
