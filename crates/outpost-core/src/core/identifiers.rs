// outpost-core/src/core/identifiers.rs
// ============================================================================
// Module: Outpost Identifiers
// Description: Canonical opaque identifiers for clients, flows, hunts, and messages.
// Purpose: Provide strongly typed, serializable IDs with stable string forms.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! This module defines the canonical identifiers used throughout Outpost.
//! Numeric identifiers are opaque 64-bit values with fixed-width hex string
//! forms; parsing is strict and round-trips with display. Validation beyond
//! shape is handled at runtime boundaries rather than within these wrappers.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Identifier parse errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdParseError {
    /// The string form does not match the identifier shape.
    #[error("malformed identifier: {0}")]
    Malformed(String),
}

// ============================================================================
// SECTION: Client Identifier
// ============================================================================

/// Opaque 64-bit client identifier rendered as `C.<16 lower hex>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(u64);

/// Stable display prefix for client identifiers.
const CLIENT_ID_PREFIX: &str = "C.";

impl ClientId {
    /// Creates a client identifier from its raw 64-bit value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw 64-bit value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{CLIENT_ID_PREFIX}{:016x}", self.0)
    }
}

impl FromStr for ClientId {
    type Err = IdParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let hex = value
            .strip_prefix(CLIENT_ID_PREFIX)
            .ok_or_else(|| IdParseError::Malformed(value.to_string()))?;
        if hex.len() != 16 {
            return Err(IdParseError::Malformed(value.to_string()));
        }
        u64::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| IdParseError::Malformed(value.to_string()))
    }
}

impl TryFrom<String> for ClientId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClientId> for String {
    fn from(value: ClientId) -> Self {
        value.to_string()
    }
}

// ============================================================================
// SECTION: Flow Identifier
// ============================================================================

/// Random 64-bit flow identifier rendered as 16 upper-case hex characters.
///
/// Flow identifiers are unique per client, not globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FlowId(u64);

impl FlowId {
    /// Creates a flow identifier from its raw 64-bit value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw 64-bit value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl FromStr for FlowId {
    type Err = IdParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.len() != 16 {
            return Err(IdParseError::Malformed(value.to_string()));
        }
        u64::from_str_radix(value, 16)
            .map(Self)
            .map_err(|_| IdParseError::Malformed(value.to_string()))
    }
}

impl TryFrom<String> for FlowId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FlowId> for String {
    fn from(value: FlowId) -> Self {
        value.to_string()
    }
}

// ============================================================================
// SECTION: Hunt Identifier
// ============================================================================

/// Hunt identifier sharing the flow id space, rendered as `H:<16 upper hex>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HuntId(u64);

/// Stable display prefix for hunt identifiers.
const HUNT_ID_PREFIX: &str = "H:";

impl HuntId {
    /// Creates a hunt identifier from its raw 64-bit value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw 64-bit value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HuntId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{HUNT_ID_PREFIX}{:016X}", self.0)
    }
}

impl FromStr for HuntId {
    type Err = IdParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let hex = value
            .strip_prefix(HUNT_ID_PREFIX)
            .ok_or_else(|| IdParseError::Malformed(value.to_string()))?;
        if hex.len() != 16 {
            return Err(IdParseError::Malformed(value.to_string()));
        }
        u64::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| IdParseError::Malformed(value.to_string()))
    }
}

impl TryFrom<String> for HuntId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HuntId> for String {
    fn from(value: HuntId) -> Self {
        value.to_string()
    }
}

// ============================================================================
// SECTION: Request / Response / Message Identifiers
// ============================================================================

/// Request identifier assigned from an in-flow counter, starting at 1.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// The first request identifier assigned within a flow.
    pub const FIRST: Self = Self(1);

    /// Creates a request identifier from its raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Returns the next request identifier in sequence.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Response identifier assigned monotonically by the agent within a request.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ResponseId(u64);

impl ResponseId {
    /// Creates a response identifier from its raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Returns the next response identifier in sequence.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outbound client message identifier, unique per client.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    /// Creates a message identifier from its raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Approval identifier rendered as 16 lower-case hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApprovalId(u64);

impl ApprovalId {
    /// Creates an approval identifier from its raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ApprovalId {
    type Err = IdParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.len() != 16 {
            return Err(IdParseError::Malformed(value.to_string()));
        }
        u64::from_str_radix(value, 16)
            .map(Self)
            .map_err(|_| IdParseError::Malformed(value.to_string()))
    }
}

impl TryFrom<String> for ApprovalId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ApprovalId> for String {
    fn from(value: ApprovalId) -> Self {
        value.to_string()
    }
}

// ============================================================================
// SECTION: Username
// ============================================================================

/// API caller username as asserted by the external authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    /// Creates a new username.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the username as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Username {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Username {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

// ============================================================================
// SECTION: Flow Class Name
// ============================================================================

/// Registered flow class name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowName(String);

impl FlowName {
    /// Creates a new flow class name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for FlowName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FlowName {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

// ============================================================================
// SECTION: Session Identifier
// ============================================================================

/// Separator between components of a long flow session id.
const SESSION_SEPARATOR: char = '/';
/// Prefix for well-known (server-handled) session identifiers.
const WELL_KNOWN_PREFIX: &str = "wk:";

/// Message routing identifier: a long flow id or a well-known handler id.
///
/// A long flow id has the form `client_id/flow_id[/flow_id…]`, identifying a
/// flow and, for nested entries, the chain of child flows under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SessionId {
    /// Session addressing a flow on a specific client.
    Flow {
        /// The client the flow runs on.
        client_id: ClientId,
        /// Flow id chain; the first element is the top-level flow.
        path: Vec<FlowId>,
    },
    /// Session addressing a well-known server-side handler.
    WellKnown(String),
}

impl SessionId {
    /// Builds a session id for a top-level flow.
    #[must_use]
    pub fn for_flow(client_id: ClientId, flow_id: FlowId) -> Self {
        Self::Flow { client_id, path: vec![flow_id] }
    }

    /// Builds a well-known session id from a handler name.
    #[must_use]
    pub fn well_known(name: &str) -> Self {
        Self::WellKnown(format!("{WELL_KNOWN_PREFIX}{name}"))
    }

    /// Returns the leaf flow id when this session addresses a flow.
    #[must_use]
    pub fn leaf_flow_id(&self) -> Option<FlowId> {
        match self {
            Self::Flow { path, .. } => path.last().copied(),
            Self::WellKnown(_) => None,
        }
    }

    /// Returns the well-known handler name when this is a well-known session.
    #[must_use]
    pub fn well_known_name(&self) -> Option<&str> {
        match self {
            Self::Flow { .. } => None,
            Self::WellKnown(name) => name.strip_prefix(WELL_KNOWN_PREFIX),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flow { client_id, path } => {
                write!(f, "{client_id}")?;
                for flow_id in path {
                    write!(f, "{SESSION_SEPARATOR}{flow_id}")?;
                }
                Ok(())
            }
            Self::WellKnown(name) => name.fmt(f),
        }
    }
}

impl FromStr for SessionId {
    type Err = IdParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.starts_with(WELL_KNOWN_PREFIX) {
            return Ok(Self::WellKnown(value.to_string()));
        }
        let mut parts = value.split(SESSION_SEPARATOR);
        let client_part = parts.next().ok_or_else(|| IdParseError::Malformed(value.to_string()))?;
        let client_id: ClientId = client_part.parse()?;
        let mut path = Vec::new();
        for part in parts {
            path.push(part.parse::<FlowId>()?);
        }
        if path.is_empty() {
            return Err(IdParseError::Malformed(value.to_string()));
        }
        Ok(Self::Flow { client_id, path })
    }
}

impl TryFrom<String> for SessionId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.to_string()
    }
}
