// outpost-core/src/core/payload.rs
// ============================================================================
// Module: Outpost Typed Payloads
// Description: Typed sum of all payloads exchanged with agents.
// Purpose: Provide explicit encode/decode keyed by a stable type name.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Every agent message carries a payload encoded as canonical JSON alongside
//! its registered type name. Decoding dispatches on the type name through a
//! closed registry; unknown type names are a hard error on receive. This
//! replaces any reflection-based payload handling with an explicit sum type.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::core::client::KnowledgeBase;
use crate::core::client::StartupInfo;
use crate::core::hashing::canonical_json_bytes;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Action Names
// ============================================================================

/// Well-known action name: list running processes.
pub const ACTION_LIST_PROCESSES: &str = "ListProcesses";
/// Well-known action name: stat a filesystem path.
pub const ACTION_STAT_FILE: &str = "StatFile";
/// Well-known action name: report platform facts.
pub const ACTION_GET_PLATFORM_INFO: &str = "GetPlatformInfo";
/// Well-known action name: report agent runtime statistics.
pub const ACTION_GET_CLIENT_STATS: &str = "GetClientStats";
/// Well-known action name: execute a signed binary. Restricted.
pub const ACTION_EXECUTE_BINARY: &str = "ExecuteBinary";
/// Well-known action name: update the agent software. Restricted.
pub const ACTION_UPDATE_AGENT: &str = "UpdateAgent";

// ============================================================================
// SECTION: Payload Errors
// ============================================================================

/// Payload registry errors.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The payload type name is not registered.
    #[error("unknown payload type: {0}")]
    UnknownType(String),
    /// Payload bytes failed to decode as the named type.
    #[error("malformed payload of type {type_name}: {message}")]
    Malformed {
        /// Registered type name the bytes were decoded as.
        type_name: String,
        /// Decoder error message.
        message: String,
    },
    /// Payload failed to encode.
    #[error("failed to encode payload: {0}")]
    Encode(String),
}

// ============================================================================
// SECTION: Payload Bodies
// ============================================================================

/// A process observed on the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    /// Process identifier.
    pub pid: u32,
    /// Parent process identifier.
    pub ppid: u32,
    /// Executable name.
    pub name: String,
    /// Full command line.
    #[serde(default)]
    pub cmdline: String,
    /// Username the process runs as.
    #[serde(default)]
    pub username: String,
}

/// Filesystem metadata for one path on the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatEntry {
    /// Absolute path on the agent.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// Unix mode bits.
    pub mode: u32,
    /// Modification time.
    pub mtime: Timestamp,
    /// SHA-256 of the content when hashed by the agent, lower hex.
    #[serde(default)]
    pub content_hash: Option<String>,
}

/// Agent runtime statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStats {
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    /// Total CPU seconds consumed since start, scaled by 1e6.
    pub cpu_micros: u64,
    /// Bytes sent since start.
    pub bytes_sent: u64,
    /// Bytes received since start.
    pub bytes_received: u64,
    /// Boot time of the agent process.
    pub boot_time: Timestamp,
}

/// Platform facts reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// Collected knowledge-base facts.
    pub knowledge_base: KnowledgeBase,
}

/// Enrollment request carried on the well-known enrollment session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRequest {
    /// PEM-encoded RSA public key of the enrolling agent.
    pub public_key_pem: String,
    /// Startup info reported at enrollment.
    #[serde(default)]
    pub startup_info: StartupInfo,
}

/// Arguments for the stat-file action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFileArgs {
    /// Absolute path to stat.
    pub path: String,
    /// Whether the agent should also hash the content.
    #[serde(default)]
    pub hash_content: bool,
}

/// Arguments for the execute-binary action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteBinaryArgs {
    /// Signed binary path under the binary store.
    pub binary_path: String,
    /// Command-line arguments passed to the binary.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Chunk of file content uploaded by the agent to the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobChunk {
    /// Offset of this chunk within the logical file.
    pub offset: u64,
    /// Raw chunk bytes.
    pub data: Vec<u8>,
    /// Agent path the chunk was read from, when known.
    #[serde(default)]
    pub source_path: Option<String>,
}

/// Log line forwarded by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    /// Log level label.
    pub level: String,
    /// Log message text.
    pub message: String,
}

/// Arguments for the generic single-action collection flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectActionArgs {
    /// Action name to invoke on the agent.
    pub action: String,
    /// Arguments forwarded to the action.
    pub args: Box<Payload>,
}

// ============================================================================
// SECTION: Payload Sum
// ============================================================================

/// Typed sum of all payloads an agent message may carry.
///
/// The wire form is the canonical JSON of the body alongside the registered
/// type name returned by [`Payload::type_name`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Payload {
    /// Empty payload for actions without arguments.
    Empty,
    /// A process record.
    Process(Process),
    /// A filesystem stat record.
    StatEntry(StatEntry),
    /// Agent runtime statistics.
    ClientStats(ClientStats),
    /// Platform facts.
    PlatformInfo(PlatformInfo),
    /// Enrollment request.
    EnrollmentRequest(EnrollmentRequest),
    /// Startup info report.
    StartupInfo(StartupInfo),
    /// Stat-file action arguments.
    StatFileArgs(StatFileArgs),
    /// Execute-binary action arguments.
    ExecuteBinaryArgs(ExecuteBinaryArgs),
    /// Uploaded blob chunk.
    BlobChunk(BlobChunk),
    /// Forwarded agent log line.
    LogMessage(LogMessage),
    /// Single-action collection flow arguments.
    CollectActionArgs(CollectActionArgs),
}

/// Registered payload type names, kept in sync with [`Payload`].
const PAYLOAD_TYPE_NAMES: &[&str] = &[
    "Empty",
    "Process",
    "StatEntry",
    "ClientStats",
    "PlatformInfo",
    "EnrollmentRequest",
    "StartupInfo",
    "StatFileArgs",
    "ExecuteBinaryArgs",
    "BlobChunk",
    "LogMessage",
    "CollectActionArgs",
];

impl Payload {
    /// Returns the registered type name for this payload.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::Process(_) => "Process",
            Self::StatEntry(_) => "StatEntry",
            Self::ClientStats(_) => "ClientStats",
            Self::PlatformInfo(_) => "PlatformInfo",
            Self::EnrollmentRequest(_) => "EnrollmentRequest",
            Self::StartupInfo(_) => "StartupInfo",
            Self::StatFileArgs(_) => "StatFileArgs",
            Self::ExecuteBinaryArgs(_) => "ExecuteBinaryArgs",
            Self::BlobChunk(_) => "BlobChunk",
            Self::LogMessage(_) => "LogMessage",
            Self::CollectActionArgs(_) => "CollectActionArgs",
        }
    }

    /// Returns true when the type name is registered.
    #[must_use]
    pub fn is_registered(type_name: &str) -> bool {
        PAYLOAD_TYPE_NAMES.contains(&type_name)
    }

    /// Encodes the payload body as canonical JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Encode`] when serialization fails.
    pub fn encode_body(&self) -> Result<Vec<u8>, PayloadError> {
        match self {
            Self::Empty => Ok(b"{}".to_vec()),
            Self::Process(body) => encode_one(body),
            Self::StatEntry(body) => encode_one(body),
            Self::ClientStats(body) => encode_one(body),
            Self::PlatformInfo(body) => encode_one(body),
            Self::EnrollmentRequest(body) => encode_one(body),
            Self::StartupInfo(body) => encode_one(body),
            Self::StatFileArgs(body) => encode_one(body),
            Self::ExecuteBinaryArgs(body) => encode_one(body),
            Self::BlobChunk(body) => encode_one(body),
            Self::LogMessage(body) => encode_one(body),
            Self::CollectActionArgs(body) => encode_one(body),
        }
    }

    /// Decodes a payload from its registered type name and body bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::UnknownType`] for unregistered names and
    /// [`PayloadError::Malformed`] when the bytes do not decode as the type.
    pub fn decode(type_name: &str, body: &[u8]) -> Result<Self, PayloadError> {
        match type_name {
            "Empty" => Ok(Self::Empty),
            "Process" => decode_one(type_name, body).map(Self::Process),
            "StatEntry" => decode_one(type_name, body).map(Self::StatEntry),
            "ClientStats" => decode_one(type_name, body).map(Self::ClientStats),
            "PlatformInfo" => decode_one(type_name, body).map(Self::PlatformInfo),
            "EnrollmentRequest" => decode_one(type_name, body).map(Self::EnrollmentRequest),
            "StartupInfo" => decode_one(type_name, body).map(Self::StartupInfo),
            "StatFileArgs" => decode_one(type_name, body).map(Self::StatFileArgs),
            "ExecuteBinaryArgs" => decode_one(type_name, body).map(Self::ExecuteBinaryArgs),
            "BlobChunk" => decode_one(type_name, body).map(Self::BlobChunk),
            "LogMessage" => decode_one(type_name, body).map(Self::LogMessage),
            "CollectActionArgs" => decode_one(type_name, body).map(Self::CollectActionArgs),
            other => Err(PayloadError::UnknownType(other.to_string())),
        }
    }
}

/// Encodes one payload body as canonical JSON.
fn encode_one<T: Serialize>(body: &T) -> Result<Vec<u8>, PayloadError> {
    canonical_json_bytes(body).map_err(|err| PayloadError::Encode(err.to_string()))
}

/// Decodes one payload body from JSON bytes.
fn decode_one<T: DeserializeOwned>(type_name: &str, body: &[u8]) -> Result<T, PayloadError> {
    serde_json::from_slice(body).map_err(|err| PayloadError::Malformed {
        type_name: type_name.to_string(),
        message: err.to_string(),
    })
}
