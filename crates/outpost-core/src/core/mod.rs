// outpost-core/src/core/mod.rs
// ============================================================================
// Module: Outpost Core Types
// Description: Canonical Outpost record and identifier types.
// Purpose: Provide stable, serializable types for clients, flows, hunts,
//          approvals, blobs, and agent messages.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Outpost core types define the persistent data model of the platform. These
//! types are the canonical source of truth for any derived API surfaces and
//! for the wire codec in the communications crate.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod approval;
pub mod blob;
pub mod client;
pub mod flow;
pub mod hashing;
pub mod hunt;
pub mod identifiers;
pub mod message;
pub mod payload;
pub mod time;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use approval::Approval;
pub use approval::ApprovalType;
pub use approval::Grant;
pub use approval::UserType;
pub use blob::BinaryKind;
pub use blob::BlobId;
pub use blob::BlobIdParseError;
pub use blob::BlobReference;
pub use blob::SignedBinaryId;
pub use blob::SignedBinaryReferences;
pub use blob::SignedBlobReference;
pub use client::Client;
pub use client::ClientCrash;
pub use client::ClientLabel;
pub use client::ClientSnapshot;
pub use client::KnowledgeBase;
pub use client::PathInfo;
pub use client::StartupInfo;
pub use flow::ClientMessage;
pub use flow::CpuUsage;
pub use flow::Flow;
pub use flow::FlowProcessingRequest;
pub use flow::FlowRequest;
pub use flow::FlowResponse;
pub use flow::FlowResult;
pub use flow::FlowState;
pub use flow::MessageHandlerRequest;
pub use flow::ResponseBody;
pub use flow::Status;
pub use flow::StatusKind;
pub use hashing::HashError;
pub use hunt::ClientRule;
pub use hunt::ClientRuleSet;
pub use hunt::Hunt;
pub use hunt::HuntAdmission;
pub use hunt::HuntAdmissionDecision;
pub use hunt::HuntCounterDelta;
pub use hunt::HuntState;
pub use hunt::RuleMatchMode;
pub use identifiers::ApprovalId;
pub use identifiers::ClientId;
pub use identifiers::FlowId;
pub use identifiers::FlowName;
pub use identifiers::HuntId;
pub use identifiers::IdParseError;
pub use identifiers::MessageId;
pub use identifiers::RequestId;
pub use identifiers::ResponseId;
pub use identifiers::SessionId;
pub use identifiers::Username;
pub use message::AgentMessage;
pub use message::AuthState;
pub use message::Priority;
pub use payload::Payload;
pub use payload::PayloadError;
pub use time::DurationMicros;
pub use time::Timestamp;
