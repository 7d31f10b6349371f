// outpost-core/src/runtime/mod.rs
// ============================================================================
// Module: Outpost Runtime
// Description: Flow engine, hunt dispatcher, approval checker, and stores.
// Purpose: Execute the Outpost state machines over the storage interfaces.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! The runtime module hosts the execution half of the core crate: the flow
//! engine, the hunt dispatcher, the approval checker, file assembly, and the
//! in-memory reference store. Every runtime component reads time through an
//! injected clock and identifiers through an injected generator.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod approvals;
pub mod clock;
pub mod engine;
pub mod files;
pub mod flows;
pub mod hunts;
pub mod ids;
pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use approvals::ApprovalChecker;
pub use approvals::ApprovalCheckerConfig;
pub use approvals::ApprovalError;
pub use approvals::ClientLabelPolicy;
pub use approvals::StaticUserCatalog;
pub use approvals::UserCatalog;
pub use clock::FixedClock;
pub use clock::SystemClock;
pub use engine::EngineError;
pub use engine::FlowEngine;
pub use engine::FlowEngineConfig;
pub use engine::ProcessOutcome;
pub use engine::SYNTHETIC_TERMINAL_RESPONSE_ID;
pub use engine::StartFlowRequest;
pub use files::FileChunk;
pub use files::read_file_bytes;
pub use files::stream_file_chunks;
pub use files::write_file;
pub use flows::FlowClass;
pub use flows::FlowContext;
pub use flows::FlowError;
pub use flows::FlowFactory;
pub use flows::FlowRegistry;
pub use flows::RESTRICTED_FLOW_NAMES;
pub use flows::START_STATE;
pub use flows::StepOutputs;
pub use flows::build_flow_start;
pub use flows::message_payloads;
pub use flows::require_ok;
pub use flows::terminal_status;
pub use hunts::CreateHuntRequest;
pub use hunts::HuntDispatcher;
pub use hunts::HuntDispatcherConfig;
pub use hunts::HuntError;
pub use ids::SequentialIdGenerator;
pub use store::InMemoryBlobStore;
pub use store::InMemoryDataStore;
