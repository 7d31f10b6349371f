// outpost-server/src/lib.rs
// ============================================================================
// Module: Outpost Server Library
// Description: Public API surface for the Outpost server.
// Purpose: Expose the server assembly, front end, and API router.
// Dependencies: crate::{api, audit, auth, frontend, handlers, server,
//               telemetry, workers}
// ============================================================================

//! ## Overview
//! The server crate hosts the agent-facing front end, the well-known message
//! handler registry, the operator API, the worker pools, and the assembly
//! that wires them together from configuration.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod api;
pub mod audit;
pub mod auth;
pub mod frontend;
pub mod handlers;
pub mod server;
pub mod telemetry;
pub mod workers;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use api::ApiError;
pub use audit::AuditEvent;
pub use audit::AuditOutcome;
pub use audit::AuditSink;
pub use audit::FileAuditSink;
pub use audit::NoopAuditSink;
pub use audit::StderrAuditSink;
pub use auth::ApiAuth;
pub use auth::AuthError;
pub use auth::CurrentUser;
pub use frontend::FrontEnd;
pub use frontend::PollError;
pub use frontend::StorePeerKeys;
pub use handlers::HandlerRegistry;
pub use handlers::MessageHandler;
pub use server::OutpostServer;
pub use server::RandomIdGenerator;
pub use server::ServerError;
pub use server::ServerState;
pub use telemetry::CountingMetrics;
pub use telemetry::NoopMetrics;
pub use telemetry::ServerMetricEvent;
pub use telemetry::ServerMetrics;
pub use workers::WorkerPool;
