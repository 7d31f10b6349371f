// outpost-server/src/handlers.rs
// ============================================================================
// Module: Message Handler Registry
// Description: Server-side handlers for well-known session messages.
// Purpose: Dispatch enrollment, stats, startup, log, and foreman messages
//          that bypass flow state.
// Dependencies: outpost-core
// ============================================================================

//! ## Overview
//! Messages on well-known session ids are served by the registry instead of
//! the flow engine. Most handlers run deferred: the front end writes
//! [`MessageHandlerRequest`] rows and a worker leases and executes them.
//! Blob uploads are the exception and run synchronously on the front end to
//! keep blob-store writes inline with agent uploads.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use outpost_core::BlobStore;
use outpost_core::ClientSnapshot;
use outpost_core::DataStore;
use outpost_core::HuntDispatcher;
use outpost_core::MessageHandlerRequest;
use outpost_core::Payload;
use outpost_core::StoreError;
use outpost_core::interfaces::Clock;

use crate::audit::AuditEvent;
use crate::audit::AuditOutcome;
use crate::audit::AuditSink;

// ============================================================================
// SECTION: Well-Known Sessions
// ============================================================================

/// Enrollment handler name; the only session allowed unauthenticated.
pub const HANDLER_ENROLLMENT: &str = "enrollment";
/// Agent statistics handler name.
pub const HANDLER_STATS: &str = "stats";
/// Startup info handler name.
pub const HANDLER_STARTUP: &str = "startup";
/// Blob upload handler name; served synchronously on the front end.
pub const HANDLER_BLOB_UPLOAD: &str = "blob-upload";
/// Foreman handler name: the agent asks for hunt evaluation.
pub const HANDLER_FOREMAN: &str = "foreman";
/// Agent log forwarding handler name.
pub const HANDLER_LOG: &str = "log";

/// Handler names served synchronously on the front end.
pub const SHORTCUT_HANDLERS: &[&str] = &[HANDLER_BLOB_UPLOAD];

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Message handler errors.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload did not match the handler.
    #[error("unexpected payload for handler {handler}: {type_name}")]
    UnexpectedPayload {
        /// Handler name.
        handler: String,
        /// Payload type name received.
        type_name: String,
    },
    /// Data store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Hunt dispatcher failure.
    #[error("foreman dispatch failed: {0}")]
    Foreman(String),
}

// ============================================================================
// SECTION: Handler Interface
// ============================================================================

/// One server-side handler for a well-known message kind.
pub trait MessageHandler: Send + Sync {
    /// Returns the registered handler name.
    fn name(&self) -> &'static str;

    /// Handles one leased request.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when handling fails; the worker still
    /// acknowledges the request and surfaces the failure through the
    /// metrics counter and the audit log.
    fn handle(&self, request: &MessageHandlerRequest) -> Result<(), HandlerError>;
}

/// Dispatch table from well-known handler names to handlers.
pub struct HandlerRegistry {
    /// Registered handlers by name.
    handlers: HashMap<&'static str, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    /// Creates a registry with the standard deferred handlers.
    #[must_use]
    pub fn standard(
        store: Arc<dyn DataStore>,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<HuntDispatcher>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let mut handlers: HashMap<&'static str, Arc<dyn MessageHandler>> = HashMap::new();
        let stats = Arc::new(StatsHandler { store: Arc::clone(&store), clock: Arc::clone(&clock) });
        handlers.insert(HANDLER_STATS, stats);
        let startup = Arc::new(StartupHandler { store });
        handlers.insert(HANDLER_STARTUP, startup);
        let foreman = Arc::new(ForemanHandler { dispatcher });
        handlers.insert(HANDLER_FOREMAN, foreman);
        let log = Arc::new(LogHandler { audit, clock });
        handlers.insert(HANDLER_LOG, log);
        Self { handlers }
    }

    /// Returns true when the handler name is registered or served inline.
    #[must_use]
    pub fn is_well_known(&self, name: &str) -> bool {
        name == HANDLER_ENROLLMENT
            || SHORTCUT_HANDLERS.contains(&name)
            || self.handlers.contains_key(name)
    }

    /// Looks up a deferred handler by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(name).cloned()
    }
}

// ============================================================================
// SECTION: Stats Handler
// ============================================================================

/// Persists agent runtime statistics as a client snapshot.
struct StatsHandler {
    /// Data store backend.
    store: Arc<dyn DataStore>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl MessageHandler for StatsHandler {
    fn name(&self) -> &'static str {
        HANDLER_STATS
    }

    fn handle(&self, request: &MessageHandlerRequest) -> Result<(), HandlerError> {
        match &request.payload {
            Payload::ClientStats(_) => {
                let client = self.store.read_client(request.client_id)?;
                self.store.write_client_snapshot(&ClientSnapshot {
                    timestamp: self.clock.now(),
                    client,
                })?;
                Ok(())
            }
            other => Err(HandlerError::UnexpectedPayload {
                handler: HANDLER_STATS.to_string(),
                type_name: other.type_name().to_string(),
            }),
        }
    }
}

// ============================================================================
// SECTION: Startup Handler
// ============================================================================

/// Updates the client's startup info after an agent restart.
struct StartupHandler {
    /// Data store backend.
    store: Arc<dyn DataStore>,
}

impl MessageHandler for StartupHandler {
    fn name(&self) -> &'static str {
        HANDLER_STARTUP
    }

    fn handle(&self, request: &MessageHandlerRequest) -> Result<(), HandlerError> {
        match &request.payload {
            Payload::StartupInfo(info) => {
                let mut client = self.store.read_client(request.client_id)?;
                client.startup_info = info.clone();
                self.store.write_client(&client)?;
                Ok(())
            }
            other => Err(HandlerError::UnexpectedPayload {
                handler: HANDLER_STARTUP.to_string(),
                type_name: other.type_name().to_string(),
            }),
        }
    }
}

// ============================================================================
// SECTION: Foreman Handler
// ============================================================================

/// Evaluates started hunts against the requesting client.
struct ForemanHandler {
    /// Hunt dispatcher.
    dispatcher: Arc<HuntDispatcher>,
}

impl MessageHandler for ForemanHandler {
    fn name(&self) -> &'static str {
        HANDLER_FOREMAN
    }

    fn handle(&self, request: &MessageHandlerRequest) -> Result<(), HandlerError> {
        self.dispatcher
            .check_client(request.client_id)
            .map(|_| ())
            .map_err(|err| HandlerError::Foreman(err.to_string()))
    }
}

// ============================================================================
// SECTION: Log Handler
// ============================================================================

/// Forwards agent log lines into the audit stream.
struct LogHandler {
    /// Audit sink.
    audit: Arc<dyn AuditSink>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl MessageHandler for LogHandler {
    fn name(&self) -> &'static str {
        HANDLER_LOG
    }

    fn handle(&self, request: &MessageHandlerRequest) -> Result<(), HandlerError> {
        match &request.payload {
            Payload::LogMessage(log) => {
                self.audit.record(&AuditEvent {
                    timestamp: self.clock.now(),
                    username: None,
                    action: "agent.log".to_string(),
                    subject: Some(request.client_id.to_string()),
                    outcome: AuditOutcome::Allowed,
                    detail: Some(format!("{}: {}", log.level, log.message)),
                });
                Ok(())
            }
            other => Err(HandlerError::UnexpectedPayload {
                handler: HANDLER_LOG.to_string(),
                type_name: other.type_name().to_string(),
            }),
        }
    }
}

// ============================================================================
// SECTION: Blob Upload
// ============================================================================

/// Handles a blob chunk synchronously on the front end (shortcut path).
///
/// # Errors
///
/// Returns [`HandlerError`] when the payload mismatches or the write fails.
pub fn handle_blob_upload(
    blobs: &dyn BlobStore,
    payload: &Payload,
) -> Result<(), HandlerError> {
    match payload {
        Payload::BlobChunk(chunk) => {
            blobs.write_blobs(std::slice::from_ref(&chunk.data))?;
            Ok(())
        }
        other => Err(HandlerError::UnexpectedPayload {
            handler: HANDLER_BLOB_UPLOAD.to_string(),
            type_name: other.type_name().to_string(),
        }),
    }
}
