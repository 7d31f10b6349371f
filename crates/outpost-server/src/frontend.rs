// outpost-server/src/frontend.rs
// ============================================================================
// Module: Server Front End
// Description: Agent poll handling: decrypt, demultiplex, lease, reply.
// Purpose: Turn inbound bundles into responses and outbound work, statelessly.
// Dependencies: outpost-comms, outpost-core
// ============================================================================

//! ## Overview
//! The front end serves agent polls. It decrypts the inbound bundle,
//! enrolls unknown agents when the bundle carries only enrollment messages,
//! demultiplexes messages to the flow engine or the well-known handler
//! queue, records crashes and poll metadata, leases outbound messages, and
//! returns an encrypted reply echoing the agent's nonce. All state lives in
//! the data store; front-end processes scale horizontally.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;

use outpost_comms::CommsError;
use outpost_comms::Communicator;
use outpost_comms::CryptoError;
use outpost_comms::PeerKeyResolver;
use outpost_comms::PublicKey;
use outpost_core::AgentMessage;
use outpost_core::AuthState;
use outpost_core::BlobStore;
use outpost_core::Client;
use outpost_core::ClientCrash;
use outpost_core::ClientId;
use outpost_core::ClientMessage;
use outpost_core::DataStore;
use outpost_core::FlowEngine;
use outpost_core::FlowResponse;
use outpost_core::HuntDispatcher;
use outpost_core::MessageHandlerRequest;
use outpost_core::Payload;
use outpost_core::Priority;
use outpost_core::ResponseBody;
use outpost_core::ResponseId;
use outpost_core::SessionId;
use outpost_core::StartFlowRequest;
use outpost_core::StatusKind;
use outpost_core::StoreError;
use outpost_core::Timestamp;
use outpost_core::interfaces::Clock;
use outpost_core::interfaces::IdGenerator;
use outpost_config::FrontendConfig;

use crate::handlers::HANDLER_BLOB_UPLOAD;
use crate::handlers::HANDLER_ENROLLMENT;
use crate::handlers::HandlerError;
use crate::handlers::HandlerRegistry;
use crate::handlers::handle_blob_upload;
use crate::telemetry::ServerMetricEvent;
use crate::telemetry::ServerMetrics;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Username recorded as the creator of system-initiated flows.
const SYSTEM_USER: &str = "system";
/// Flow class started automatically after enrollment.
const ENROLLMENT_FLOW: &str = "Interrogate";
/// Lease owner recorded on outbound message leases taken by the front end.
const FRONTEND_LEASE_OWNER: &str = "frontend";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Poll handling errors, mapped to HTTP statuses by the server layer.
#[derive(Debug, Error)]
pub enum PollError {
    /// The bundle was dropped; the agent should back off and retry.
    #[error("poll rejected: {0}")]
    Reject(String),
    /// The agent is unknown or unauthenticated and must enroll.
    #[error("enrollment required")]
    EnrollmentRequired,
}

// ============================================================================
// SECTION: Store-Backed Peer Keys
// ============================================================================

/// Resolves agent public keys from enrolled client records.
pub struct StorePeerKeys {
    /// Data store backend.
    store: Arc<dyn DataStore>,
}

impl StorePeerKeys {
    /// Creates a resolver over the store.
    #[must_use]
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }
}

impl PeerKeyResolver for StorePeerKeys {
    fn resolve(&self, common_name: &str) -> Result<PublicKey, CryptoError> {
        let client_id: ClientId = common_name
            .parse()
            .map_err(|_| CryptoError::UnknownPeer(common_name.to_string()))?;
        let client = self
            .store
            .read_client(client_id)
            .map_err(|_| CryptoError::UnknownPeer(common_name.to_string()))?;
        PublicKey::from_pem(&client.public_key_pem)
    }
}

// ============================================================================
// SECTION: Front End
// ============================================================================

/// Stateless poll handler.
pub struct FrontEnd {
    /// Data store backend.
    store: Arc<dyn DataStore>,
    /// Blob store backend for the upload shortcut.
    blobs: Arc<dyn BlobStore>,
    /// Flow engine for outbound leasing and enrollment flows.
    engine: Arc<FlowEngine>,
    /// Hunt dispatcher for poll-time foreman checks.
    dispatcher: Arc<HuntDispatcher>,
    /// Well-known handler registry.
    registry: Arc<HandlerRegistry>,
    /// Server communicator.
    communicator: Arc<Communicator>,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Identifier source for handler request ids.
    ids: Arc<dyn IdGenerator>,
    /// Metrics sink.
    metrics: Arc<dyn ServerMetrics>,
    /// Front-end settings.
    config: FrontendConfig,
    /// Last accepted nonce per client, for replay detection.
    nonces: Mutex<HashMap<ClientId, i64>>,
}

impl FrontEnd {
    /// Creates a front end over the shared server components.
    #[expect(clippy::too_many_arguments, reason = "explicit wiring over a context grab-bag")]
    #[must_use]
    pub fn new(
        store: Arc<dyn DataStore>,
        blobs: Arc<dyn BlobStore>,
        engine: Arc<FlowEngine>,
        dispatcher: Arc<HuntDispatcher>,
        registry: Arc<HandlerRegistry>,
        communicator: Arc<Communicator>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        metrics: Arc<dyn ServerMetrics>,
        config: FrontendConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            engine,
            dispatcher,
            registry,
            communicator,
            clock,
            ids,
            metrics,
            config,
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Serves one agent poll.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::EnrollmentRequired`] when the agent must enroll
    /// and [`PollError::Reject`] when the bundle is dropped.
    pub fn handle_poll(&self, body: &[u8], peer_ip: &str) -> Result<Vec<u8>, PollError> {
        let now = self.clock.now();
        let decoded = self.communicator.decode_bundle(body, None).map_err(|err| {
            let event = match &err {
                CommsError::Crypto(_) => ServerMetricEvent::DecryptFailure,
                _ => ServerMetricEvent::MalformedDropped,
            };
            self.metrics.increment(event);
            self.metrics.increment(ServerMetricEvent::PollRejected);
            PollError::Reject(err.to_string())
        })?;
        self.metrics.add_received_bytes(body.len() as u64);

        if !decoded.authenticated {
            return self.handle_unauthenticated(&decoded.messages, decoded.nonce, peer_ip, now);
        }

        let client_id: ClientId = decoded.source.parse().map_err(|_| {
            self.metrics.increment(ServerMetricEvent::PollRejected);
            PollError::EnrollmentRequired
        })?;
        if self.store.read_client(client_id).is_err() {
            self.metrics.increment(ServerMetricEvent::PollRejected);
            return Err(PollError::EnrollmentRequired);
        }

        // Replay guard: nonces must strictly increase per client.
        {
            let mut guard = self
                .nonces
                .lock()
                .map_err(|_| PollError::Reject("nonce table poisoned".to_string()))?;
            let last = guard.get(&client_id).copied().unwrap_or(i64::MIN);
            if decoded.nonce <= last {
                self.metrics.increment(ServerMetricEvent::ReplayDropped);
                self.metrics.increment(ServerMetricEvent::PollRejected);
                return Err(PollError::Reject("replayed or stale nonce".to_string()));
            }
            guard.insert(client_id, decoded.nonce);
        }

        self.ingest_messages(client_id, &decoded.messages, now)?;

        self.store
            .update_client_ping(client_id, now, Timestamp::from_micros(decoded.nonce), peer_ip)
            .map_err(|err| PollError::Reject(err.to_string()))?;

        if self.dispatcher.foreman_check_due(client_id).unwrap_or(false) {
            let _ = self.dispatcher.check_client(client_id);
        }

        let reply = self.build_reply(client_id, decoded.nonce, now)?;
        self.metrics.increment(ServerMetricEvent::PollOk);
        self.metrics.add_sent_bytes(reply.len() as u64);
        Ok(reply)
    }

    // ------------------------------------------------------------------
    // Enrollment
    // ------------------------------------------------------------------

    /// Serves an unauthenticated bundle: enrollment only.
    fn handle_unauthenticated(
        &self,
        messages: &[AgentMessage],
        nonce: i64,
        peer_ip: &str,
        now: Timestamp,
    ) -> Result<Vec<u8>, PollError> {
        let enrollment_only = !messages.is_empty()
            && messages.iter().all(|message| {
                message.session_id.well_known_name() == Some(HANDLER_ENROLLMENT)
            });
        if !enrollment_only {
            self.metrics.increment(ServerMetricEvent::PollRejected);
            return Err(PollError::EnrollmentRequired);
        }

        let mut enrolled_client = None;
        for message in messages {
            if let ResponseBody::Message(Payload::EnrollmentRequest(request)) = &message.body {
                let client_id = self.enroll_client(request, peer_ip, now)?;
                enrolled_client = Some(client_id);
            }
        }
        let client_id = enrolled_client.ok_or(PollError::EnrollmentRequired)?;

        // The accept bundle is encrypted to the freshly pinned key.
        let reply = self.build_reply(client_id, nonce, now)?;
        self.metrics.increment(ServerMetricEvent::PollOk);
        self.metrics.add_sent_bytes(reply.len() as u64);
        Ok(reply)
    }

    /// Creates the client record and kicks off interrogation.
    fn enroll_client(
        &self,
        request: &outpost_core::payload::EnrollmentRequest,
        peer_ip: &str,
        now: Timestamp,
    ) -> Result<ClientId, PollError> {
        let public_key = PublicKey::from_pem(&request.public_key_pem)
            .map_err(|err| PollError::Reject(format!("bad enrollment key: {err}")))?;
        let client_id =
            public_key.client_id().map_err(|err| PollError::Reject(err.to_string()))?;
        let fingerprint =
            public_key.fingerprint().map_err(|err| PollError::Reject(err.to_string()))?;

        match self.store.read_client(client_id) {
            Ok(_) => return Ok(client_id),
            Err(StoreError::UnknownClient(_)) => {}
            Err(err) => return Err(PollError::Reject(err.to_string())),
        }

        let mut client = Client::enrolled(
            client_id,
            request.public_key_pem.clone(),
            fingerprint,
            now,
            peer_ip.to_string(),
        );
        client.startup_info = request.startup_info.clone();
        self.store.write_client(&client).map_err(|err| PollError::Reject(err.to_string()))?;
        self.metrics.increment(ServerMetricEvent::ClientEnrolled);

        // Interrogation fills the knowledge base; failure is not fatal to
        // enrollment.
        let _ = self.engine.start_flow(StartFlowRequest {
            client_id,
            flow_name: ENROLLMENT_FLOW.into(),
            args: Payload::Empty,
            creator: SYSTEM_USER.into(),
            cpu_limit_seconds: 0.0,
            network_bytes_limit: 0,
            flow_id: None,
            parent_hunt_id: None,
        });
        Ok(client_id)
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Routes inbound messages to handlers and the flow engine.
    fn ingest_messages(
        &self,
        client_id: ClientId,
        messages: &[AgentMessage],
        now: Timestamp,
    ) -> Result<(), PollError> {
        let mut responses: Vec<FlowResponse> = Vec::new();
        let mut handler_requests: Vec<MessageHandlerRequest> = Vec::new();

        for message in messages {
            if message.auth_state != AuthState::Authenticated {
                self.metrics.increment(ServerMetricEvent::MalformedDropped);
                continue;
            }
            match &message.session_id {
                SessionId::WellKnown(_) => {
                    let Some(name) = message.session_id.well_known_name() else {
                        self.metrics.increment(ServerMetricEvent::MalformedDropped);
                        continue;
                    };
                    if name == HANDLER_BLOB_UPLOAD {
                        // Shortcut path: keep blob writes inline with uploads.
                        // Uploads have no per-chunk acknowledgement, so a
                        // failed store write must fail the whole poll; the
                        // agent then retries the bundle and the write stays
                        // idempotent by content address.
                        if let ResponseBody::Message(payload) = &message.body {
                            match handle_blob_upload(self.blobs.as_ref(), payload) {
                                Ok(()) => {}
                                Err(HandlerError::UnexpectedPayload { .. }) => {
                                    self.metrics
                                        .increment(ServerMetricEvent::MalformedDropped);
                                }
                                Err(err) => {
                                    self.metrics
                                        .increment(ServerMetricEvent::BlobWriteFailure);
                                    return Err(PollError::Reject(format!(
                                        "blob upload failed: {err}"
                                    )));
                                }
                            }
                        }
                        continue;
                    }
                    if name == HANDLER_ENROLLMENT {
                        continue;
                    }
                    if !self.registry.is_well_known(name) {
                        self.metrics.increment(ServerMetricEvent::MalformedDropped);
                        continue;
                    }
                    if let ResponseBody::Message(payload) = &message.body {
                        handler_requests.push(MessageHandlerRequest {
                            handler_name: name.to_string(),
                            request_id: self.ids.next_id(),
                            client_id,
                            payload: payload.clone(),
                            received_at: now,
                            lease_deadline: None,
                        });
                    }
                }
                SessionId::Flow { client_id: session_client, .. } => {
                    if *session_client != client_id {
                        self.metrics.increment(ServerMetricEvent::MalformedDropped);
                        continue;
                    }
                    let Some(flow_id) = message.session_id.leaf_flow_id() else {
                        self.metrics.increment(ServerMetricEvent::MalformedDropped);
                        continue;
                    };
                    if let ResponseBody::Status(status) = &message.body
                        && status.kind == StatusKind::ClientKilled
                    {
                        self.store
                            .write_client_crash(&ClientCrash {
                                client_id,
                                session_id: message.session_id.to_string(),
                                timestamp: now,
                                crash_message: status.error_message.clone().unwrap_or_else(
                                    || "agent reported a killed action".to_string(),
                                ),
                            })
                            .map_err(|err| PollError::Reject(err.to_string()))?;
                        self.metrics.increment(ServerMetricEvent::ClientCrash);
                    }
                    responses.push(FlowResponse {
                        client_id,
                        flow_id,
                        request_id: message.request_id,
                        response_id: message.response_id,
                        body: message.body.clone(),
                        received_at: now,
                    });
                }
            }
        }

        if !responses.is_empty() {
            self.store
                .write_flow_responses(&responses, now)
                .map_err(|err| PollError::Reject(err.to_string()))?;
        }
        if !handler_requests.is_empty() {
            self.store
                .write_message_handler_requests(&handler_requests)
                .map_err(|err| PollError::Reject(err.to_string()))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Replies
    // ------------------------------------------------------------------

    /// Leases outbound messages and builds the encrypted reply bundle.
    fn build_reply(
        &self,
        client_id: ClientId,
        nonce: i64,
        now: Timestamp,
    ) -> Result<Vec<u8>, PollError> {
        let leased = self
            .engine
            .lease_outbound_messages(client_id, FRONTEND_LEASE_OWNER)
            .map_err(|err| PollError::Reject(err.to_string()))?;
        let outbound: Vec<AgentMessage> =
            leased.iter().map(|message| outbound_to_agent(message, client_id)).collect();

        // The reply echoes the agent's nonce so the agent can verify the
        // server decrypted its bundle.
        self.communicator
            .encode_bundle(
                &client_id.to_string(),
                &outbound,
                Timestamp::from_micros(nonce),
                now,
            )
            .map_err(|err| PollError::Reject(err.to_string()))
    }

    /// Returns the configured front-end settings.
    #[must_use]
    pub const fn config(&self) -> &FrontendConfig {
        &self.config
    }
}

/// Converts a leased outbound queue entry to its transport message.
fn outbound_to_agent(message: &ClientMessage, client_id: ClientId) -> AgentMessage {
    AgentMessage {
        session_id: SessionId::for_flow(client_id, message.flow_id),
        request_id: message.request_id,
        response_id: ResponseId::from_raw(0),
        name: Some(message.action.clone()),
        body: ResponseBody::Message(message.args.clone()),
        source: None,
        auth_state: AuthState::Authenticated,
        task_id: message.message_id.as_raw(),
        cpu_limit_seconds: message.cpu_limit_seconds,
        network_bytes_limit: message.network_bytes_limit,
        require_fastpoll: message.require_fastpoll,
        priority: Priority::Medium,
    }
}
