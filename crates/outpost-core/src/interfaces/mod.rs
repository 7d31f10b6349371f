// outpost-core/src/interfaces/mod.rs
// ============================================================================
// Module: Outpost Interfaces
// Description: Backend-agnostic interfaces for persistence, blobs, and time.
// Purpose: Define the contract surfaces used by the Outpost runtime.
// Dependencies: crate::core
// ============================================================================

//! ## Overview
//! Interfaces define how the Outpost runtime integrates with storage backends
//! without embedding backend-specific details. Implementations must apply
//! multi-row writes within a single call atomically, follow the leasing
//! discipline exactly, and fail closed on missing or invalid data.
//!
//! ## Leasing discipline
//! Every lease-taking call atomically selects rows whose lease deadline is
//! absent or expired, stamps the caller as owner with `now + lease_duration`,
//! increments the row's lease count, and returns those rows. No row may be
//! double-leased. Lease-returning calls assert the caller still owns the
//! lease; a mismatch is a [`StoreError::LeaseConflict`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::approval::Approval;
use crate::core::approval::ApprovalType;
use crate::core::approval::Grant;
use crate::core::blob::BlobId;
use crate::core::blob::BlobReference;
use crate::core::blob::SignedBinaryId;
use crate::core::blob::SignedBinaryReferences;
use crate::core::client::Client;
use crate::core::client::ClientCrash;
use crate::core::client::ClientLabel;
use crate::core::client::ClientSnapshot;
use crate::core::client::KnowledgeBase;
use crate::core::client::PathInfo;
use crate::core::flow::ClientMessage;
use crate::core::flow::Flow;
use crate::core::flow::FlowProcessingRequest;
use crate::core::flow::FlowRequest;
use crate::core::flow::FlowResponse;
use crate::core::flow::FlowResult;
use crate::core::flow::MessageHandlerRequest;
use crate::core::hunt::Hunt;
use crate::core::hunt::HuntAdmission;
use crate::core::hunt::HuntCounterDelta;
use crate::core::hunt::HuntState;
use crate::core::identifiers::ApprovalId;
use crate::core::identifiers::ClientId;
use crate::core::identifiers::FlowId;
use crate::core::identifiers::HuntId;
use crate::core::identifiers::MessageId;
use crate::core::identifiers::RequestId;
use crate::core::identifiers::Username;
use crate::core::time::DurationMicros;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Data store errors.
///
/// Only [`StoreError::Transient`] and [`StoreError::LeaseConflict`] are
/// retriable; all other kinds are fatal for the caller.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The client does not exist.
    #[error("unknown client: {0}")]
    UnknownClient(ClientId),
    /// The flow does not exist.
    #[error("unknown flow: {client_id}/{flow_id}")]
    UnknownFlow {
        /// Client the flow was looked up on.
        client_id: ClientId,
        /// Flow id that was not found.
        flow_id: FlowId,
    },
    /// The approval does not exist.
    #[error("unknown approval: {0}")]
    UnknownApproval(String),
    /// The hunt does not exist.
    #[error("unknown hunt: {0}")]
    UnknownHunt(HuntId),
    /// The blob does not exist.
    #[error("unknown blob: {0}")]
    UnknownBlob(BlobId),
    /// The signed binary does not exist.
    #[error("unknown signed binary: {0}")]
    UnknownBinary(String),
    /// At least one requested path does not exist.
    #[error("at least one unknown path: {0}")]
    AtLeastOneUnknownPath(String),
    /// The key already exists.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    /// A record failed to serialize or deserialize.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The caller does not hold the lease it asserted. Retriable.
    #[error("lease conflict: {0}")]
    LeaseConflict(String),
    /// An unbounded read exceeded the configured limit.
    #[error("oversized read: {requested} bytes requested (limit {limit})")]
    OversizedRead {
        /// Bytes the read would have returned.
        requested: u64,
        /// Configured unbounded-read limit.
        limit: u64,
    },
    /// Transient backend failure. Retriable with backoff.
    #[error("transient store error: {0}")]
    Transient(String),
}

impl StoreError {
    /// Returns true when the caller should retry the operation.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::LeaseConflict(_) | Self::Transient(_))
    }
}

// ============================================================================
// SECTION: Flow Persistence Plan
// ============================================================================

/// A flow row together with the outputs of its start state.
///
/// Applied atomically so a flow is never visible without its initial
/// requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStart {
    /// The flow row.
    pub flow: Flow,
    /// Requests issued by the start state.
    pub requests: Vec<FlowRequest>,
    /// Outbound messages carrying those requests.
    pub messages: Vec<ClientMessage>,
    /// Results persisted by the start state.
    pub results: Vec<FlowResult>,
}

/// Atomic output of one flow-processing step.
///
/// Applied by [`DataStore::release_processed_flow`] in a single transaction so
/// that re-executing a state callback after a worker crash produces no
/// observable side effect beyond a single execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowPersistencePlan {
    /// Updated flow row, including the advanced processing cursor.
    pub flow: Flow,
    /// Worker that must still hold the processing lease.
    pub expected_owner: String,
    /// Requests fully consumed this step; deleted with their responses.
    pub processed_request_ids: Vec<RequestId>,
    /// New requests issued by state callbacks.
    pub new_requests: Vec<FlowRequest>,
    /// Outbound messages carrying the new requests.
    pub new_messages: Vec<ClientMessage>,
    /// Results persisted by state callbacks.
    pub new_results: Vec<FlowResult>,
    /// Child flows started by state callbacks.
    pub child_starts: Vec<FlowStart>,
    /// Responses written on behalf of other flows (parent notifications);
    /// applied with full completion bookkeeping.
    pub response_writes: Vec<FlowResponse>,
    /// Additional processing wake-ups, e.g. delayed inline states.
    pub processing_requests: Vec<FlowProcessingRequest>,
    /// Knowledge-base updates collected by interrogation states.
    pub knowledge_base_updates: Vec<(ClientId, KnowledgeBase)>,
    /// VFS path records collected by filesystem states.
    pub path_info_writes: Vec<PathInfo>,
    /// Hunt counter deltas for terminal hunt-child transitions.
    pub hunt_delta: Option<(HuntId, HuntCounterDelta)>,
}

// ============================================================================
// SECTION: Data Store
// ============================================================================

/// Transactional, typed record store with secondary range scans.
///
/// Every mutation either fully applies or fails; multi-row writes within a
/// single call are atomic. Implementations must enforce the leasing
/// discipline documented at the module level.
pub trait DataStore: Send + Sync {
    // ------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------

    /// Creates or replaces a client record and refreshes its keyword index.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn write_client(&self, client: &Client) -> Result<(), StoreError>;

    /// Reads a client record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownClient`] when the client does not exist.
    fn read_client(&self, client_id: ClientId) -> Result<Client, StoreError>;

    /// Reads several client records; unknown ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn multi_read_clients(&self, client_ids: &[ClientId]) -> Result<Vec<Client>, StoreError>;

    /// Lists clients ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn list_clients(&self, offset: u64, count: u64) -> Result<Vec<Client>, StoreError>;

    /// Updates poll metadata on an existing client.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownClient`] when the client does not exist.
    fn update_client_ping(
        &self,
        client_id: ClientId,
        last_ping: Timestamp,
        last_clock: Timestamp,
        last_ip: &str,
    ) -> Result<(), StoreError>;

    /// Stamps the last foreman hunt evaluation time for a client.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownClient`] when the client does not exist.
    fn update_client_foreman_check(
        &self,
        client_id: ClientId,
        checked_at: Timestamp,
    ) -> Result<(), StoreError>;

    /// Writes a versioned client snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn write_client_snapshot(&self, snapshot: &ClientSnapshot) -> Result<(), StoreError>;

    /// Reads all snapshots for a client, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn read_client_snapshots(&self, client_id: ClientId)
    -> Result<Vec<ClientSnapshot>, StoreError>;

    /// Adds labels to a client.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownClient`] when the client does not exist.
    fn add_client_labels(
        &self,
        client_id: ClientId,
        labels: &[ClientLabel],
    ) -> Result<(), StoreError>;

    /// Removes labels from a client.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownClient`] when the client does not exist.
    fn remove_client_labels(
        &self,
        client_id: ClientId,
        labels: &[ClientLabel],
    ) -> Result<(), StoreError>;

    /// Reads the labels attached to a client.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownClient`] when the client does not exist.
    fn read_client_labels(&self, client_id: ClientId) -> Result<Vec<ClientLabel>, StoreError>;

    /// Returns the ids of clients indexed under the given keyword.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn query_client_keywords(&self, keyword: &str) -> Result<Vec<ClientId>, StoreError>;

    /// Records a client crash and updates the client row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownClient`] when the client does not exist.
    fn write_client_crash(&self, crash: &ClientCrash) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // VFS paths
    // ------------------------------------------------------------------

    /// Writes collected path records for a client.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn write_path_infos(&self, paths: &[PathInfo]) -> Result<(), StoreError>;

    /// Lists collected paths under a prefix for a client.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AtLeastOneUnknownPath`] when the prefix has no
    /// records.
    fn list_path_infos(
        &self,
        client_id: ClientId,
        prefix: &str,
    ) -> Result<Vec<PathInfo>, StoreError>;

    // ------------------------------------------------------------------
    // Flows
    // ------------------------------------------------------------------

    /// Creates a flow row together with its start-state outputs, atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateKey`] when the flow already exists.
    fn create_flow(&self, start: &FlowStart) -> Result<(), StoreError>;

    /// Reads a flow row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownFlow`] when the flow does not exist.
    fn read_flow(&self, client_id: ClientId, flow_id: FlowId) -> Result<Flow, StoreError>;

    /// Lists flows for a client, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn list_flows(
        &self,
        client_id: ClientId,
        offset: u64,
        count: u64,
    ) -> Result<Vec<Flow>, StoreError>;

    /// Sets the cooperative termination reason on a running flow.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownFlow`] when the flow does not exist.
    fn set_flow_pending_termination(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        reason: &str,
    ) -> Result<(), StoreError>;

    /// Leases a flow row for processing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LeaseConflict`] when another worker holds an
    /// unexpired lease, and [`StoreError::UnknownFlow`] when the flow does
    /// not exist.
    fn lease_flow_for_processing(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        owner: &str,
        now: Timestamp,
        lease_duration: DurationMicros,
    ) -> Result<Flow, StoreError>;

    /// Atomically applies the outputs of one processing step and releases
    /// the flow lease.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LeaseConflict`] when the asserted owner no
    /// longer holds the lease; no part of the plan is applied in that case.
    fn release_processed_flow(&self, plan: &FlowPersistencePlan) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Flow requests and responses
    // ------------------------------------------------------------------

    /// Appends flow requests and their outbound messages atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownFlow`] when the flow does not exist.
    fn write_flow_requests(
        &self,
        requests: &[FlowRequest],
        messages: &[ClientMessage],
    ) -> Result<(), StoreError>;

    /// Appends flow responses in order, with completion bookkeeping.
    ///
    /// For every request completed by this batch (terminal status present and
    /// expected responses received) the request is marked as needing
    /// processing and a [`FlowProcessingRequest`] is enqueued. A terminal
    /// status deletes the request's outbound client message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails. Responses for unknown
    /// flows are dropped rather than failing the batch.
    fn write_flow_responses(
        &self,
        responses: &[FlowResponse],
        now: Timestamp,
    ) -> Result<(), StoreError>;

    /// Reads all requests with their responses for a flow, in request order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownFlow`] when the flow does not exist.
    fn read_all_flow_requests_and_responses(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
    ) -> Result<Vec<(FlowRequest, Vec<FlowResponse>)>, StoreError>;

    /// Reads completed requests eligible for processing, in request order,
    /// starting at the flow's processing cursor.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownFlow`] when the flow does not exist.
    fn read_flow_requests_ready_for_processing(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        cursor: RequestId,
    ) -> Result<Vec<(FlowRequest, Vec<FlowResponse>)>, StoreError>;

    /// Deletes requests and their responses.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    fn delete_flow_requests(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        request_ids: &[RequestId],
    ) -> Result<(), StoreError>;

    /// Counts the request rows currently stored for a flow.
    ///
    /// Processed requests are deleted, so this is the number of outstanding
    /// requests regardless of completion state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn count_flow_requests(&self, client_id: ClientId, flow_id: FlowId)
    -> Result<u64, StoreError>;

    // ------------------------------------------------------------------
    // Flow results
    // ------------------------------------------------------------------

    /// Reads persisted results for a flow, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownFlow`] when the flow does not exist.
    fn read_flow_results(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        offset: u64,
        count: u64,
    ) -> Result<Vec<FlowResult>, StoreError>;

    /// Reads results across all child flows of a hunt, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn read_hunt_results(
        &self,
        hunt_id: HuntId,
        offset: u64,
        count: u64,
    ) -> Result<Vec<FlowResult>, StoreError>;

    // ------------------------------------------------------------------
    // Outbound client messages
    // ------------------------------------------------------------------

    /// Appends outbound client messages.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn write_client_messages(&self, messages: &[ClientMessage]) -> Result<(), StoreError>;

    /// Leases up to `limit` outbound messages for a client.
    ///
    /// Applies the leasing discipline; the returned rows carry the
    /// incremented lease count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the lease write fails.
    fn lease_client_messages(
        &self,
        client_id: ClientId,
        owner: &str,
        now: Timestamp,
        lease_duration: DurationMicros,
        limit: u64,
    ) -> Result<Vec<ClientMessage>, StoreError>;

    /// Deletes outbound messages, normally on receipt of a terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    fn delete_client_messages(
        &self,
        client_id: ClientId,
        message_ids: &[MessageId],
    ) -> Result<(), StoreError>;

    /// Reads all queued outbound messages for a client.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn read_client_messages(&self, client_id: ClientId) -> Result<Vec<ClientMessage>, StoreError>;

    // ------------------------------------------------------------------
    // Flow processing queue
    // ------------------------------------------------------------------

    /// Enqueues processing wake-ups, deduplicated by `(client, flow)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn write_flow_processing_requests(
        &self,
        requests: &[FlowProcessingRequest],
    ) -> Result<(), StoreError>;

    /// Leases up to `limit` due processing wake-ups, FIFO per flow.
    ///
    /// Entries with a `delivery_time` in the future are not returned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the lease write fails.
    fn lease_flow_processing_requests(
        &self,
        owner: &str,
        now: Timestamp,
        lease_duration: DurationMicros,
        limit: u64,
    ) -> Result<Vec<FlowProcessingRequest>, StoreError>;

    /// Acknowledges a processed wake-up.
    ///
    /// A wake-up that was re-signaled while leased is not deleted; its lease
    /// is cleared instead so the new signal is served by a later pass.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn ack_flow_processing_request(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
    ) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Message handler queue
    // ------------------------------------------------------------------

    /// Enqueues well-known handler requests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn write_message_handler_requests(
        &self,
        requests: &[MessageHandlerRequest],
    ) -> Result<(), StoreError>;

    /// Leases up to `limit` due handler requests across all handlers.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the lease write fails.
    fn lease_message_handler_requests(
        &self,
        now: Timestamp,
        lease_duration: DurationMicros,
        limit: u64,
    ) -> Result<Vec<MessageHandlerRequest>, StoreError>;

    /// Deletes completed handler requests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    fn delete_message_handler_requests(
        &self,
        keys: &[(String, u64)],
    ) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Approvals
    // ------------------------------------------------------------------

    /// Creates an approval request.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateKey`] when the approval id collides.
    fn write_approval(&self, approval: &Approval) -> Result<(), StoreError>;

    /// Reads a single approval by requestor and id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownApproval`] when it does not exist.
    fn read_approval(
        &self,
        requestor: &Username,
        approval_id: ApprovalId,
    ) -> Result<Approval, StoreError>;

    /// Reads approvals for a requestor and type, optionally scoped to one
    /// subject, optionally including expired entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn read_approvals(
        &self,
        requestor: &Username,
        approval_type: ApprovalType,
        subject_id: Option<&str>,
        include_expired: bool,
        now: Timestamp,
    ) -> Result<Vec<Approval>, StoreError>;

    /// Appends a grant to an approval.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownApproval`] when it does not exist.
    fn grant_approval(
        &self,
        requestor: &Username,
        approval_id: ApprovalId,
        grant: &Grant,
    ) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Hunts
    // ------------------------------------------------------------------

    /// Creates a hunt row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateKey`] when the hunt already exists.
    fn write_hunt(&self, hunt: &Hunt) -> Result<(), StoreError>;

    /// Reads a hunt row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownHunt`] when the hunt does not exist.
    fn read_hunt(&self, hunt_id: HuntId) -> Result<Hunt, StoreError>;

    /// Lists hunts, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn list_hunts(&self, offset: u64, count: u64) -> Result<Vec<Hunt>, StoreError>;

    /// Sets the lifecycle state of a hunt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownHunt`] when the hunt does not exist.
    fn set_hunt_state(&self, hunt_id: HuntId, state: HuntState) -> Result<(), StoreError>;

    /// Atomically admits or rejects one dispatch against the hunt's state,
    /// client limit, and throttle window.
    ///
    /// On admission the client counter and window counter are incremented in
    /// the same transaction, so a hunt with `client_limit = N` never admits
    /// more than `N` dispatches under concurrent scheduling.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownHunt`] when the hunt does not exist.
    fn record_hunt_dispatch(
        &self,
        hunt_id: HuntId,
        now: Timestamp,
        throttle_window: DurationMicros,
    ) -> Result<HuntAdmission, StoreError>;

    /// Atomically applies counter deltas to a hunt, returning the updated
    /// row for ceiling evaluation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownHunt`] when the hunt does not exist.
    fn update_hunt_counters(
        &self,
        hunt_id: HuntId,
        delta: &HuntCounterDelta,
    ) -> Result<Hunt, StoreError>;

    /// Lists the child flows of a hunt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn read_hunt_flows(
        &self,
        hunt_id: HuntId,
        offset: u64,
        count: u64,
    ) -> Result<Vec<Flow>, StoreError>;

    // ------------------------------------------------------------------
    // Signed binaries
    // ------------------------------------------------------------------

    /// Creates or replaces the references for a signed binary.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn write_signed_binary_references(
        &self,
        references: &SignedBinaryReferences,
    ) -> Result<(), StoreError>;

    /// Reads the references for a signed binary.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownBinary`] when it does not exist.
    fn read_signed_binary_references(
        &self,
        id: &SignedBinaryId,
    ) -> Result<SignedBinaryReferences, StoreError>;

    /// Lists the ids of all signed binaries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn read_ids_for_all_signed_binaries(&self) -> Result<Vec<SignedBinaryId>, StoreError>;
}

// ============================================================================
// SECTION: Blob Store
// ============================================================================

/// Content-addressed byte storage keyed by SHA-256 of content.
///
/// Writes are idempotent: identical bytes yield the identical id and perform
/// no copy. A caller-supplied identity key is never accepted.
pub trait BlobStore: Send + Sync {
    /// Writes blobs, returning the derived content address of each.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn write_blobs(&self, blobs: &[Vec<u8>]) -> Result<Vec<BlobId>, StoreError>;

    /// Reads blobs by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownBlob`] for the first missing id.
    fn read_blobs(&self, blob_ids: &[BlobId]) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Returns, per id, whether the blob exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn check_blobs_exist(&self, blob_ids: &[BlobId]) -> Result<Vec<bool>, StoreError>;

    /// Writes the reference list composing a logical file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn write_blob_references(
        &self,
        file_id: &BlobId,
        references: &[BlobReference],
    ) -> Result<(), StoreError>;

    /// Reads the reference list composing a logical file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownBlob`] when the file id has no
    /// references.
    fn read_blob_references(&self, file_id: &BlobId) -> Result<Vec<BlobReference>, StoreError>;
}

// ============================================================================
// SECTION: Clock
// ============================================================================

/// Time source injected into the runtime.
///
/// The core never reads wall-clock time directly; hosts supply a clock and
/// tests supply a deterministic one.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Timestamp;
}

// ============================================================================
// SECTION: Identifier Generator
// ============================================================================

/// Source of fresh 64-bit identifiers for flows and outbound messages.
///
/// Production hosts back this with a CSPRNG; tests supply a sequential
/// source for deterministic ids. Returned values must be nonzero.
pub trait IdGenerator: Send + Sync {
    /// Returns a fresh nonzero identifier.
    fn next_id(&self) -> u64;
}
