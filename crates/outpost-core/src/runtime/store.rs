// outpost-core/src/runtime/store.rs
// ============================================================================
// Module: Outpost In-Memory Store
// Description: In-memory data and blob stores for tests and local use.
// Purpose: Provide deterministic store implementations without external deps.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! This module implements [`DataStore`] and [`BlobStore`] over mutex-guarded
//! ordered maps. Every call holds the single lock for its duration, which
//! gives the per-call atomicity the contract requires. The implementation is
//! the reference for the leasing discipline and the response-completion
//! bookkeeping; the durable SQLite store mirrors its semantics.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

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
use crate::core::hunt::HuntAdmissionDecision;
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
use crate::interfaces::BlobStore;
use crate::interfaces::DataStore;
use crate::interfaces::FlowPersistencePlan;
use crate::interfaces::FlowStart;
use crate::interfaces::StoreError;
use crate::runtime::engine::SYNTHETIC_TERMINAL_RESPONSE_ID;

// ============================================================================
// SECTION: Inner State
// ============================================================================

/// Processing-queue entry with its lease.
#[derive(Debug, Clone)]
struct ProcessingEntry {
    /// The queued wake-up.
    request: FlowProcessingRequest,
    /// Lease owner, when leased.
    lease_owner: Option<String>,
    /// Lease deadline, when leased.
    lease_deadline: Option<Timestamp>,
    /// Lease count.
    lease_count: u64,
    /// Set when the entry was signaled again after being enqueued; an ack
    /// then clears the lease instead of deleting the entry.
    resignaled: bool,
}

/// All tables, guarded by one mutex.
#[derive(Debug, Default)]
struct Inner {
    /// Clients keyed by raw client id.
    clients: BTreeMap<u64, Client>,
    /// Client snapshots keyed by (client, capture time).
    snapshots: BTreeMap<(u64, i64), ClientSnapshot>,
    /// Keyword index: keyword to client ids.
    keywords: BTreeMap<String, BTreeSet<u64>>,
    /// Collected VFS paths keyed by (client, path).
    path_infos: BTreeMap<(u64, String), PathInfo>,
    /// Flows keyed by (client, flow).
    flows: BTreeMap<(u64, u64), Flow>,
    /// Requests keyed by (client, flow, request).
    requests: BTreeMap<(u64, u64, u64), FlowRequest>,
    /// Responses keyed by (client, flow, request, response).
    responses: BTreeMap<(u64, u64, u64, u64), FlowResponse>,
    /// Results keyed by (client, flow, sequence).
    results: BTreeMap<(u64, u64, u64), FlowResult>,
    /// Next result sequence number.
    result_seq: u64,
    /// Outbound messages keyed by (client, message).
    messages: BTreeMap<(u64, u64), ClientMessage>,
    /// Processing queue keyed by (client, flow).
    processing: BTreeMap<(u64, u64), ProcessingEntry>,
    /// Message handler queue keyed by (handler, request).
    handler_requests: BTreeMap<(String, u64), MessageHandlerRequest>,
    /// Approvals keyed by (requestor, approval id).
    approvals: BTreeMap<(String, u64), Approval>,
    /// Hunts keyed by raw hunt id.
    hunts: BTreeMap<u64, Hunt>,
    /// Signed binaries keyed by (kind, path).
    binaries: BTreeMap<(String, String), SignedBinaryReferences>,
}

// ============================================================================
// SECTION: In-Memory Data Store
// ============================================================================

/// In-memory data store for tests and single-process deployments.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDataStore {
    /// Table state protected by a mutex.
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryDataStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the inner state, surfacing poisoning as a store error.
    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Transient("store mutex poisoned".to_string()))
    }
}

impl Inner {
    /// Returns true when a lease is free at `now`.
    fn lease_free(deadline: Option<Timestamp>, now: Timestamp) -> bool {
        deadline.is_none_or(|deadline| deadline <= now)
    }

    /// Applies response writes with completion bookkeeping.
    ///
    /// Responses for unknown flows or duplicate keys are dropped.
    fn apply_responses(&mut self, responses: &[FlowResponse], _now: Timestamp) {
        for response in responses {
            let client = response.client_id.as_raw();
            let flow = response.flow_id.as_raw();
            if !self.flows.contains_key(&(client, flow)) {
                continue;
            }
            let request_key = (client, flow, response.request_id.as_raw());
            if !self.requests.contains_key(&request_key) {
                continue;
            }
            let response_key =
                (client, flow, response.request_id.as_raw(), response.response_id.as_raw());
            if self.responses.contains_key(&response_key) {
                continue;
            }
            self.responses.insert(response_key, response.clone());

            let is_status = response.body.as_status().is_some();
            if is_status {
                // The terminal status fixes the expected response count and
                // retires the outbound message for this request.
                if let Some(request) = self.requests.get_mut(&request_key)
                    && response.response_id.as_raw() != SYNTHETIC_TERMINAL_RESPONSE_ID
                {
                    request.responses_expected = Some(response.response_id.as_raw());
                }
                let stale: Vec<(u64, u64)> = self
                    .messages
                    .iter()
                    .filter(|(_, message)| {
                        message.client_id == response.client_id
                            && message.flow_id == response.flow_id
                            && message.request_id == response.request_id
                    })
                    .map(|(key, _)| *key)
                    .collect();
                for key in stale {
                    self.messages.remove(&key);
                }
            }
            self.refresh_completion(response.client_id, response.flow_id, response.request_id);
        }
    }

    /// Re-evaluates completion for one request, enqueueing a wake-up when it
    /// becomes ready.
    fn refresh_completion(&mut self, client_id: ClientId, flow_id: FlowId, request_id: RequestId) {
        let client = client_id.as_raw();
        let flow = flow_id.as_raw();
        let request_key = (client, flow, request_id.as_raw());
        let Some(request) = self.requests.get(&request_key) else {
            return;
        };
        if request.needs_processing {
            return;
        }
        let range_start = (client, flow, request_id.as_raw(), 0);
        let range_end = (client, flow, request_id.as_raw(), u64::MAX);
        let mut count: u64 = 0;
        let mut status_id: Option<u64> = None;
        for (key, response) in self.responses.range(range_start..=range_end) {
            count += 1;
            if response.body.as_status().is_some() {
                status_id = Some(key.3);
            }
        }
        let complete = match status_id {
            Some(SYNTHETIC_TERMINAL_RESPONSE_ID) => true,
            Some(expected) => count >= expected,
            None => false,
        };
        if complete {
            if let Some(request) = self.requests.get_mut(&request_key) {
                request.needs_processing = true;
            }
            let written_at = self
                .requests
                .get(&request_key)
                .map_or(Timestamp::EPOCH, |request| request.created_at);
            self.enqueue_processing(FlowProcessingRequest {
                client_id,
                flow_id,
                written_at,
                delivery_time: None,
            });
        }
    }

    /// Enqueues a processing wake-up, deduplicated by flow key.
    fn enqueue_processing(&mut self, request: FlowProcessingRequest) {
        let key = (request.client_id.as_raw(), request.flow_id.as_raw());
        match self.processing.get_mut(&key) {
            Some(entry) => {
                // An immediate wake-up supersedes a delayed one.
                if request.delivery_time.is_none() {
                    entry.request.delivery_time = None;
                }
                entry.resignaled = true;
            }
            None => {
                self.processing.insert(
                    key,
                    ProcessingEntry {
                        request,
                        lease_owner: None,
                        lease_deadline: None,
                        lease_count: 0,
                        resignaled: false,
                    },
                );
            }
        }
    }

    /// Inserts a flow with its start outputs; fails on duplicates.
    fn insert_flow_start(&mut self, start: &FlowStart) -> Result<(), StoreError> {
        let key = (start.flow.client_id.as_raw(), start.flow.flow_id.as_raw());
        if self.flows.contains_key(&key) {
            return Err(StoreError::DuplicateKey(start.flow.long_id()));
        }
        self.flows.insert(key, start.flow.clone());
        for request in &start.requests {
            self.requests.insert(
                (request.client_id.as_raw(), request.flow_id.as_raw(), request.request_id.as_raw()),
                request.clone(),
            );
            if request.needs_processing {
                self.enqueue_processing(FlowProcessingRequest {
                    client_id: request.client_id,
                    flow_id: request.flow_id,
                    written_at: request.created_at,
                    delivery_time: None,
                });
            }
        }
        for message in &start.messages {
            self.messages.insert(
                (message.client_id.as_raw(), message.message_id.as_raw()),
                message.clone(),
            );
        }
        for result in &start.results {
            let seq = self.result_seq;
            self.result_seq += 1;
            self.results.insert(
                (result.client_id.as_raw(), result.flow_id.as_raw(), seq),
                result.clone(),
            );
        }
        Ok(())
    }

    /// Applies hunt counter deltas in place.
    fn apply_hunt_delta(&mut self, hunt_id: HuntId, delta: &HuntCounterDelta) {
        if let Some(hunt) = self.hunts.get_mut(&hunt_id.as_raw()) {
            hunt.num_successful = hunt.num_successful.saturating_add(delta.num_successful);
            hunt.num_failed = hunt.num_failed.saturating_add(delta.num_failed);
            hunt.num_crashed = hunt.num_crashed.saturating_add(delta.num_crashed);
            hunt.num_results = hunt.num_results.saturating_add(delta.num_results);
            hunt.total_cpu_seconds += delta.total_cpu_seconds;
            hunt.total_network_bytes =
                hunt.total_network_bytes.saturating_add(delta.total_network_bytes);
        }
    }
}

impl DataStore for InMemoryDataStore {
    // ------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------

    fn write_client(&self, client: &Client) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for keyword in client.search_keywords() {
            inner.keywords.entry(keyword).or_default().insert(client.client_id.as_raw());
        }
        inner.clients.insert(client.client_id.as_raw(), client.clone());
        Ok(())
    }

    fn read_client(&self, client_id: ClientId) -> Result<Client, StoreError> {
        self.lock()?
            .clients
            .get(&client_id.as_raw())
            .cloned()
            .ok_or(StoreError::UnknownClient(client_id))
    }

    fn multi_read_clients(&self, client_ids: &[ClientId]) -> Result<Vec<Client>, StoreError> {
        let inner = self.lock()?;
        Ok(client_ids
            .iter()
            .filter_map(|client_id| inner.clients.get(&client_id.as_raw()).cloned())
            .collect())
    }

    fn list_clients(&self, offset: u64, count: u64) -> Result<Vec<Client>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .clients
            .values()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(count).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn update_client_ping(
        &self,
        client_id: ClientId,
        last_ping: Timestamp,
        last_clock: Timestamp,
        last_ip: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let client = inner
            .clients
            .get_mut(&client_id.as_raw())
            .ok_or(StoreError::UnknownClient(client_id))?;
        client.last_ping = last_ping;
        client.last_clock = last_clock;
        client.last_ip = last_ip.to_string();
        Ok(())
    }

    fn update_client_foreman_check(
        &self,
        client_id: ClientId,
        checked_at: Timestamp,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let client = inner
            .clients
            .get_mut(&client_id.as_raw())
            .ok_or(StoreError::UnknownClient(client_id))?;
        client.last_foreman_check = checked_at;
        Ok(())
    }

    fn write_client_snapshot(&self, snapshot: &ClientSnapshot) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.snapshots.insert(
            (snapshot.client.client_id.as_raw(), snapshot.timestamp.as_micros()),
            snapshot.clone(),
        );
        Ok(())
    }

    fn read_client_snapshots(
        &self,
        client_id: ClientId,
    ) -> Result<Vec<ClientSnapshot>, StoreError> {
        let inner = self.lock()?;
        let start = (client_id.as_raw(), i64::MIN);
        let end = (client_id.as_raw(), i64::MAX);
        Ok(inner.snapshots.range(start..=end).map(|(_, snapshot)| snapshot.clone()).collect())
    }

    fn add_client_labels(
        &self,
        client_id: ClientId,
        labels: &[ClientLabel],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let client = inner
            .clients
            .get_mut(&client_id.as_raw())
            .ok_or(StoreError::UnknownClient(client_id))?;
        for label in labels {
            if !client.labels.contains(label) {
                client.labels.push(label.clone());
            }
        }
        let keywords = client.search_keywords();
        for keyword in keywords {
            inner.keywords.entry(keyword).or_default().insert(client_id.as_raw());
        }
        Ok(())
    }

    fn remove_client_labels(
        &self,
        client_id: ClientId,
        labels: &[ClientLabel],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let client = inner
            .clients
            .get_mut(&client_id.as_raw())
            .ok_or(StoreError::UnknownClient(client_id))?;
        client.labels.retain(|label| !labels.contains(label));
        Ok(())
    }

    fn read_client_labels(&self, client_id: ClientId) -> Result<Vec<ClientLabel>, StoreError> {
        let inner = self.lock()?;
        inner
            .clients
            .get(&client_id.as_raw())
            .map(|client| client.labels.clone())
            .ok_or(StoreError::UnknownClient(client_id))
    }

    fn query_client_keywords(&self, keyword: &str) -> Result<Vec<ClientId>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .keywords
            .get(&keyword.to_lowercase())
            .map(|ids| ids.iter().map(|id| ClientId::from_raw(*id)).collect())
            .unwrap_or_default())
    }

    fn write_client_crash(&self, crash: &ClientCrash) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let client = inner
            .clients
            .get_mut(&crash.client_id.as_raw())
            .ok_or(StoreError::UnknownClient(crash.client_id))?;
        client.last_crash = Some(crash.clone());
        Ok(())
    }

    // ------------------------------------------------------------------
    // VFS paths
    // ------------------------------------------------------------------

    fn write_path_infos(&self, paths: &[PathInfo]) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for path in paths {
            inner.path_infos.insert((path.client_id.as_raw(), path.path.clone()), path.clone());
        }
        Ok(())
    }

    fn list_path_infos(
        &self,
        client_id: ClientId,
        prefix: &str,
    ) -> Result<Vec<PathInfo>, StoreError> {
        let inner = self.lock()?;
        let matches: Vec<PathInfo> = inner
            .path_infos
            .iter()
            .filter(|((client, path), _)| {
                *client == client_id.as_raw() && path.starts_with(prefix)
            })
            .map(|(_, info)| info.clone())
            .collect();
        if matches.is_empty() {
            return Err(StoreError::AtLeastOneUnknownPath(prefix.to_string()));
        }
        Ok(matches)
    }

    // ------------------------------------------------------------------
    // Flows
    // ------------------------------------------------------------------

    fn create_flow(&self, start: &FlowStart) -> Result<(), StoreError> {
        self.lock()?.insert_flow_start(start)
    }

    fn read_flow(&self, client_id: ClientId, flow_id: FlowId) -> Result<Flow, StoreError> {
        self.lock()?
            .flows
            .get(&(client_id.as_raw(), flow_id.as_raw()))
            .cloned()
            .ok_or(StoreError::UnknownFlow { client_id, flow_id })
    }

    fn list_flows(
        &self,
        client_id: ClientId,
        offset: u64,
        count: u64,
    ) -> Result<Vec<Flow>, StoreError> {
        let inner = self.lock()?;
        let mut flows: Vec<Flow> = inner
            .flows
            .range((client_id.as_raw(), 0)..=(client_id.as_raw(), u64::MAX))
            .map(|(_, flow)| flow.clone())
            .collect();
        flows.sort_by_key(|flow| std::cmp::Reverse(flow.created_at));
        Ok(flows
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(count).unwrap_or(usize::MAX))
            .collect())
    }

    fn set_flow_pending_termination(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        reason: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let flow = inner
            .flows
            .get_mut(&(client_id.as_raw(), flow_id.as_raw()))
            .ok_or(StoreError::UnknownFlow { client_id, flow_id })?;
        flow.pending_termination = Some(reason.to_string());
        Ok(())
    }

    fn lease_flow_for_processing(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        owner: &str,
        now: Timestamp,
        lease_duration: DurationMicros,
    ) -> Result<Flow, StoreError> {
        let mut inner = self.lock()?;
        let flow = inner
            .flows
            .get_mut(&(client_id.as_raw(), flow_id.as_raw()))
            .ok_or(StoreError::UnknownFlow { client_id, flow_id })?;
        if !Inner::lease_free(flow.processing_deadline, now) {
            return Err(StoreError::LeaseConflict(format!(
                "flow {} leased by {}",
                flow.long_id(),
                flow.processing_owner.as_deref().unwrap_or("unknown")
            )));
        }
        flow.processing_owner = Some(owner.to_string());
        flow.processing_deadline = Some(now.saturating_add(lease_duration));
        flow.processing_lease_count = flow.processing_lease_count.saturating_add(1);
        Ok(flow.clone())
    }

    fn release_processed_flow(&self, plan: &FlowPersistencePlan) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let key = (plan.flow.client_id.as_raw(), plan.flow.flow_id.as_raw());
        {
            let current = inner.flows.get(&key).ok_or(StoreError::UnknownFlow {
                client_id: plan.flow.client_id,
                flow_id: plan.flow.flow_id,
            })?;
            if current.processing_owner.as_deref() != Some(plan.expected_owner.as_str()) {
                return Err(StoreError::LeaseConflict(format!(
                    "flow {} no longer leased by {}",
                    plan.flow.long_id(),
                    plan.expected_owner
                )));
            }
        }
        // Validate child creations before mutating anything.
        for start in &plan.child_starts {
            let child_key = (start.flow.client_id.as_raw(), start.flow.flow_id.as_raw());
            if inner.flows.contains_key(&child_key) {
                return Err(StoreError::DuplicateKey(start.flow.long_id()));
            }
        }

        inner.flows.insert(key, plan.flow.clone());
        for request_id in &plan.processed_request_ids {
            inner.requests.remove(&(key.0, key.1, request_id.as_raw()));
            let range_start = (key.0, key.1, request_id.as_raw(), 0);
            let range_end = (key.0, key.1, request_id.as_raw(), u64::MAX);
            let stale: Vec<(u64, u64, u64, u64)> =
                inner.responses.range(range_start..=range_end).map(|(k, _)| *k).collect();
            for stale_key in stale {
                inner.responses.remove(&stale_key);
            }
        }
        for request in &plan.new_requests {
            inner.requests.insert(
                (request.client_id.as_raw(), request.flow_id.as_raw(), request.request_id.as_raw()),
                request.clone(),
            );
            if request.needs_processing {
                inner.enqueue_processing(FlowProcessingRequest {
                    client_id: request.client_id,
                    flow_id: request.flow_id,
                    written_at: request.created_at,
                    delivery_time: None,
                });
            }
        }
        for message in &plan.new_messages {
            inner
                .messages
                .insert((message.client_id.as_raw(), message.message_id.as_raw()), message.clone());
        }
        for result in &plan.new_results {
            let seq = inner.result_seq;
            inner.result_seq += 1;
            inner
                .results
                .insert((result.client_id.as_raw(), result.flow_id.as_raw(), seq), result.clone());
        }
        for start in &plan.child_starts {
            inner.insert_flow_start(start)?;
        }
        inner.apply_responses(&plan.response_writes, plan.flow.updated_at);
        for request in &plan.processing_requests {
            inner.enqueue_processing(request.clone());
        }
        for (client_id, knowledge_base) in &plan.knowledge_base_updates {
            if let Some(client) = inner.clients.get_mut(&client_id.as_raw()) {
                client.knowledge_base = knowledge_base.clone();
            }
        }
        for path in &plan.path_info_writes {
            inner.path_infos.insert((path.client_id.as_raw(), path.path.clone()), path.clone());
        }
        if let Some((hunt_id, delta)) = &plan.hunt_delta {
            inner.apply_hunt_delta(*hunt_id, delta);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Flow requests and responses
    // ------------------------------------------------------------------

    fn write_flow_requests(
        &self,
        requests: &[FlowRequest],
        messages: &[ClientMessage],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for request in requests {
            let flow_key = (request.client_id.as_raw(), request.flow_id.as_raw());
            if !inner.flows.contains_key(&flow_key) {
                return Err(StoreError::UnknownFlow {
                    client_id: request.client_id,
                    flow_id: request.flow_id,
                });
            }
            inner.requests.insert(
                (request.client_id.as_raw(), request.flow_id.as_raw(), request.request_id.as_raw()),
                request.clone(),
            );
        }
        for message in messages {
            inner
                .messages
                .insert((message.client_id.as_raw(), message.message_id.as_raw()), message.clone());
        }
        Ok(())
    }

    fn write_flow_responses(
        &self,
        responses: &[FlowResponse],
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.apply_responses(responses, now);
        Ok(())
    }

    fn read_all_flow_requests_and_responses(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
    ) -> Result<Vec<(FlowRequest, Vec<FlowResponse>)>, StoreError> {
        let inner = self.lock()?;
        if !inner.flows.contains_key(&(client_id.as_raw(), flow_id.as_raw())) {
            return Err(StoreError::UnknownFlow { client_id, flow_id });
        }
        let mut out = Vec::new();
        let start = (client_id.as_raw(), flow_id.as_raw(), 0);
        let end = (client_id.as_raw(), flow_id.as_raw(), u64::MAX);
        for (key, request) in inner.requests.range(start..=end) {
            let response_start = (key.0, key.1, key.2, 0);
            let response_end = (key.0, key.1, key.2, u64::MAX);
            let responses: Vec<FlowResponse> = inner
                .responses
                .range(response_start..=response_end)
                .map(|(_, response)| response.clone())
                .collect();
            out.push((request.clone(), responses));
        }
        Ok(out)
    }

    fn read_flow_requests_ready_for_processing(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        cursor: RequestId,
    ) -> Result<Vec<(FlowRequest, Vec<FlowResponse>)>, StoreError> {
        let all = self.read_all_flow_requests_and_responses(client_id, flow_id)?;
        Ok(all
            .into_iter()
            .filter(|(request, _)| {
                request.needs_processing && request.request_id >= cursor
            })
            .collect())
    }

    fn delete_flow_requests(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        request_ids: &[RequestId],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for request_id in request_ids {
            inner.requests.remove(&(client_id.as_raw(), flow_id.as_raw(), request_id.as_raw()));
            let range_start = (client_id.as_raw(), flow_id.as_raw(), request_id.as_raw(), 0);
            let range_end = (client_id.as_raw(), flow_id.as_raw(), request_id.as_raw(), u64::MAX);
            let stale: Vec<(u64, u64, u64, u64)> =
                inner.responses.range(range_start..=range_end).map(|(key, _)| *key).collect();
            for key in stale {
                inner.responses.remove(&key);
            }
        }
        Ok(())
    }

    fn count_flow_requests(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
    ) -> Result<u64, StoreError> {
        let inner = self.lock()?;
        let start = (client_id.as_raw(), flow_id.as_raw(), 0);
        let end = (client_id.as_raw(), flow_id.as_raw(), u64::MAX);
        Ok(inner.requests.range(start..=end).count() as u64)
    }

    // ------------------------------------------------------------------
    // Flow results
    // ------------------------------------------------------------------

    fn read_flow_results(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        offset: u64,
        count: u64,
    ) -> Result<Vec<FlowResult>, StoreError> {
        let inner = self.lock()?;
        if !inner.flows.contains_key(&(client_id.as_raw(), flow_id.as_raw())) {
            return Err(StoreError::UnknownFlow { client_id, flow_id });
        }
        let start = (client_id.as_raw(), flow_id.as_raw(), 0);
        let end = (client_id.as_raw(), flow_id.as_raw(), u64::MAX);
        Ok(inner
            .results
            .range(start..=end)
            .map(|(_, result)| result.clone())
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(count).unwrap_or(usize::MAX))
            .collect())
    }

    fn read_hunt_results(
        &self,
        hunt_id: HuntId,
        offset: u64,
        count: u64,
    ) -> Result<Vec<FlowResult>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .results
            .values()
            .filter(|result| result.hunt_id == Some(hunt_id))
            .cloned()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(count).unwrap_or(usize::MAX))
            .collect())
    }

    // ------------------------------------------------------------------
    // Outbound client messages
    // ------------------------------------------------------------------

    fn write_client_messages(&self, messages: &[ClientMessage]) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for message in messages {
            inner
                .messages
                .insert((message.client_id.as_raw(), message.message_id.as_raw()), message.clone());
        }
        Ok(())
    }

    fn lease_client_messages(
        &self,
        client_id: ClientId,
        owner: &str,
        now: Timestamp,
        lease_duration: DurationMicros,
        limit: u64,
    ) -> Result<Vec<ClientMessage>, StoreError> {
        let mut inner = self.lock()?;
        let keys: Vec<(u64, u64)> = inner
            .messages
            .range((client_id.as_raw(), 0)..=(client_id.as_raw(), u64::MAX))
            .filter(|(_, message)| Inner::lease_free(message.lease_deadline, now))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|(key, _)| *key)
            .collect();
        let mut leased = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(message) = inner.messages.get_mut(&key) {
                message.lease_owner = Some(owner.to_string());
                message.lease_deadline = Some(now.saturating_add(lease_duration));
                message.lease_count = message.lease_count.saturating_add(1);
                leased.push(message.clone());
            }
        }
        Ok(leased)
    }

    fn delete_client_messages(
        &self,
        client_id: ClientId,
        message_ids: &[MessageId],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for message_id in message_ids {
            inner.messages.remove(&(client_id.as_raw(), message_id.as_raw()));
        }
        Ok(())
    }

    fn read_client_messages(&self, client_id: ClientId) -> Result<Vec<ClientMessage>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .messages
            .range((client_id.as_raw(), 0)..=(client_id.as_raw(), u64::MAX))
            .map(|(_, message)| message.clone())
            .collect())
    }

    // ------------------------------------------------------------------
    // Flow processing queue
    // ------------------------------------------------------------------

    fn write_flow_processing_requests(
        &self,
        requests: &[FlowProcessingRequest],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for request in requests {
            inner.enqueue_processing(request.clone());
        }
        Ok(())
    }

    fn lease_flow_processing_requests(
        &self,
        owner: &str,
        now: Timestamp,
        lease_duration: DurationMicros,
        limit: u64,
    ) -> Result<Vec<FlowProcessingRequest>, StoreError> {
        let mut inner = self.lock()?;
        let mut due: Vec<((u64, u64), Timestamp)> = inner
            .processing
            .iter()
            .filter(|(_, entry)| {
                entry.request.delivery_time.is_none_or(|delivery| delivery <= now)
                    && Inner::lease_free(entry.lease_deadline, now)
            })
            .map(|(key, entry)| (*key, entry.request.written_at))
            .collect();
        due.sort_by_key(|(_, written_at)| *written_at);
        due.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        let mut leased = Vec::with_capacity(due.len());
        for (key, _) in due {
            if let Some(entry) = inner.processing.get_mut(&key) {
                entry.lease_owner = Some(owner.to_string());
                entry.lease_deadline = Some(now.saturating_add(lease_duration));
                entry.lease_count = entry.lease_count.saturating_add(1);
                leased.push(entry.request.clone());
            }
        }
        Ok(leased)
    }

    fn ack_flow_processing_request(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let key = (client_id.as_raw(), flow_id.as_raw());
        if let Some(entry) = inner.processing.get_mut(&key) {
            if entry.resignaled {
                // A new signal arrived while this wake-up was leased; keep
                // the entry and let the next pass serve it.
                entry.resignaled = false;
                entry.lease_owner = None;
                entry.lease_deadline = None;
            } else {
                inner.processing.remove(&key);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Message handler queue
    // ------------------------------------------------------------------

    fn write_message_handler_requests(
        &self,
        requests: &[MessageHandlerRequest],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for request in requests {
            inner
                .handler_requests
                .insert((request.handler_name.clone(), request.request_id), request.clone());
        }
        Ok(())
    }

    fn lease_message_handler_requests(
        &self,
        now: Timestamp,
        lease_duration: DurationMicros,
        limit: u64,
    ) -> Result<Vec<MessageHandlerRequest>, StoreError> {
        let mut inner = self.lock()?;
        let keys: Vec<(String, u64)> = inner
            .handler_requests
            .iter()
            .filter(|(_, request)| Inner::lease_free(request.lease_deadline, now))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|(key, _)| key.clone())
            .collect();
        let mut leased = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(request) = inner.handler_requests.get_mut(&key) {
                request.lease_deadline = Some(now.saturating_add(lease_duration));
                leased.push(request.clone());
            }
        }
        Ok(leased)
    }

    fn delete_message_handler_requests(&self, keys: &[(String, u64)]) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for key in keys {
            inner.handler_requests.remove(key);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Approvals
    // ------------------------------------------------------------------

    fn write_approval(&self, approval: &Approval) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let key = (approval.requestor.as_str().to_string(), approval.approval_id.as_raw());
        if inner.approvals.contains_key(&key) {
            return Err(StoreError::DuplicateKey(approval.approval_id.to_string()));
        }
        inner.approvals.insert(key, approval.clone());
        Ok(())
    }

    fn read_approval(
        &self,
        requestor: &Username,
        approval_id: ApprovalId,
    ) -> Result<Approval, StoreError> {
        self.lock()?
            .approvals
            .get(&(requestor.as_str().to_string(), approval_id.as_raw()))
            .cloned()
            .ok_or_else(|| StoreError::UnknownApproval(approval_id.to_string()))
    }

    fn read_approvals(
        &self,
        requestor: &Username,
        approval_type: ApprovalType,
        subject_id: Option<&str>,
        include_expired: bool,
        now: Timestamp,
    ) -> Result<Vec<Approval>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .approvals
            .values()
            .filter(|approval| {
                approval.requestor == *requestor
                    && approval.approval_type == approval_type
                    && subject_id.is_none_or(|subject| approval.subject_id == subject)
                    && (include_expired || !approval.is_expired(now))
            })
            .cloned()
            .collect())
    }

    fn grant_approval(
        &self,
        requestor: &Username,
        approval_id: ApprovalId,
        grant: &Grant,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let approval = inner
            .approvals
            .get_mut(&(requestor.as_str().to_string(), approval_id.as_raw()))
            .ok_or_else(|| StoreError::UnknownApproval(approval_id.to_string()))?;
        approval.grants.push(grant.clone());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Hunts
    // ------------------------------------------------------------------

    fn write_hunt(&self, hunt: &Hunt) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.hunts.contains_key(&hunt.hunt_id.as_raw()) {
            return Err(StoreError::DuplicateKey(hunt.hunt_id.to_string()));
        }
        inner.hunts.insert(hunt.hunt_id.as_raw(), hunt.clone());
        Ok(())
    }

    fn read_hunt(&self, hunt_id: HuntId) -> Result<Hunt, StoreError> {
        self.lock()?.hunts.get(&hunt_id.as_raw()).cloned().ok_or(StoreError::UnknownHunt(hunt_id))
    }

    fn list_hunts(&self, offset: u64, count: u64) -> Result<Vec<Hunt>, StoreError> {
        let inner = self.lock()?;
        let mut hunts: Vec<Hunt> = inner.hunts.values().cloned().collect();
        hunts.sort_by_key(|hunt| std::cmp::Reverse(hunt.created_at));
        Ok(hunts
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(count).unwrap_or(usize::MAX))
            .collect())
    }

    fn set_hunt_state(&self, hunt_id: HuntId, state: HuntState) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let hunt =
            inner.hunts.get_mut(&hunt_id.as_raw()).ok_or(StoreError::UnknownHunt(hunt_id))?;
        hunt.state = state;
        Ok(())
    }

    fn record_hunt_dispatch(
        &self,
        hunt_id: HuntId,
        now: Timestamp,
        throttle_window: DurationMicros,
    ) -> Result<HuntAdmission, StoreError> {
        let mut inner = self.lock()?;
        let hunt =
            inner.hunts.get_mut(&hunt_id.as_raw()).ok_or(StoreError::UnknownHunt(hunt_id))?;
        if hunt.state != HuntState::Started {
            return Ok(HuntAdmission { decision: HuntAdmissionDecision::NotRunning, hunt: hunt.clone() });
        }
        if now.since(hunt.throttle_window_start) >= throttle_window {
            hunt.throttle_window_start = now;
            hunt.dispatches_this_window = 0;
        }
        if hunt.client_limit > 0 && hunt.num_clients >= hunt.client_limit {
            return Ok(HuntAdmission {
                decision: HuntAdmissionDecision::LimitReached,
                hunt: hunt.clone(),
            });
        }
        if hunt.client_rate > 0 && hunt.dispatches_this_window >= hunt.client_rate {
            return Ok(HuntAdmission {
                decision: HuntAdmissionDecision::Throttled,
                hunt: hunt.clone(),
            });
        }
        hunt.num_clients = hunt.num_clients.saturating_add(1);
        hunt.dispatches_this_window = hunt.dispatches_this_window.saturating_add(1);
        Ok(HuntAdmission { decision: HuntAdmissionDecision::Admitted, hunt: hunt.clone() })
    }

    fn update_hunt_counters(
        &self,
        hunt_id: HuntId,
        delta: &HuntCounterDelta,
    ) -> Result<Hunt, StoreError> {
        let mut inner = self.lock()?;
        if !inner.hunts.contains_key(&hunt_id.as_raw()) {
            return Err(StoreError::UnknownHunt(hunt_id));
        }
        inner.apply_hunt_delta(hunt_id, delta);
        inner.hunts.get(&hunt_id.as_raw()).cloned().ok_or(StoreError::UnknownHunt(hunt_id))
    }

    fn read_hunt_flows(
        &self,
        hunt_id: HuntId,
        offset: u64,
        count: u64,
    ) -> Result<Vec<Flow>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .flows
            .values()
            .filter(|flow| flow.parent_hunt_id == Some(hunt_id))
            .cloned()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(count).unwrap_or(usize::MAX))
            .collect())
    }

    // ------------------------------------------------------------------
    // Signed binaries
    // ------------------------------------------------------------------

    fn write_signed_binary_references(
        &self,
        references: &SignedBinaryReferences,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.binaries.insert(
            (references.id.binary_kind.to_string(), references.id.path.clone()),
            references.clone(),
        );
        Ok(())
    }

    fn read_signed_binary_references(
        &self,
        id: &SignedBinaryId,
    ) -> Result<SignedBinaryReferences, StoreError> {
        self.lock()?
            .binaries
            .get(&(id.binary_kind.to_string(), id.path.clone()))
            .cloned()
            .ok_or_else(|| StoreError::UnknownBinary(format!("{}/{}", id.binary_kind, id.path)))
    }

    fn read_ids_for_all_signed_binaries(&self) -> Result<Vec<SignedBinaryId>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.binaries.values().map(|references| references.id.clone()).collect())
    }
}

// ============================================================================
// SECTION: In-Memory Blob Store
// ============================================================================

/// In-memory content-addressed blob store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBlobStore {
    /// Blob bytes keyed by content address.
    blobs: Arc<Mutex<BTreeMap<BlobId, Vec<u8>>>>,
    /// Blob reference lists keyed by file id.
    references: Arc<Mutex<BTreeMap<BlobId, Vec<BlobReference>>>>,
}

impl InMemoryBlobStore {
    /// Creates a new empty blob store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for InMemoryBlobStore {
    fn write_blobs(&self, blobs: &[Vec<u8>]) -> Result<Vec<BlobId>, StoreError> {
        let mut guard = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Transient("blob store mutex poisoned".to_string()))?;
        let mut ids = Vec::with_capacity(blobs.len());
        for blob in blobs {
            let id = BlobId::of(blob);
            guard.entry(id).or_insert_with(|| blob.clone());
            ids.push(id);
        }
        Ok(ids)
    }

    fn read_blobs(&self, blob_ids: &[BlobId]) -> Result<Vec<Vec<u8>>, StoreError> {
        let guard = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Transient("blob store mutex poisoned".to_string()))?;
        blob_ids
            .iter()
            .map(|blob_id| guard.get(blob_id).cloned().ok_or(StoreError::UnknownBlob(*blob_id)))
            .collect()
    }

    fn check_blobs_exist(&self, blob_ids: &[BlobId]) -> Result<Vec<bool>, StoreError> {
        let guard = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Transient("blob store mutex poisoned".to_string()))?;
        Ok(blob_ids.iter().map(|blob_id| guard.contains_key(blob_id)).collect())
    }

    fn write_blob_references(
        &self,
        file_id: &BlobId,
        references: &[BlobReference],
    ) -> Result<(), StoreError> {
        let mut guard = self
            .references
            .lock()
            .map_err(|_| StoreError::Transient("blob store mutex poisoned".to_string()))?;
        guard.insert(*file_id, references.to_vec());
        Ok(())
    }

    fn read_blob_references(&self, file_id: &BlobId) -> Result<Vec<BlobReference>, StoreError> {
        let guard = self
            .references
            .lock()
            .map_err(|_| StoreError::Transient("blob store mutex poisoned".to_string()))?;
        guard.get(file_id).cloned().ok_or(StoreError::UnknownBlob(*file_id))
    }
}
