// outpost-core/src/runtime/engine.rs
// ============================================================================
// Module: Outpost Flow Engine
// Description: Persistent state-machine execution for investigations.
// Purpose: Drive flows through leased processing steps with quota enforcement.
// Dependencies: crate::core, crate::interfaces, crate::runtime::flows
// ============================================================================

//! ## Overview
//! The flow engine is the single canonical execution path for investigations.
//! Workers lease processing wake-ups, lease the flow row, walk completed
//! requests in strict ascending request-id order, invoke the flow class's
//! state callbacks, and atomically persist the callback outputs together with
//! the cursor advance. A worker crash leaves the lease to expire; the next
//! worker re-executes the state, whose writes are deduplicated by request id.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use thiserror::Error;

use crate::core::flow::Flow;
use crate::core::flow::FlowResponse;
use crate::core::flow::FlowState;
use crate::core::flow::ResponseBody;
use crate::core::flow::Status;
use crate::core::flow::StatusKind;
use crate::core::hunt::HuntCounterDelta;
use crate::core::identifiers::ClientId;
use crate::core::identifiers::FlowId;
use crate::core::identifiers::FlowName;
use crate::core::identifiers::HuntId;
use crate::core::identifiers::RequestId;
use crate::core::identifiers::ResponseId;
use crate::core::identifiers::Username;
use crate::core::payload::Payload;
use crate::core::time::DurationMicros;
use crate::core::time::Timestamp;
use crate::interfaces::Clock;
use crate::interfaces::DataStore;
use crate::interfaces::FlowPersistencePlan;
use crate::interfaces::IdGenerator;
use crate::interfaces::StoreError;
use crate::runtime::flows::FlowClass;
use crate::runtime::flows::FlowContext;
use crate::runtime::flows::FlowError;
use crate::runtime::flows::FlowRegistry;
use crate::runtime::flows::StepOutputs;
use crate::runtime::flows::build_flow_start;
use crate::runtime::flows::terminal_status;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Response id used for server-synthesized terminal statuses that must
/// outrank any agent-assigned id.
pub const SYNTHETIC_TERMINAL_RESPONSE_ID: u64 = u64::MAX;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Configuration for the flow engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEngineConfig {
    /// Duration of the per-flow processing lease.
    pub flow_lease: DurationMicros,
    /// Duration of outbound message delivery leases.
    pub message_lease: DurationMicros,
    /// Duration of processing-queue leases.
    pub processing_lease: DurationMicros,
    /// Maximum delivery attempts before a message is dropped.
    pub max_retransmissions: u64,
    /// Maximum outbound messages leased per poll.
    pub max_leased_messages: u64,
    /// Maximum processing wake-ups leased per worker pass.
    pub processing_batch: u64,
}

impl Default for FlowEngineConfig {
    fn default() -> Self {
        Self {
            flow_lease: DurationMicros::from_minutes(10),
            message_lease: DurationMicros::from_minutes(10),
            processing_lease: DurationMicros::from_minutes(10),
            max_retransmissions: 10,
            max_leased_messages: 100,
            processing_batch: 32,
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Flow engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Data store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The named flow class is not registered.
    #[error("unknown flow class: {0}")]
    UnknownFlowClass(String),
    /// The start state of a new flow failed.
    #[error("flow start failed: {0}")]
    StartFailed(#[from] FlowError),
    /// The request was malformed.
    #[error("bad request: {0}")]
    BadRequest(String),
}

// ============================================================================
// SECTION: Start Request
// ============================================================================

/// Request to start a new top-level flow.
#[derive(Debug, Clone)]
pub struct StartFlowRequest {
    /// Client the flow runs on.
    pub client_id: ClientId,
    /// Registered flow class name.
    pub flow_name: FlowName,
    /// Flow class arguments.
    pub args: Payload,
    /// Username creating the flow.
    pub creator: Username,
    /// CPU budget in seconds; zero means unlimited.
    pub cpu_limit_seconds: f64,
    /// Network budget in bytes; zero means unlimited.
    pub network_bytes_limit: u64,
    /// Explicit flow id; hunts use their own id so fan-out deduplicates.
    pub flow_id: Option<FlowId>,
    /// Hunt the flow belongs to, when dispatched by one.
    pub parent_hunt_id: Option<HuntId>,
}

/// Outcome of processing one flow wake-up.
#[derive(Debug)]
pub struct ProcessOutcome {
    /// Client of the processed flow.
    pub client_id: ClientId,
    /// Processed flow.
    pub flow_id: FlowId,
    /// Hunt whose ceilings should be re-checked, or the error encountered.
    pub result: Result<Option<HuntId>, EngineError>,
}

// ============================================================================
// SECTION: Flow Engine
// ============================================================================

/// Persistent state-machine engine for flows.
pub struct FlowEngine {
    /// Data store backend.
    store: Arc<dyn DataStore>,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Identifier source.
    ids: Arc<dyn IdGenerator>,
    /// Flow class registry.
    registry: Arc<FlowRegistry>,
    /// Engine configuration.
    config: FlowEngineConfig,
}

impl FlowEngine {
    /// Creates a new flow engine.
    #[must_use]
    pub fn new(
        store: Arc<dyn DataStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        registry: Arc<FlowRegistry>,
        config: FlowEngineConfig,
    ) -> Self {
        Self { store, clock, ids, registry, config }
    }

    /// Returns the engine configuration.
    #[must_use]
    pub const fn config(&self) -> &FlowEngineConfig {
        &self.config
    }

    /// Returns the flow class registry.
    #[must_use]
    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Flow creation
    // ------------------------------------------------------------------

    /// Starts a new top-level flow, running its start state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the class is unknown, the client does
    /// not exist, or the start state fails.
    pub fn start_flow(&self, request: StartFlowRequest) -> Result<Flow, EngineError> {
        if !self.registry.contains(request.flow_name.as_str()) {
            return Err(EngineError::UnknownFlowClass(request.flow_name.to_string()));
        }
        self.store.read_client(request.client_id)?;

        let now = self.clock.now();
        let flow_id = request.flow_id.unwrap_or_else(|| FlowId::from_raw(self.ids.next_id()));
        let flow = Flow {
            client_id: request.client_id,
            flow_id,
            parent_flow_id: None,
            parent_request_id: None,
            parent_hunt_id: request.parent_hunt_id,
            flow_name: request.flow_name,
            args: request.args,
            creator: request.creator,
            created_at: now,
            updated_at: now,
            state: FlowState::Running,
            persistent_state: serde_json::Value::Null,
            cpu_time_used: 0.0,
            network_bytes_sent: 0,
            cpu_limit_seconds: request.cpu_limit_seconds,
            network_bytes_limit: request.network_bytes_limit,
            next_request_to_process: RequestId::FIRST,
            next_outbound_id: RequestId::FIRST,
            pending_termination: None,
            processing_owner: None,
            processing_deadline: None,
            processing_lease_count: 0,
            error_message: None,
            backtrace: None,
            result_count: 0,
        };

        let mut outputs = StepOutputs::default();
        build_flow_start(&self.registry, self.ids.as_ref(), now, flow, &mut outputs)?;
        let started = outputs
            .child_starts
            .last()
            .map(|start| start.flow.clone())
            .ok_or_else(|| EngineError::BadRequest("start produced no flow".to_string()))?;
        self.apply_start_outputs(outputs, now)?;
        Ok(started)
    }

    /// Applies buffered start outputs: flow creations parents-first, then
    /// response writes and wake-ups.
    fn apply_start_outputs(
        &self,
        mut outputs: StepOutputs,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        for start in outputs.child_starts.iter().rev() {
            self.store.create_flow(start)?;
        }
        if !outputs.response_writes.is_empty() {
            self.store.write_flow_responses(&outputs.response_writes, now)?;
        }
        if !outputs.processing_requests.is_empty() {
            self.store.write_flow_processing_requests(&outputs.processing_requests)?;
        }
        for (client_id, knowledge_base) in outputs.knowledge_base_updates.drain(..) {
            let mut client = self.store.read_client(client_id)?;
            client.knowledge_base = knowledge_base;
            self.store.write_client(&client)?;
        }
        if !outputs.path_info_writes.is_empty() {
            self.store.write_path_infos(&outputs.path_info_writes)?;
        }
        Ok(())
    }

    /// Requests cooperative termination of a running flow.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the flow does not exist.
    pub fn cancel_flow(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        reason: &str,
    ) -> Result<(), EngineError> {
        self.store.set_flow_pending_termination(client_id, flow_id, reason)?;
        let now = self.clock.now();
        self.store.write_flow_processing_requests(&[crate::core::flow::FlowProcessingRequest {
            client_id,
            flow_id,
            written_at: now,
            delivery_time: None,
        }])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound delivery
    // ------------------------------------------------------------------

    /// Leases deliverable outbound messages for a polling client.
    ///
    /// Messages past the retransmission limit are dropped here: the message
    /// is deleted and a synthetic terminal error status is injected into its
    /// flow, which advances it to the error state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the store fails.
    pub fn lease_outbound_messages(
        &self,
        client_id: ClientId,
        owner: &str,
    ) -> Result<Vec<crate::core::flow::ClientMessage>, EngineError> {
        let now = self.clock.now();
        let leased = self.store.lease_client_messages(
            client_id,
            owner,
            now,
            self.config.message_lease,
            self.config.max_leased_messages,
        )?;
        let mut deliverable = Vec::with_capacity(leased.len());
        for message in leased {
            if message.lease_count > self.config.max_retransmissions {
                self.store.delete_client_messages(client_id, &[message.message_id])?;
                let synthetic = FlowResponse {
                    client_id,
                    flow_id: message.flow_id,
                    request_id: message.request_id,
                    response_id: ResponseId::from_raw(SYNTHETIC_TERMINAL_RESPONSE_ID),
                    body: ResponseBody::Status(Status::error(
                        StatusKind::RetransmissionLimitExceeded,
                        "retransmission limit exceeded",
                    )),
                    received_at: now,
                };
                self.store.write_flow_responses(&[synthetic], now)?;
            } else {
                deliverable.push(message);
            }
        }
        Ok(deliverable)
    }

    // ------------------------------------------------------------------
    // Processing loop
    // ------------------------------------------------------------------

    /// Leases a batch of processing wake-ups and advances each flow.
    ///
    /// Wake-ups are acknowledged on success and on fatal errors; retriable
    /// errors leave the wake-up to be re-leased after its lease expires.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the queue lease itself fails.
    pub fn process_queue_once(&self, worker: &str) -> Result<Vec<ProcessOutcome>, EngineError> {
        let now = self.clock.now();
        let wakeups = self.store.lease_flow_processing_requests(
            worker,
            now,
            self.config.processing_lease,
            self.config.processing_batch,
        )?;
        let mut outcomes = Vec::with_capacity(wakeups.len());
        for wakeup in wakeups {
            let result = self.process_flow(wakeup.client_id, wakeup.flow_id, worker);
            let ack = match &result {
                Ok(_) => true,
                Err(EngineError::Store(err)) => !err.is_retriable(),
                Err(_) => true,
            };
            if ack {
                self.store.ack_flow_processing_request(wakeup.client_id, wakeup.flow_id)?;
            }
            outcomes.push(ProcessOutcome {
                client_id: wakeup.client_id,
                flow_id: wakeup.flow_id,
                result,
            });
        }
        Ok(outcomes)
    }

    /// Advances one flow: walks completed requests in strict request-id
    /// order, invoking state callbacks and persisting their outputs.
    ///
    /// Returns the hunt whose ceilings should be re-checked when the flow
    /// reached a terminal state as a hunt child.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when leasing or persistence fails; callback
    /// failures are persisted as the flow's error state, not returned.
    pub fn process_flow(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        worker: &str,
    ) -> Result<Option<HuntId>, EngineError> {
        let now = self.clock.now();
        let mut flow = self.store.lease_flow_for_processing(
            client_id,
            flow_id,
            worker,
            now,
            self.config.flow_lease,
        )?;
        if flow.state.is_terminal() {
            self.release_unchanged(flow, worker)?;
            return Ok(None);
        }
        let class = self
            .registry
            .create(flow.flow_name.as_str())
            .ok_or_else(|| EngineError::UnknownFlowClass(flow.flow_name.to_string()))?;

        let ready = self.store.read_flow_requests_ready_for_processing(
            client_id,
            flow_id,
            flow.next_request_to_process,
        )?;

        let mut outputs = StepOutputs::default();
        let mut processed: Vec<RequestId> = Vec::new();

        for (request, responses) in ready {
            if request.request_id != flow.next_request_to_process {
                break;
            }
            if let Some(reason) = flow.pending_termination.take() {
                flow.state = FlowState::Error;
                flow.error_message = Some(reason);
                break;
            }
            if let Some(status) = terminal_status(&responses) {
                flow.cpu_time_used += status.cpu_used.total_seconds();
                flow.network_bytes_sent =
                    flow.network_bytes_sent.saturating_add(status.network_bytes_sent);
                if status.kind == StatusKind::ClientKilled {
                    flow.state = FlowState::Crashed;
                    flow.error_message =
                        Some(status.error_message.clone().unwrap_or_else(|| {
                            "agent crashed while servicing the flow".to_string()
                        }));
                    processed.push(request.request_id);
                    flow.next_request_to_process = request.request_id.next();
                    break;
                }
                if flow.cpu_limit_seconds > 0.0 && flow.cpu_time_used > flow.cpu_limit_seconds {
                    flow.pending_termination = Some(format!(
                        "cpu limit exceeded: {:.3}s used of {:.3}s",
                        flow.cpu_time_used, flow.cpu_limit_seconds
                    ));
                }
                if flow.network_bytes_limit > 0
                    && flow.network_bytes_sent > flow.network_bytes_limit
                {
                    flow.pending_termination = Some(format!(
                        "network limit exceeded: {} bytes used of {}",
                        flow.network_bytes_sent, flow.network_bytes_limit
                    ));
                }
            }

            let result = self.invoke_state(
                class.as_ref(),
                &mut flow,
                now,
                &request.next_state,
                &responses,
                &mut outputs,
            );
            processed.push(request.request_id);
            flow.next_request_to_process = request.request_id.next();
            if let Err(err) = result {
                flow.state = FlowState::Error;
                flow.error_message = Some(err.to_string());
                flow.backtrace = Some(format!("{err:?}"));
                break;
            }
        }

        if flow.state == FlowState::Running
            && let Some(reason) = flow.pending_termination.take()
        {
            flow.state = FlowState::Error;
            flow.error_message = Some(reason);
        }

        if flow.state == FlowState::Running {
            let stored = self.store.count_flow_requests(client_id, flow_id)?;
            let remaining = stored
                .saturating_sub(processed.len() as u64)
                .saturating_add(outputs.new_requests.len() as u64)
                .saturating_add(
                    outputs.child_starts.iter().filter(|start| !start.flow.state.is_terminal()).count()
                        as u64,
                );
            if remaining == 0 {
                flow.state = FlowState::Finished;
            }
        }

        let mut hunt_check = None;
        let mut hunt_delta = None;
        if flow.state.is_terminal() {
            if let (Some(parent_flow_id), Some(parent_request_id)) =
                (flow.parent_flow_id, flow.parent_request_id)
            {
                outputs.response_writes.push(FlowResponse {
                    client_id,
                    flow_id: parent_flow_id,
                    request_id: parent_request_id,
                    response_id: ResponseId::from_raw(1),
                    body: ResponseBody::Status(self.completion_status(&flow)),
                    received_at: now,
                });
            }
            // Only top-level hunt children feed hunt counters; nested child
            // flows report through their parent's completion status instead.
            if let Some(hunt_id) = flow.parent_hunt_id
                && flow.parent_flow_id.is_none()
            {
                let mut delta = HuntCounterDelta {
                    num_results: flow.result_count,
                    total_cpu_seconds: flow.cpu_time_used,
                    total_network_bytes: flow.network_bytes_sent,
                    ..HuntCounterDelta::default()
                };
                match flow.state {
                    FlowState::Finished => delta.num_successful = 1,
                    FlowState::Crashed => delta.num_crashed = 1,
                    FlowState::Error | FlowState::Running => delta.num_failed = 1,
                }
                hunt_delta = Some((hunt_id, delta));
                hunt_check = Some(hunt_id);
            }
        }

        flow.updated_at = now;
        flow.processing_owner = None;
        flow.processing_deadline = None;
        let plan = FlowPersistencePlan {
            flow,
            expected_owner: worker.to_string(),
            processed_request_ids: processed,
            new_requests: outputs.new_requests,
            new_messages: outputs.new_messages,
            new_results: outputs.new_results,
            child_starts: outputs.child_starts,
            response_writes: outputs.response_writes,
            processing_requests: outputs.processing_requests,
            knowledge_base_updates: outputs.knowledge_base_updates,
            path_info_writes: outputs.path_info_writes,
            hunt_delta,
        };
        self.store.release_processed_flow(&plan)?;
        Ok(hunt_check)
    }

    /// Invokes one state callback, then drains inline re-entries.
    fn invoke_state(
        &self,
        class: &dyn FlowClass,
        flow: &mut Flow,
        now: Timestamp,
        state: &str,
        responses: &[FlowResponse],
        outputs: &mut StepOutputs,
    ) -> Result<(), FlowError> {
        {
            let mut ctx =
                FlowContext::new(flow, now, self.ids.as_ref(), &self.registry, outputs);
            class.process(&mut ctx, state, responses)?;
        }
        loop {
            let pending = std::mem::take(&mut outputs.inline_states);
            if pending.is_empty() {
                return Ok(());
            }
            for inline_state in pending {
                let mut ctx =
                    FlowContext::new(flow, now, self.ids.as_ref(), &self.registry, outputs);
                class.process(&mut ctx, &inline_state, &[])?;
            }
        }
    }

    /// Builds the parent-facing status mirroring a terminal flow.
    ///
    /// The status carries the child's accumulated resource usage so parents
    /// and hunts account for nested work.
    fn completion_status(&self, flow: &Flow) -> Status {
        let mut status = match flow.state {
            FlowState::Finished => {
                Status::ok(crate::core::flow::CpuUsage::default(), 0)
            }
            FlowState::Crashed => Status::error(
                StatusKind::ClientKilled,
                flow.error_message.clone().unwrap_or_else(|| "child flow crashed".to_string()),
            ),
            FlowState::Error | FlowState::Running => Status::error(
                StatusKind::GenericError,
                flow.error_message.clone().unwrap_or_else(|| "child flow failed".to_string()),
            ),
        };
        status.cpu_used =
            crate::core::flow::CpuUsage { user_seconds: flow.cpu_time_used, system_seconds: 0.0 };
        status.network_bytes_sent = flow.network_bytes_sent;
        status
    }

    /// Releases a flow lease without applying any changes.
    fn release_unchanged(&self, mut flow: Flow, worker: &str) -> Result<(), EngineError> {
        flow.processing_owner = None;
        flow.processing_deadline = None;
        let plan = FlowPersistencePlan {
            flow,
            expected_owner: worker.to_string(),
            processed_request_ids: Vec::new(),
            new_requests: Vec::new(),
            new_messages: Vec::new(),
            new_results: Vec::new(),
            child_starts: Vec::new(),
            response_writes: Vec::new(),
            processing_requests: Vec::new(),
            knowledge_base_updates: Vec::new(),
            path_info_writes: Vec::new(),
            hunt_delta: None,
        };
        self.store.release_processed_flow(&plan)?;
        Ok(())
    }
}
