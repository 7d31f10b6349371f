// outpost-core/src/runtime/flows.rs
// ============================================================================
// Module: Outpost Flow Classes
// Description: Flow class trait, state context, registry, and built-in flows.
// Purpose: Express multi-step investigations as named state callbacks.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! A flow class expresses an investigation as a set of named state callbacks.
//! Each callback inspects the responses that completed the previous request,
//! optionally issues new requests naming the next state, and optionally
//! persists results. Callbacks must be deterministic and idempotent with
//! respect to already-persisted state: the engine may re-execute a state
//! after a worker crash and deduplicates writes by request id.
//!
//! Flow classes are registered in a build-time table; there is no runtime
//! plugin discovery.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::core::client::KnowledgeBase;
use crate::core::client::PathInfo;
use crate::core::flow::ClientMessage;
use crate::core::flow::Flow;
use crate::core::flow::FlowProcessingRequest;
use crate::core::flow::FlowRequest;
use crate::core::flow::FlowResponse;
use crate::core::flow::FlowResult;
use crate::core::flow::ResponseBody;
use crate::core::flow::Status;
use crate::core::identifiers::ClientId;
use crate::core::identifiers::FlowId;
use crate::core::identifiers::MessageId;
use crate::core::identifiers::RequestId;
use crate::core::identifiers::SessionId;
use crate::core::payload::ACTION_EXECUTE_BINARY;
use crate::core::payload::ACTION_GET_CLIENT_STATS;
use crate::core::payload::ACTION_GET_PLATFORM_INFO;
use crate::core::payload::ACTION_LIST_PROCESSES;
use crate::core::payload::ACTION_STAT_FILE;
use crate::core::payload::ACTION_UPDATE_AGENT;
use crate::core::payload::Payload;
use crate::core::payload::PayloadError;
use crate::core::time::DurationMicros;
use crate::core::time::Timestamp;
use crate::interfaces::FlowStart;
use crate::interfaces::IdGenerator;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// State name every flow begins in.
pub const START_STATE: &str = "Start";
/// Flow classes requiring an admin caller regardless of approvals.
pub const RESTRICTED_FLOW_NAMES: &[&str] = &["ExecuteBinary", "UpdateAgent"];

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors returned by flow state callbacks.
///
/// A callback returning an error transitions the flow to the error state with
/// the message propagated into the flow row.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The agent reported a failed action.
    #[error("action failed: {0}")]
    ActionFailed(String),
    /// The flow arguments do not match the class.
    #[error("bad flow arguments: {0}")]
    BadArgs(String),
    /// The callback state name is not part of the class.
    #[error("unknown flow state: {0}")]
    UnknownState(String),
    /// A payload failed to encode or decode.
    #[error(transparent)]
    Payload(#[from] PayloadError),
    /// The per-flow state blob failed to serialize or deserialize.
    #[error("flow state serialization: {0}")]
    State(String),
    /// The named flow class is not registered.
    #[error("unknown flow class: {0}")]
    UnknownClass(String),
}

// ============================================================================
// SECTION: Step Outputs
// ============================================================================

/// Accumulated outputs of one state-callback invocation.
///
/// The engine folds these into a persistence plan applied in a single store
/// transaction together with the cursor advance.
#[derive(Debug, Default)]
pub struct StepOutputs {
    /// New requests issued via `call_client` or delayed states.
    pub new_requests: Vec<FlowRequest>,
    /// Outbound messages carrying the new requests.
    pub new_messages: Vec<ClientMessage>,
    /// Results persisted via `send_reply`.
    pub new_results: Vec<FlowResult>,
    /// Child flows started via `call_flow`, fully materialized.
    pub child_starts: Vec<FlowStart>,
    /// Responses written on behalf of other flows.
    pub response_writes: Vec<FlowResponse>,
    /// Extra processing wake-ups, e.g. delayed states.
    pub processing_requests: Vec<FlowProcessingRequest>,
    /// Knowledge-base updates collected by interrogation states.
    pub knowledge_base_updates: Vec<(ClientId, KnowledgeBase)>,
    /// VFS path records collected by filesystem states.
    pub path_info_writes: Vec<PathInfo>,
    /// States queued for inline re-entry on the same worker.
    pub inline_states: Vec<String>,
}

// ============================================================================
// SECTION: Flow Context
// ============================================================================

/// Context handed to state callbacks.
///
/// All side effects requested through the context are buffered in
/// [`StepOutputs`] and persisted atomically by the engine; nothing is written
/// while the callback runs.
pub struct FlowContext<'a> {
    /// The flow row being processed; state blob and counters are mutable.
    flow: &'a mut Flow,
    /// Arguments the flow was created with.
    args: Payload,
    /// Current time supplied by the engine.
    now: Timestamp,
    /// Identifier source for requests, messages, and child flows.
    ids: &'a dyn IdGenerator,
    /// Registry for child-flow creation.
    registry: &'a FlowRegistry,
    /// Buffered outputs.
    outputs: &'a mut StepOutputs,
}

impl<'a> FlowContext<'a> {
    /// Creates a context for one callback invocation.
    pub(crate) fn new(
        flow: &'a mut Flow,
        now: Timestamp,
        ids: &'a dyn IdGenerator,
        registry: &'a FlowRegistry,
        outputs: &'a mut StepOutputs,
    ) -> Self {
        let args = flow.args.clone();
        Self { flow, args, now, ids, registry, outputs }
    }

    /// Returns the client the flow runs on.
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.flow.client_id
    }

    /// Returns the flow identifier.
    #[must_use]
    pub fn flow_id(&self) -> FlowId {
        self.flow.flow_id
    }

    /// Returns the current time.
    #[must_use]
    pub const fn now(&self) -> Timestamp {
        self.now
    }

    /// Returns the arguments the flow was created with.
    #[must_use]
    pub const fn args(&self) -> &Payload {
        &self.args
    }

    /// Reads the typed per-flow state blob.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::State`] when the blob does not decode as `T`.
    pub fn get_state<T: DeserializeOwned>(&self) -> Result<Option<T>, FlowError> {
        if self.flow.persistent_state.is_null() {
            return Ok(None);
        }
        serde_json::from_value(self.flow.persistent_state.clone())
            .map(Some)
            .map_err(|err| FlowError::State(err.to_string()))
    }

    /// Replaces the typed per-flow state blob.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::State`] when `T` fails to serialize.
    pub fn set_state<T: Serialize>(&mut self, state: &T) -> Result<(), FlowError> {
        self.flow.persistent_state =
            serde_json::to_value(state).map_err(|err| FlowError::State(err.to_string()))?;
        Ok(())
    }

    /// Issues an action request to the agent, to be answered in `next_state`.
    ///
    /// The outbound message inherits the flow's remaining CPU and network
    /// budget.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError`] when request construction fails.
    pub fn call_client(
        &mut self,
        action: &str,
        args: Payload,
        next_state: &str,
    ) -> Result<RequestId, FlowError> {
        let request_id = self.flow.next_outbound_id;
        self.flow.next_outbound_id = request_id.next();

        let session_id = SessionId::for_flow(self.flow.client_id, self.flow.flow_id).to_string();
        let cpu_limit_seconds = if self.flow.cpu_limit_seconds > 0.0 {
            (self.flow.cpu_limit_seconds - self.flow.cpu_time_used).max(0.0)
        } else {
            0.0
        };
        let network_bytes_limit = if self.flow.network_bytes_limit > 0 {
            self.flow.network_bytes_limit.saturating_sub(self.flow.network_bytes_sent)
        } else {
            0
        };

        self.outputs.new_requests.push(FlowRequest {
            client_id: self.flow.client_id,
            flow_id: self.flow.flow_id,
            request_id,
            action: Some(action.to_string()),
            args: args.clone(),
            next_state: next_state.to_string(),
            needs_processing: false,
            responses_expected: None,
            created_at: self.now,
        });
        self.outputs.new_messages.push(ClientMessage {
            client_id: self.flow.client_id,
            message_id: MessageId::from_raw(self.ids.next_id()),
            session_id,
            flow_id: self.flow.flow_id,
            request_id,
            action: action.to_string(),
            args,
            cpu_limit_seconds,
            network_bytes_limit,
            require_fastpoll: false,
            lease_owner: None,
            lease_deadline: None,
            lease_count: 0,
            created_at: self.now,
        });
        Ok(request_id)
    }

    /// Starts a child flow whose completion is reported into `next_state`.
    ///
    /// The child's start state runs inline; its outputs are buffered together
    /// with this callback's outputs.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::UnknownClass`] for unregistered classes and any
    /// error raised by the child's start state.
    pub fn call_flow(
        &mut self,
        flow_name: &str,
        args: Payload,
        next_state: &str,
    ) -> Result<FlowId, FlowError> {
        let request_id = self.flow.next_outbound_id;
        self.flow.next_outbound_id = request_id.next();
        self.outputs.new_requests.push(FlowRequest {
            client_id: self.flow.client_id,
            flow_id: self.flow.flow_id,
            request_id,
            action: None,
            args: Payload::Empty,
            next_state: next_state.to_string(),
            needs_processing: false,
            responses_expected: Some(1),
            created_at: self.now,
        });

        let child_id = FlowId::from_raw(self.ids.next_id());
        let child = Flow {
            client_id: self.flow.client_id,
            flow_id: child_id,
            parent_flow_id: Some(self.flow.flow_id),
            parent_request_id: Some(request_id),
            parent_hunt_id: self.flow.parent_hunt_id,
            flow_name: flow_name.into(),
            args,
            creator: self.flow.creator.clone(),
            created_at: self.now,
            updated_at: self.now,
            state: crate::core::flow::FlowState::Running,
            persistent_state: serde_json::Value::Null,
            cpu_time_used: 0.0,
            network_bytes_sent: 0,
            cpu_limit_seconds: self.flow.cpu_limit_seconds,
            network_bytes_limit: self.flow.network_bytes_limit,
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
        build_flow_start(self.registry, self.ids, self.now, child, self.outputs)?;
        Ok(child_id)
    }

    /// Queues a state for inline re-entry on the same worker, with empty
    /// responses.
    pub fn call_state_inline(&mut self, next_state: &str) {
        self.outputs.inline_states.push(next_state.to_string());
    }

    /// Schedules a state to run after a delay, via the processing queue.
    pub fn call_state_delayed(&mut self, next_state: &str, delay: DurationMicros) {
        let request_id = self.flow.next_outbound_id;
        self.flow.next_outbound_id = request_id.next();
        self.outputs.new_requests.push(FlowRequest {
            client_id: self.flow.client_id,
            flow_id: self.flow.flow_id,
            request_id,
            action: None,
            args: Payload::Empty,
            next_state: next_state.to_string(),
            needs_processing: true,
            responses_expected: Some(0),
            created_at: self.now,
        });
        self.outputs.processing_requests.push(FlowProcessingRequest {
            client_id: self.flow.client_id,
            flow_id: self.flow.flow_id,
            written_at: self.now,
            delivery_time: Some(self.now.saturating_add(delay)),
        });
    }

    /// Persists a typed result for API consumption.
    pub fn send_reply(&mut self, payload: Payload) {
        self.flow.result_count = self.flow.result_count.saturating_add(1);
        self.outputs.new_results.push(FlowResult {
            client_id: self.flow.client_id,
            flow_id: self.flow.flow_id,
            hunt_id: self.flow.parent_hunt_id,
            payload,
            timestamp: self.now,
        });
    }

    /// Records a knowledge-base update for the flow's client.
    pub fn update_knowledge_base(&mut self, knowledge_base: KnowledgeBase) {
        self.outputs.knowledge_base_updates.push((self.flow.client_id, knowledge_base));
    }

    /// Records a collected VFS path for the flow's client.
    pub fn record_path_info(&mut self, path_info: PathInfo) {
        self.outputs.path_info_writes.push(path_info);
    }
}

// ============================================================================
// SECTION: Flow Class Trait
// ============================================================================

/// A class of states expressing one investigation type.
pub trait FlowClass: Send + Sync {
    /// Returns the registered class name.
    fn name(&self) -> &'static str;

    /// Runs the start state, issuing the initial requests.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError`] to terminate the flow with an error.
    fn start(&self, ctx: &mut FlowContext<'_>) -> Result<(), FlowError>;

    /// Runs a named state with the responses that completed its request.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError`] to terminate the flow with an error.
    fn process(
        &self,
        ctx: &mut FlowContext<'_>,
        state: &str,
        responses: &[FlowResponse],
    ) -> Result<(), FlowError>;
}

// ============================================================================
// SECTION: Registry
// ============================================================================

/// Factory producing one flow class instance.
pub type FlowFactory = fn() -> Box<dyn FlowClass>;

/// Build-time registration table of flow classes.
pub struct FlowRegistry {
    /// Registered `(name, factory)` entries.
    entries: Vec<(&'static str, FlowFactory)>,
}

impl FlowRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Creates a registry with all built-in flow classes.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("ListProcesses", || Box::new(ListProcessesFlow));
        registry.register("StatFile", || Box::new(StatFileFlow));
        registry.register("GetClientStats", || Box::new(GetClientStatsFlow));
        registry.register("Interrogate", || Box::new(InterrogateFlow));
        registry.register("CollectAction", || Box::new(CollectActionFlow));
        registry.register("ExecuteBinary", || Box::new(ExecuteBinaryFlow));
        registry.register("UpdateAgent", || Box::new(UpdateAgentFlow));
        registry
    }

    /// Appends a flow class to the table. Later registrations win on name
    /// collision.
    pub fn register(&mut self, name: &'static str, factory: FlowFactory) {
        self.entries.push((name, factory));
    }

    /// Returns true when the class name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(entry, _)| *entry == name)
    }

    /// Instantiates a flow class by name.
    #[must_use]
    pub fn create(&self, name: &str) -> Option<Box<dyn FlowClass>> {
        self.entries.iter().rev().find(|(entry, _)| *entry == name).map(|(_, factory)| factory())
    }

    /// Returns the registered class names.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(name, _)| *name).collect()
    }

    /// Returns true when the class requires an admin caller.
    #[must_use]
    pub fn is_restricted(name: &str) -> bool {
        RESTRICTED_FLOW_NAMES.contains(&name)
    }
}

impl Default for FlowRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

// ============================================================================
// SECTION: Start Materialization
// ============================================================================

/// Runs a flow's start state and folds the materialized [`FlowStart`] into
/// the caller's outputs.
///
/// When the start state issues no requests and starts no children, the flow
/// is finished immediately and, for child flows, the parent notification is
/// appended to `outputs.response_writes`.
///
/// # Errors
///
/// Returns [`FlowError`] raised by the start state or when the class is not
/// registered.
pub fn build_flow_start(
    registry: &FlowRegistry,
    ids: &dyn IdGenerator,
    now: Timestamp,
    mut flow: Flow,
    outputs: &mut StepOutputs,
) -> Result<(), FlowError> {
    let class = registry
        .create(flow.flow_name.as_str())
        .ok_or_else(|| FlowError::UnknownClass(flow.flow_name.to_string()))?;

    let mut start_outputs = StepOutputs::default();
    {
        let mut ctx = FlowContext::new(&mut flow, now, ids, registry, &mut start_outputs);
        class.start(&mut ctx)?;
    }

    let no_work = start_outputs.new_requests.is_empty() && start_outputs.child_starts.is_empty();
    if no_work {
        flow.state = crate::core::flow::FlowState::Finished;
        if let (Some(parent_flow_id), Some(parent_request_id)) =
            (flow.parent_flow_id, flow.parent_request_id)
        {
            outputs.response_writes.push(FlowResponse {
                client_id: flow.client_id,
                flow_id: parent_flow_id,
                request_id: parent_request_id,
                response_id: crate::core::identifiers::ResponseId::from_raw(1),
                body: ResponseBody::Status(Status::ok(Default::default(), 0)),
                received_at: now,
            });
        }
    }

    outputs.response_writes.append(&mut start_outputs.response_writes);
    outputs.processing_requests.append(&mut start_outputs.processing_requests);
    outputs.knowledge_base_updates.append(&mut start_outputs.knowledge_base_updates);
    outputs.path_info_writes.append(&mut start_outputs.path_info_writes);
    outputs.child_starts.append(&mut start_outputs.child_starts);
    outputs.child_starts.push(FlowStart {
        flow,
        requests: start_outputs.new_requests,
        messages: start_outputs.new_messages,
        results: start_outputs.new_results,
    });
    Ok(())
}

// ============================================================================
// SECTION: Response Helpers
// ============================================================================

/// Returns the message payloads within a response slice, in order.
#[must_use]
pub fn message_payloads(responses: &[FlowResponse]) -> Vec<&Payload> {
    responses
        .iter()
        .filter_map(|response| match &response.body {
            ResponseBody::Message(payload) => Some(payload),
            ResponseBody::Status(_) | ResponseBody::Iterator(_) => None,
        })
        .collect()
}

/// Returns the terminal status within a response slice, when present.
#[must_use]
pub fn terminal_status(responses: &[FlowResponse]) -> Option<&Status> {
    responses.iter().rev().find_map(|response| response.body.as_status())
}

/// Fails the callback when the request's terminal status is not ok.
///
/// # Errors
///
/// Returns [`FlowError::ActionFailed`] carrying the agent's error message.
pub fn require_ok(responses: &[FlowResponse]) -> Result<(), FlowError> {
    match terminal_status(responses) {
        Some(status) if status.kind.is_ok() => Ok(()),
        Some(status) => Err(FlowError::ActionFailed(
            status.error_message.clone().unwrap_or_else(|| format!("{:?}", status.kind)),
        )),
        None => Ok(()),
    }
}

// ============================================================================
// SECTION: Built-In Flows
// ============================================================================

/// Single-step process listing.
struct ListProcessesFlow;

impl FlowClass for ListProcessesFlow {
    fn name(&self) -> &'static str {
        "ListProcesses"
    }

    fn start(&self, ctx: &mut FlowContext<'_>) -> Result<(), FlowError> {
        ctx.call_client(ACTION_LIST_PROCESSES, Payload::Empty, "Listing")?;
        Ok(())
    }

    fn process(
        &self,
        ctx: &mut FlowContext<'_>,
        state: &str,
        responses: &[FlowResponse],
    ) -> Result<(), FlowError> {
        match state {
            "Listing" => {
                require_ok(responses)?;
                for payload in message_payloads(responses) {
                    ctx.send_reply(payload.clone());
                }
                Ok(())
            }
            other => Err(FlowError::UnknownState(other.to_string())),
        }
    }
}

/// Single-step path stat collection; also materializes VFS path rows.
struct StatFileFlow;

impl FlowClass for StatFileFlow {
    fn name(&self) -> &'static str {
        "StatFile"
    }

    fn start(&self, ctx: &mut FlowContext<'_>) -> Result<(), FlowError> {
        let args = match ctx.args() {
            Payload::StatFileArgs(args) => Payload::StatFileArgs(args.clone()),
            other => {
                return Err(FlowError::BadArgs(format!(
                    "StatFile expects StatFileArgs, got {}",
                    other.type_name()
                )));
            }
        };
        ctx.call_client(ACTION_STAT_FILE, args, "Stat")?;
        Ok(())
    }

    fn process(
        &self,
        ctx: &mut FlowContext<'_>,
        state: &str,
        responses: &[FlowResponse],
    ) -> Result<(), FlowError> {
        match state {
            "Stat" => {
                require_ok(responses)?;
                let now = ctx.now();
                let client_id = ctx.client_id();
                for payload in message_payloads(responses) {
                    if let Payload::StatEntry(entry) = payload {
                        ctx.record_path_info(PathInfo {
                            client_id,
                            path: entry.path.clone(),
                            size: entry.size,
                            mode: entry.mode,
                            mtime: entry.mtime,
                            content_hash: entry.content_hash.clone(),
                            collected_at: now,
                        });
                    }
                    ctx.send_reply(payload.clone());
                }
                Ok(())
            }
            other => Err(FlowError::UnknownState(other.to_string())),
        }
    }
}

/// Single-step agent statistics collection.
struct GetClientStatsFlow;

impl FlowClass for GetClientStatsFlow {
    fn name(&self) -> &'static str {
        "GetClientStats"
    }

    fn start(&self, ctx: &mut FlowContext<'_>) -> Result<(), FlowError> {
        ctx.call_client(ACTION_GET_CLIENT_STATS, Payload::Empty, "Stats")?;
        Ok(())
    }

    fn process(
        &self,
        ctx: &mut FlowContext<'_>,
        state: &str,
        responses: &[FlowResponse],
    ) -> Result<(), FlowError> {
        match state {
            "Stats" => {
                require_ok(responses)?;
                for payload in message_payloads(responses) {
                    ctx.send_reply(payload.clone());
                }
                Ok(())
            }
            other => Err(FlowError::UnknownState(other.to_string())),
        }
    }
}

/// Two-step interrogation: platform facts, then runtime statistics.
struct InterrogateFlow;

impl FlowClass for InterrogateFlow {
    fn name(&self) -> &'static str {
        "Interrogate"
    }

    fn start(&self, ctx: &mut FlowContext<'_>) -> Result<(), FlowError> {
        ctx.call_client(ACTION_GET_PLATFORM_INFO, Payload::Empty, "PlatformInfo")?;
        Ok(())
    }

    fn process(
        &self,
        ctx: &mut FlowContext<'_>,
        state: &str,
        responses: &[FlowResponse],
    ) -> Result<(), FlowError> {
        match state {
            "PlatformInfo" => {
                require_ok(responses)?;
                for payload in message_payloads(responses) {
                    if let Payload::PlatformInfo(info) = payload {
                        ctx.update_knowledge_base(info.knowledge_base.clone());
                        ctx.send_reply(payload.clone());
                    }
                }
                ctx.call_client(ACTION_GET_CLIENT_STATS, Payload::Empty, "Stats")?;
                Ok(())
            }
            "Stats" => {
                require_ok(responses)?;
                for payload in message_payloads(responses) {
                    ctx.send_reply(payload.clone());
                }
                Ok(())
            }
            other => Err(FlowError::UnknownState(other.to_string())),
        }
    }
}

/// Generic single-action collection flow used by hunts and tests.
struct CollectActionFlow;

impl FlowClass for CollectActionFlow {
    fn name(&self) -> &'static str {
        "CollectAction"
    }

    fn start(&self, ctx: &mut FlowContext<'_>) -> Result<(), FlowError> {
        let (action, args) = match ctx.args() {
            Payload::CollectActionArgs(collect) => {
                (collect.action.clone(), (*collect.args).clone())
            }
            other => {
                return Err(FlowError::BadArgs(format!(
                    "CollectAction expects CollectActionArgs, got {}",
                    other.type_name()
                )));
            }
        };
        ctx.call_client(&action, args, "Collect")?;
        Ok(())
    }

    fn process(
        &self,
        ctx: &mut FlowContext<'_>,
        state: &str,
        responses: &[FlowResponse],
    ) -> Result<(), FlowError> {
        match state {
            "Collect" => {
                require_ok(responses)?;
                for payload in message_payloads(responses) {
                    ctx.send_reply(payload.clone());
                }
                Ok(())
            }
            other => Err(FlowError::UnknownState(other.to_string())),
        }
    }
}

/// Restricted flow launching a signed binary on the agent.
struct ExecuteBinaryFlow;

impl FlowClass for ExecuteBinaryFlow {
    fn name(&self) -> &'static str {
        "ExecuteBinary"
    }

    fn start(&self, ctx: &mut FlowContext<'_>) -> Result<(), FlowError> {
        let args = match ctx.args() {
            Payload::ExecuteBinaryArgs(args) => Payload::ExecuteBinaryArgs(args.clone()),
            other => {
                return Err(FlowError::BadArgs(format!(
                    "ExecuteBinary expects ExecuteBinaryArgs, got {}",
                    other.type_name()
                )));
            }
        };
        ctx.call_client(ACTION_EXECUTE_BINARY, args, "Execution")?;
        Ok(())
    }

    fn process(
        &self,
        ctx: &mut FlowContext<'_>,
        state: &str,
        responses: &[FlowResponse],
    ) -> Result<(), FlowError> {
        match state {
            "Execution" => {
                require_ok(responses)?;
                for payload in message_payloads(responses) {
                    ctx.send_reply(payload.clone());
                }
                Ok(())
            }
            other => Err(FlowError::UnknownState(other.to_string())),
        }
    }
}

/// Restricted flow updating the agent software from a signed binary.
struct UpdateAgentFlow;

impl FlowClass for UpdateAgentFlow {
    fn name(&self) -> &'static str {
        "UpdateAgent"
    }

    fn start(&self, ctx: &mut FlowContext<'_>) -> Result<(), FlowError> {
        let args = match ctx.args() {
            Payload::ExecuteBinaryArgs(args) => Payload::ExecuteBinaryArgs(args.clone()),
            other => {
                return Err(FlowError::BadArgs(format!(
                    "UpdateAgent expects ExecuteBinaryArgs, got {}",
                    other.type_name()
                )));
            }
        };
        ctx.call_client(ACTION_UPDATE_AGENT, args, "Update")?;
        Ok(())
    }

    fn process(
        &self,
        ctx: &mut FlowContext<'_>,
        state: &str,
        responses: &[FlowResponse],
    ) -> Result<(), FlowError> {
        match state {
            "Update" => {
                require_ok(responses)?;
                Ok(())
            }
            other => Err(FlowError::UnknownState(other.to_string())),
        }
    }
}
