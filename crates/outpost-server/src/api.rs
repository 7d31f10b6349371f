// outpost-server/src/api.rs
// ============================================================================
// Module: API Surface
// Description: Typed REST endpoints over clients, flows, hunts, approvals.
// Purpose: Expose the subsystems behind authentication and approval checks.
// Dependencies: axum, outpost-core, serde
// ============================================================================

//! ## Overview
//! Every handler resolves the caller identity from its bearer token, runs
//! the approval predicate for client- or hunt-scoped subjects, invokes the
//! underlying subsystem, and serializes a typed response. Pagination is
//! `(offset, count)` with a configured hard maximum. Errors carry
//! `{code, message, subject?}` and map onto conventional HTTP statuses.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde::Serialize;

use outpost_core::Approval;
use outpost_core::ApprovalId;
use outpost_core::ApprovalType;
use outpost_core::BinaryKind;
use outpost_core::BlobId;
use outpost_core::BlobStore;
use outpost_core::Client;
use outpost_core::ClientId;
use outpost_core::ClientLabel;
use outpost_core::ClientRuleSet;
use outpost_core::Clock;
use outpost_core::CreateHuntRequest;
use outpost_core::DataStore;
use outpost_core::Flow;
use outpost_core::FlowId;
use outpost_core::FlowResult;
use outpost_core::Hunt;
use outpost_core::HuntId;
use outpost_core::PathInfo;
use outpost_core::Payload;
use outpost_core::SignedBinaryId;
use outpost_core::SignedBinaryReferences;
use outpost_core::SignedBlobReference;
use outpost_core::StartFlowRequest;
use outpost_core::StoreError;
use outpost_core::Timestamp;
use outpost_core::Username;
use outpost_core::runtime::ApprovalError;
use outpost_core::runtime::EngineError;
use outpost_core::runtime::FlowError;
use outpost_core::runtime::HuntError;
use outpost_core::runtime::read_file_bytes;

use crate::audit::AuditEvent;
use crate::audit::AuditOutcome;
use crate::auth::AuthError;
use crate::auth::CurrentUser;
use crate::server::ServerState;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// API error payload: `{code, message, subject?}`.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Subject the error is about, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

/// API error with its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Error body.
    pub body: ApiErrorBody,
}

impl ApiError {
    /// Builds an error from parts.
    #[must_use]
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ApiErrorBody { code: code.to_string(), message: message.into(), subject: None },
        }
    }

    /// Attaches the subject identifier.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.body.subject = Some(subject.into());
        self
    }

    /// Bad-request helper.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthenticated", error.to_string())
    }
}

impl From<ApprovalError> for ApiError {
    fn from(error: ApprovalError) -> Self {
        match error {
            ApprovalError::Unauthorized { ref subject, .. } => {
                let subject = subject.clone();
                Self::new(StatusCode::FORBIDDEN, "unauthorized", error.to_string())
                    .with_subject(subject)
            }
            ApprovalError::Store(store) => store.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match &error {
            StoreError::UnknownClient(_)
            | StoreError::UnknownFlow { .. }
            | StoreError::UnknownApproval(_)
            | StoreError::UnknownHunt(_)
            | StoreError::UnknownBlob(_)
            | StoreError::UnknownBinary(_)
            | StoreError::AtLeastOneUnknownPath(_) => {
                Self::new(StatusCode::NOT_FOUND, "not_found", error.to_string())
            }
            StoreError::DuplicateKey(_) => {
                Self::new(StatusCode::CONFLICT, "duplicate", error.to_string())
            }
            StoreError::OversizedRead { .. } => {
                Self::new(StatusCode::PAYLOAD_TOO_LARGE, "oversized_read", error.to_string())
            }
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage", error.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Store(store) => store.into(),
            EngineError::UnknownFlowClass(name) => {
                Self::bad_request(format!("unknown flow class: {name}"))
            }
            EngineError::StartFailed(FlowError::BadArgs(message)) => Self::bad_request(message),
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "engine", other.to_string()),
        }
    }
}

impl From<HuntError> for ApiError {
    fn from(error: HuntError) -> Self {
        match error {
            HuntError::Store(store) => store.into(),
            HuntError::Engine(engine) => engine.into(),
            HuntError::InvalidHunt(message) => Self::bad_request(message),
            HuntError::InvalidTransition(message) => {
                Self::new(StatusCode::CONFLICT, "invalid_transition", message)
            }
        }
    }
}

// ============================================================================
// SECTION: Common Extractors
// ============================================================================

/// Pagination query parameters.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Paging {
    /// Row offset.
    #[serde(default)]
    pub offset: u64,
    /// Row count; clamped to the configured maximum.
    #[serde(default = "default_page_count")]
    pub count: u64,
}

/// Returns the default page size.
const fn default_page_count() -> u64 {
    50
}

impl Paging {
    /// Clamps the count to the configured hard maximum.
    #[must_use]
    pub fn clamped(self, max_page_size: u64) -> Self {
        Self { offset: self.offset, count: self.count.min(max_page_size) }
    }
}

/// Resolves the caller from request headers.
fn current_user(state: &ServerState, headers: &HeaderMap) -> Result<CurrentUser, ApiError> {
    let header = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok());
    Ok(state.auth.authenticate(header)?)
}

/// Emits one audit record for an API call.
fn audit(
    state: &ServerState,
    user: Option<&CurrentUser>,
    action: &str,
    subject: Option<String>,
    outcome: AuditOutcome,
) {
    state.audit.record(&AuditEvent {
        timestamp: state.clock.now(),
        username: user.map(|user| user.username.to_string()),
        action: action.to_string(),
        subject,
        outcome,
        detail: None,
    });
}

// ============================================================================
// SECTION: Client DTOs
// ============================================================================

/// Client summary shown without an approval.
#[derive(Debug, Serialize)]
pub struct ClientSummary {
    /// Client identifier.
    pub client_id: ClientId,
    /// Operating system, when interrogated.
    pub os: String,
    /// Fully qualified domain name, when interrogated.
    pub fqdn: String,
    /// Last poll time.
    pub last_ping: Timestamp,
    /// Attached labels.
    pub labels: Vec<ClientLabel>,
}

impl From<&Client> for ClientSummary {
    fn from(client: &Client) -> Self {
        Self {
            client_id: client.client_id,
            os: client.knowledge_base.os.clone(),
            fqdn: client.knowledge_base.fqdn.clone(),
            last_ping: client.last_ping,
            labels: client.labels.clone(),
        }
    }
}

/// Keyword search query.
#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    /// Keyword to look up in the client index.
    pub keyword: String,
}

/// Label mutation body.
#[derive(Debug, Deserialize)]
pub struct LabelsBody {
    /// Labels to add.
    #[serde(default)]
    pub add: Vec<String>,
    /// Labels to remove.
    #[serde(default)]
    pub remove: Vec<String>,
}

// ============================================================================
// SECTION: Client Handlers
// ============================================================================

/// Lists client summaries.
async fn list_clients(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(paging): Query<Paging>,
) -> Result<Json<Vec<ClientSummary>>, ApiError> {
    current_user(&state, &headers)?;
    let paging = paging.clamped(state.api_config.max_page_size);
    let clients = state.store.list_clients(paging.offset, paging.count)?;
    Ok(Json(clients.iter().map(ClientSummary::from).collect()))
}

/// Searches clients by indexed keyword.
async fn search_clients(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<ClientSummary>>, ApiError> {
    current_user(&state, &headers)?;
    let ids = state.store.query_client_keywords(&query.keyword)?;
    let clients = state.store.multi_read_clients(&ids)?;
    Ok(Json(clients.iter().map(ClientSummary::from).collect()))
}

/// Reads full client info. Requires a client approval.
async fn get_client(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(client_id): Path<ClientId>,
) -> Result<Json<Client>, ApiError> {
    let user = current_user(&state, &headers)?;
    if let Err(err) = state.approvals.check_client_access(&user.username, client_id) {
        audit(&state, Some(&user), "clients.get", Some(client_id.to_string()), AuditOutcome::Denied);
        return Err(err.into());
    }
    let client = state.store.read_client(client_id)?;
    audit(&state, Some(&user), "clients.get", Some(client_id.to_string()), AuditOutcome::Allowed);
    Ok(Json(client))
}

/// Adds and removes client labels. Requires a client approval.
async fn modify_labels(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(client_id): Path<ClientId>,
    Json(body): Json<LabelsBody>,
) -> Result<Json<Vec<ClientLabel>>, ApiError> {
    let user = current_user(&state, &headers)?;
    state.approvals.check_client_access(&user.username, client_id)?;
    let to_label = |name: &String| ClientLabel { owner: user.username.clone(), name: name.clone() };
    let add: Vec<ClientLabel> = body.add.iter().map(to_label).collect();
    let remove: Vec<ClientLabel> = body.remove.iter().map(to_label).collect();
    if !add.is_empty() {
        state.store.add_client_labels(client_id, &add)?;
    }
    if !remove.is_empty() {
        state.store.remove_client_labels(client_id, &remove)?;
    }
    audit(&state, Some(&user), "clients.labels", Some(client_id.to_string()), AuditOutcome::Allowed);
    Ok(Json(state.store.read_client_labels(client_id)?))
}

/// Lists collected VFS paths for a client. Requires a client approval.
async fn list_vfs(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(client_id): Path<ClientId>,
    Query(query): Query<VfsQuery>,
) -> Result<Json<Vec<PathInfo>>, ApiError> {
    let user = current_user(&state, &headers)?;
    state.approvals.check_client_access(&user.username, client_id)?;
    let paths = state.store.list_path_infos(client_id, &query.prefix)?;
    Ok(Json(paths))
}

/// VFS listing query.
#[derive(Debug, Deserialize)]
pub struct VfsQuery {
    /// Path prefix to list under.
    #[serde(default)]
    pub prefix: String,
}

// ============================================================================
// SECTION: Flow DTOs
// ============================================================================

/// Flow creation body.
#[derive(Debug, Deserialize)]
pub struct StartFlowBody {
    /// Registered flow class name.
    pub flow_name: String,
    /// Flow class arguments.
    #[serde(default = "default_flow_args")]
    pub args: Payload,
    /// CPU budget in seconds; zero or absent means the server default.
    #[serde(default)]
    pub cpu_limit_seconds: Option<f64>,
    /// Network budget in bytes; zero or absent means the server default.
    #[serde(default)]
    pub network_bytes_limit: Option<u64>,
}

/// Returns the default (empty) flow arguments.
const fn default_flow_args() -> Payload {
    Payload::Empty
}

/// Flow cancellation body.
#[derive(Debug, Deserialize)]
pub struct CancelFlowBody {
    /// Operator-visible cancellation reason.
    #[serde(default = "default_cancel_reason")]
    pub reason: String,
}

/// Returns the default cancellation reason.
fn default_cancel_reason() -> String {
    "cancelled by operator".to_string()
}

// ============================================================================
// SECTION: Flow Handlers
// ============================================================================

/// Starts a flow on a client. Requires a client approval; restricted flow
/// classes additionally require an admin caller.
async fn start_flow(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(client_id): Path<ClientId>,
    Json(body): Json<StartFlowBody>,
) -> Result<Json<Flow>, ApiError> {
    let user = current_user(&state, &headers)?;
    if let Err(err) = state
        .approvals
        .check_client_access(&user.username, client_id)
        .and_then(|()| state.approvals.check_flow_restrictions(&user.username, &body.flow_name))
    {
        audit(&state, Some(&user), "flows.start", Some(client_id.to_string()), AuditOutcome::Denied);
        return Err(err.into());
    }
    let flow = state.engine.start_flow(StartFlowRequest {
        client_id,
        flow_name: body.flow_name.into(),
        args: body.args,
        creator: user.username.clone(),
        cpu_limit_seconds: body.cpu_limit_seconds.unwrap_or(state.default_cpu_limit_seconds),
        network_bytes_limit: body
            .network_bytes_limit
            .unwrap_or(state.default_network_bytes_limit),
        flow_id: None,
        parent_hunt_id: None,
    })?;
    audit(&state, Some(&user), "flows.start", Some(flow.long_id()), AuditOutcome::Allowed);
    Ok(Json(flow))
}

/// Lists flows on a client. Requires a client approval.
async fn list_flows(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(client_id): Path<ClientId>,
    Query(paging): Query<Paging>,
) -> Result<Json<Vec<Flow>>, ApiError> {
    let user = current_user(&state, &headers)?;
    state.approvals.check_client_access(&user.username, client_id)?;
    let paging = paging.clamped(state.api_config.max_page_size);
    Ok(Json(state.store.list_flows(client_id, paging.offset, paging.count)?))
}

/// Reads one flow. Requires a client approval.
async fn get_flow(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path((client_id, flow_id)): Path<(ClientId, FlowId)>,
) -> Result<Json<Flow>, ApiError> {
    let user = current_user(&state, &headers)?;
    state.approvals.check_client_access(&user.username, client_id)?;
    Ok(Json(state.store.read_flow(client_id, flow_id)?))
}

/// Requests cooperative flow cancellation. Requires a client approval.
async fn cancel_flow(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path((client_id, flow_id)): Path<(ClientId, FlowId)>,
    Json(body): Json<CancelFlowBody>,
) -> Result<StatusCode, ApiError> {
    let user = current_user(&state, &headers)?;
    state.approvals.check_client_access(&user.username, client_id)?;
    state.engine.cancel_flow(client_id, flow_id, &body.reason)?;
    audit(
        &state,
        Some(&user),
        "flows.cancel",
        Some(format!("{client_id}/{flow_id}")),
        AuditOutcome::Allowed,
    );
    Ok(StatusCode::ACCEPTED)
}

/// Lists flow results. Requires a client approval.
async fn list_flow_results(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path((client_id, flow_id)): Path<(ClientId, FlowId)>,
    Query(paging): Query<Paging>,
) -> Result<Json<Vec<FlowResult>>, ApiError> {
    let user = current_user(&state, &headers)?;
    state.approvals.check_client_access(&user.username, client_id)?;
    let paging = paging.clamped(state.api_config.max_page_size);
    Ok(Json(state.store.read_flow_results(client_id, flow_id, paging.offset, paging.count)?))
}

// ============================================================================
// SECTION: Approval DTOs and Handlers
// ============================================================================

/// Approval creation body.
#[derive(Debug, Deserialize)]
pub struct CreateApprovalBody {
    /// Kind of subject covered.
    pub approval_type: ApprovalType,
    /// Subject identifier in canonical string form.
    pub subject_id: String,
    /// Reason text.
    pub reason: String,
    /// Users notified of the request.
    #[serde(default)]
    pub notified_users: Vec<String>,
    /// Additional email addresses cc'd.
    #[serde(default)]
    pub email_cc: Vec<String>,
}

/// Approval listing query.
#[derive(Debug, Deserialize)]
pub struct ApprovalListQuery {
    /// Kind of subject to list.
    pub approval_type: ApprovalType,
    /// Restrict to one subject.
    #[serde(default)]
    pub subject_id: Option<String>,
    /// Include expired approvals.
    #[serde(default)]
    pub include_expired: bool,
}

/// Creates an approval request by the caller.
async fn create_approval(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<CreateApprovalBody>,
) -> Result<Json<Approval>, ApiError> {
    let user = current_user(&state, &headers)?;
    let approval = state.approvals.request_approval(
        user.username.clone(),
        body.approval_type,
        body.subject_id,
        body.reason,
        body.notified_users.into_iter().map(Username::new).collect(),
        body.email_cc,
    )?;
    audit(
        &state,
        Some(&user),
        "approvals.create",
        Some(approval.subject_id.clone()),
        AuditOutcome::Allowed,
    );
    Ok(Json(approval))
}

/// Lists the caller's approvals.
async fn list_approvals(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(query): Query<ApprovalListQuery>,
) -> Result<Json<Vec<Approval>>, ApiError> {
    let user = current_user(&state, &headers)?;
    let approvals = state.store.read_approvals(
        &user.username,
        query.approval_type,
        query.subject_id.as_deref(),
        query.include_expired,
        state.clock.now(),
    )?;
    Ok(Json(approvals))
}

/// Grants another user's approval as the caller.
async fn grant_approval(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path((requestor, approval_id)): Path<(String, ApprovalId)>,
) -> Result<Json<Approval>, ApiError> {
    let user = current_user(&state, &headers)?;
    let requestor = Username::new(requestor);
    state.approvals.grant_approval(&requestor, approval_id, user.username.clone())?;
    audit(
        &state,
        Some(&user),
        "approvals.grant",
        Some(approval_id.to_string()),
        AuditOutcome::Allowed,
    );
    Ok(Json(state.store.read_approval(&requestor, approval_id)?))
}

// ============================================================================
// SECTION: Hunt DTOs and Handlers
// ============================================================================

/// Hunt creation body.
#[derive(Debug, Deserialize)]
pub struct CreateHuntBody {
    /// Operator description.
    pub description: String,
    /// Flow class dispatched to each matching client.
    pub flow_name: String,
    /// Flow class arguments template.
    #[serde(default = "default_flow_args")]
    pub flow_args: Payload,
    /// Client targeting rules.
    #[serde(default)]
    pub client_rule_set: ClientRuleSet,
    /// Maximum dispatches per minute; zero disables throttling.
    #[serde(default)]
    pub client_rate: u32,
    /// Maximum total clients.
    pub client_limit: u64,
    /// Maximum crashed clients before the hunt stops.
    #[serde(default)]
    pub crash_limit: u64,
    /// Maximum average CPU seconds per client.
    #[serde(default)]
    pub avg_cpu_seconds_per_client_limit: f64,
    /// Maximum average network bytes per client.
    #[serde(default)]
    pub avg_network_bytes_per_client_limit: u64,
    /// Maximum average results per client.
    #[serde(default)]
    pub avg_results_per_client_limit: u64,
}

/// Creates a hunt in the paused state.
async fn create_hunt(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<CreateHuntBody>,
) -> Result<Json<Hunt>, ApiError> {
    let user = current_user(&state, &headers)?;
    if let Err(err) = state.approvals.check_flow_restrictions(&user.username, &body.flow_name) {
        audit(&state, Some(&user), "hunts.create", None, AuditOutcome::Denied);
        return Err(err.into());
    }
    let hunt = state.dispatcher.create_hunt(CreateHuntRequest {
        creator: user.username.clone(),
        description: body.description,
        flow_name: body.flow_name.into(),
        flow_args: body.flow_args,
        client_rule_set: body.client_rule_set,
        client_rate: body.client_rate,
        client_limit: body.client_limit,
        crash_limit: body.crash_limit,
        avg_cpu_seconds_per_client_limit: body.avg_cpu_seconds_per_client_limit,
        avg_network_bytes_per_client_limit: body.avg_network_bytes_per_client_limit,
        avg_results_per_client_limit: body.avg_results_per_client_limit,
    })?;
    audit(&state, Some(&user), "hunts.create", Some(hunt.hunt_id.to_string()), AuditOutcome::Allowed);
    Ok(Json(hunt))
}

/// Lists hunts.
async fn list_hunts(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(paging): Query<Paging>,
) -> Result<Json<Vec<Hunt>>, ApiError> {
    current_user(&state, &headers)?;
    let paging = paging.clamped(state.api_config.max_page_size);
    Ok(Json(state.store.list_hunts(paging.offset, paging.count)?))
}

/// Reads one hunt.
async fn get_hunt(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(hunt_id): Path<HuntId>,
) -> Result<Json<Hunt>, ApiError> {
    current_user(&state, &headers)?;
    Ok(Json(state.store.read_hunt(hunt_id)?))
}

/// Starts a hunt. Requires a hunt approval.
async fn start_hunt(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(hunt_id): Path<HuntId>,
) -> Result<Json<Hunt>, ApiError> {
    let user = current_user(&state, &headers)?;
    if let Err(err) = state.approvals.check_hunt_access(&user.username, hunt_id) {
        audit(&state, Some(&user), "hunts.start", Some(hunt_id.to_string()), AuditOutcome::Denied);
        return Err(err.into());
    }
    state.dispatcher.start_hunt(hunt_id)?;
    audit(&state, Some(&user), "hunts.start", Some(hunt_id.to_string()), AuditOutcome::Allowed);
    Ok(Json(state.store.read_hunt(hunt_id)?))
}

/// Stops a hunt. Requires a hunt approval.
async fn stop_hunt(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(hunt_id): Path<HuntId>,
) -> Result<Json<Hunt>, ApiError> {
    let user = current_user(&state, &headers)?;
    state.approvals.check_hunt_access(&user.username, hunt_id)?;
    state.dispatcher.stop_hunt(hunt_id)?;
    audit(&state, Some(&user), "hunts.stop", Some(hunt_id.to_string()), AuditOutcome::Allowed);
    Ok(Json(state.store.read_hunt(hunt_id)?))
}

/// Pauses a hunt. Requires a hunt approval.
async fn pause_hunt(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(hunt_id): Path<HuntId>,
) -> Result<Json<Hunt>, ApiError> {
    let user = current_user(&state, &headers)?;
    state.approvals.check_hunt_access(&user.username, hunt_id)?;
    state.dispatcher.pause_hunt(hunt_id)?;
    Ok(Json(state.store.read_hunt(hunt_id)?))
}

/// Lists results across a hunt's child flows.
async fn list_hunt_results(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(hunt_id): Path<HuntId>,
    Query(paging): Query<Paging>,
) -> Result<Json<Vec<FlowResult>>, ApiError> {
    let user = current_user(&state, &headers)?;
    state.approvals.check_hunt_access(&user.username, hunt_id)?;
    let paging = paging.clamped(state.api_config.max_page_size);
    Ok(Json(state.store.read_hunt_results(hunt_id, paging.offset, paging.count)?))
}

/// Lists a hunt's child flows.
async fn list_hunt_flows(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(hunt_id): Path<HuntId>,
    Query(paging): Query<Paging>,
) -> Result<Json<Vec<Flow>>, ApiError> {
    let user = current_user(&state, &headers)?;
    state.approvals.check_hunt_access(&user.username, hunt_id)?;
    let paging = paging.clamped(state.api_config.max_page_size);
    Ok(Json(state.store.read_hunt_flows(hunt_id, paging.offset, paging.count)?))
}

// ============================================================================
// SECTION: File and Binary Handlers
// ============================================================================

/// File content query.
#[derive(Debug, Deserialize)]
pub struct FileQuery {
    /// Explicit byte length; required past the unbounded-read limit.
    #[serde(default)]
    pub length: Option<u64>,
}

/// Reads a collected file's bytes by content hash.
async fn get_file(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(file_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Vec<u8>, ApiError> {
    current_user(&state, &headers)?;
    let file_id: BlobId =
        file_id.parse().map_err(|_| ApiError::bad_request("malformed file hash"))?;
    let bytes = read_file_bytes(
        state.blobs.as_ref(),
        &file_id,
        state.api_config.unbounded_read_limit,
        query.length,
    )?;
    Ok(bytes)
}

/// Signed binary upload body. Content and signature travel base64-encoded.
#[derive(Debug, Deserialize)]
pub struct UploadBinaryBody {
    /// Binary kind.
    pub kind: BinaryKind,
    /// Store path.
    pub path: String,
    /// Base64 content.
    pub data: String,
    /// Base64 code signature over the content.
    pub signature: String,
}

/// Uploads a signed binary. Admin only.
async fn upload_binary(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<UploadBinaryBody>,
) -> Result<Json<SignedBinaryReferences>, ApiError> {
    let user = current_user(&state, &headers)?;
    if !user.user_type.is_admin() {
        audit(&state, Some(&user), "binaries.upload", Some(body.path), AuditOutcome::Denied);
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "unauthorized",
            "binary upload requires an admin caller",
        ));
    }
    let data = BASE64
        .decode(body.data.as_bytes())
        .map_err(|_| ApiError::bad_request("malformed base64 content"))?;
    let signature = BASE64
        .decode(body.signature.as_bytes())
        .map_err(|_| ApiError::bad_request("malformed base64 signature"))?;
    if let Some(verifier) = &state.signing_public_key {
        outpost_comms::verify_blob(verifier, &data, &signature).map_err(|_| {
            ApiError::bad_request("signature does not verify against the code-signing key")
        })?;
    }
    let blob_ids = state.blobs.write_blobs(std::slice::from_ref(&data))?;
    let blob_id = blob_ids
        .first()
        .copied()
        .ok_or_else(|| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage", "no blob id"))?;
    let references = SignedBinaryReferences {
        id: SignedBinaryId { binary_kind: body.kind, path: body.path },
        blobs: vec![SignedBlobReference { blob_id, size: data.len() as u64, signature }],
    };
    state.store.write_signed_binary_references(&references)?;
    audit(
        &state,
        Some(&user),
        "binaries.upload",
        Some(references.id.path.clone()),
        AuditOutcome::Allowed,
    );
    Ok(Json(references))
}

/// Lists signed binary ids.
async fn list_binaries(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<SignedBinaryId>>, ApiError> {
    current_user(&state, &headers)?;
    Ok(Json(state.store.read_ids_for_all_signed_binaries()?))
}

// ============================================================================
// SECTION: Router
// ============================================================================

/// Builds the `/api/v1` router.
pub fn api_router() -> Router<Arc<ServerState>> {
    Router::new()
        .route("/clients", get(list_clients))
        .route("/clients/search", get(search_clients))
        .route("/clients/{client_id}", get(get_client))
        .route("/clients/{client_id}/labels", post(modify_labels))
        .route("/clients/{client_id}/vfs", get(list_vfs))
        .route("/clients/{client_id}/flows", get(list_flows).post(start_flow))
        .route("/clients/{client_id}/flows/{flow_id}", get(get_flow))
        .route("/clients/{client_id}/flows/{flow_id}/cancel", post(cancel_flow))
        .route("/clients/{client_id}/flows/{flow_id}/results", get(list_flow_results))
        .route("/approvals", post(create_approval).get(list_approvals))
        .route("/approvals/{requestor}/{approval_id}/grant", post(grant_approval))
        .route("/hunts", post(create_hunt).get(list_hunts))
        .route("/hunts/{hunt_id}", get(get_hunt))
        .route("/hunts/{hunt_id}/start", post(start_hunt))
        .route("/hunts/{hunt_id}/stop", post(stop_hunt))
        .route("/hunts/{hunt_id}/pause", post(pause_hunt))
        .route("/hunts/{hunt_id}/results", get(list_hunt_results))
        .route("/hunts/{hunt_id}/flows", get(list_hunt_flows))
        .route("/files/{file_id}", get(get_file))
        .route("/binaries", post(upload_binary).get(list_binaries))
}
