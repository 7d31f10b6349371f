// outpost-server/tests/server.rs
// ============================================================================
// Module: Server Tests
// Description: Enrollment, poll handling, and the API approval gate.
// ============================================================================
//! ## Overview
//! Drives the server the way an agent and an operator do: enrollment over an
//! unknown cipher, authenticated polls with replay protection, and API calls
//! gated by approvals.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use axum::http::StatusCode;
use tower::ServiceExt;

use outpost_comms::Communicator;
use outpost_comms::PrivateKey;
use outpost_comms::StaticPeerKeys;
use outpost_config::OutpostConfig;
use outpost_core::AgentMessage;
use outpost_core::AuthState;
use outpost_core::DataStore;
use outpost_core::Payload;
use outpost_core::Priority;
use outpost_core::RequestId;
use outpost_core::ResponseBody;
use outpost_core::ResponseId;
use outpost_core::SessionId;
use outpost_core::Timestamp;
use outpost_core::payload::EnrollmentRequest;
use outpost_server::OutpostServer;
use outpost_server::PollError;
use outpost_server::ServerState;

/// Server fixture with its temp directory kept alive.
struct ServerFixture {
    /// Shared server state.
    state: Arc<ServerState>,
    /// Temp directory holding keys and config.
    _dir: tempfile::TempDir,
}

/// Builds a memory-backed server with three API users.
fn server_fixture() -> ServerFixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let key = PrivateKey::generate().expect("server key");
    let key_path = dir.path().join("server.key.pem");
    std::fs::write(&key_path, key.to_pem().expect("pem")).expect("write key");

    let config_text = format!(
        r#"
[server]
bind_addr = "127.0.0.1:0"
private_key_path = "{}"

[store]
backend = "memory"

[[auth.users]]
username = "alice"
token = "alice-token-0123456789"

[[auth.users]]
username = "bob"
token = "bob-token-0123456789ab"
user_type = "admin"

[[auth.users]]
username = "carol"
token = "carol-token-0123456789"
"#,
        key_path.display()
    );
    let config = OutpostConfig::parse(&config_text).expect("config");
    let server = OutpostServer::from_config(config).expect("build server");
    ServerFixture { state: server.state(), _dir: dir }
}

/// Agent fixture speaking the wire protocol.
struct AgentFixture {
    /// Agent communicator pinning the server key.
    communicator: Communicator,
    /// Agent public key PEM for enrollment requests.
    public_key_pem: String,
    /// Derived client id string.
    client_name: String,
}

/// Builds an agent with a fresh keypair pinned to the server.
fn agent_fixture(state: &ServerState) -> AgentFixture {
    let key = PrivateKey::generate().expect("agent key");
    let public_key_pem = key.public_key().to_pem().expect("pem");
    let client_name = key.public_key().client_id().expect("client id").to_string();
    let server_key =
        outpost_comms::PublicKey::from_pem(&state.server_public_key_pem).expect("server pem");
    let communicator = Communicator::new(
        client_name.clone(),
        key,
        Arc::new(StaticPeerKeys::new([("outpost-server".to_string(), server_key)])),
    );
    AgentFixture { communicator, public_key_pem, client_name }
}

/// Builds an enrollment message for the agent.
fn enrollment_message(agent: &AgentFixture) -> AgentMessage {
    AgentMessage {
        session_id: SessionId::well_known("enrollment"),
        request_id: RequestId::from_raw(0),
        response_id: ResponseId::from_raw(0),
        name: None,
        body: ResponseBody::Message(Payload::EnrollmentRequest(EnrollmentRequest {
            public_key_pem: agent.public_key_pem.clone(),
            startup_info: outpost_core::StartupInfo::default(),
        })),
        source: None,
        auth_state: AuthState::Authenticated,
        task_id: 0,
        cpu_limit_seconds: 0.0,
        network_bytes_limit: 0,
        require_fastpoll: false,
        priority: Priority::Medium,
    }
}

// ============================================================================
// SECTION: Enrollment
// ============================================================================

/// Tests the enrollment handshake: the server pins the key, creates the
/// client record, and the accept bundle already carries the interrogation
/// request.
#[test]
fn test_enrollment_creates_client_and_establishes_session() {
    let fixture = server_fixture();
    let agent = agent_fixture(&fixture.state);
    let nonce = Timestamp::from_micros(1_000_000);

    let bundle = agent
        .communicator
        .encode_bundle("outpost-server", &[enrollment_message(&agent)], nonce, nonce)
        .expect("encode enrollment");
    let reply =
        fixture.state.frontend.handle_poll(&bundle, "203.0.113.9").expect("enrollment poll");

    let client_id = agent.client_name.parse().expect("client id");
    let client = fixture.state.store.read_client(client_id).expect("client record");
    assert_eq!(client.public_key_pem, agent.public_key_pem);
    assert_eq!(client.last_ip, "203.0.113.9");

    // The accept bundle is decryptable, echoes the nonce, and carries the
    // interrogation request.
    let decoded = agent
        .communicator
        .decode_bundle(&reply, Some(nonce.as_micros()))
        .expect("decode accept");
    assert!(decoded.authenticated);
    assert_eq!(decoded.messages.len(), 1);
    assert_eq!(decoded.messages[0].name.as_deref(), Some("GetPlatformInfo"));

    // Subsequent polls use the established session.
    let next_nonce = Timestamp::from_micros(2_000_000);
    let poll = agent
        .communicator
        .encode_bundle("outpost-server", &[], next_nonce, next_nonce)
        .expect("encode poll");
    let poll_reply = fixture.state.frontend.handle_poll(&poll, "203.0.113.9").expect("poll");
    let decoded = agent
        .communicator
        .decode_bundle(&poll_reply, Some(next_nonce.as_micros()))
        .expect("decode poll reply");
    assert!(decoded.authenticated);
}

/// Tests that unknown agents sending regular traffic are told to enroll.
#[test]
fn test_unknown_client_is_told_to_enroll() {
    let fixture = server_fixture();
    let agent = agent_fixture(&fixture.state);
    let nonce = Timestamp::from_micros(1_000_000);

    let mut message = enrollment_message(&agent);
    message.session_id = SessionId::well_known("stats");
    let bundle = agent
        .communicator
        .encode_bundle("outpost-server", &[message], nonce, nonce)
        .expect("encode");
    let result = fixture.state.frontend.handle_poll(&bundle, "203.0.113.9");
    assert!(matches!(result, Err(PollError::EnrollmentRequired)));
}

/// Tests the replay guard: a reused nonce drops the bundle.
#[test]
fn test_replayed_nonce_is_dropped() {
    let fixture = server_fixture();
    let agent = agent_fixture(&fixture.state);
    let nonce = Timestamp::from_micros(1_000_000);
    let bundle = agent
        .communicator
        .encode_bundle("outpost-server", &[enrollment_message(&agent)], nonce, nonce)
        .expect("encode enrollment");
    fixture.state.frontend.handle_poll(&bundle, "203.0.113.9").expect("enroll");

    let poll_nonce = Timestamp::from_micros(2_000_000);
    let poll = agent
        .communicator
        .encode_bundle("outpost-server", &[], poll_nonce, poll_nonce)
        .expect("encode poll");
    fixture.state.frontend.handle_poll(&poll, "203.0.113.9").expect("first poll");

    let replay = agent
        .communicator
        .encode_bundle("outpost-server", &[], poll_nonce, poll_nonce)
        .expect("encode replay");
    let result = fixture.state.frontend.handle_poll(&replay, "203.0.113.9");
    assert!(matches!(result, Err(PollError::Reject(_))));
}

// ============================================================================
// SECTION: API Approval Gate
// ============================================================================

/// Sends one JSON API request through the router.
async fn api_call(
    state: Arc<ServerState>,
    method: &str,
    uri: &str,
    token: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let router = OutpostServer::router_for(state);
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {token}"));
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };
    let response = router.oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.expect("body");
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

/// Tests the full approval gate: denial without approvals, then grant
/// quorum, then a successful flow start.
#[tokio::test]
async fn test_api_flow_start_requires_approval_quorum() {
    let fixture = server_fixture();
    let agent = agent_fixture(&fixture.state);
    let nonce = Timestamp::from_micros(1_000_000);
    let bundle = agent
        .communicator
        .encode_bundle("outpost-server", &[enrollment_message(&agent)], nonce, nonce)
        .expect("encode enrollment");
    fixture.state.frontend.handle_poll(&bundle, "203.0.113.9").expect("enroll");
    let client_id = agent.client_name.clone();

    // No approval yet: denied.
    let (status, body) = api_call(
        fixture.state.clone(),
        "POST",
        &format!("/api/v1/clients/{client_id}/flows"),
        "alice-token-0123456789",
        Some(serde_json::json!({ "flow_name": "ListProcesses" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(
        body["message"].as_str().unwrap_or_default().contains("no approval found"),
        "unexpected body: {body}"
    );

    // Request an approval and collect two grants.
    let (status, approval) = api_call(
        fixture.state.clone(),
        "POST",
        "/api/v1/approvals",
        "alice-token-0123456789",
        Some(serde_json::json!({
            "approval_type": "client",
            "subject_id": client_id,
            "reason": "incident 4211",
            "notified_users": ["bob", "carol"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "approval create failed: {approval}");
    let approval_id = approval["approval_id"].as_str().expect("approval id").to_string();

    for token in ["bob-token-0123456789ab", "carol-token-0123456789"] {
        let (status, granted) = api_call(
            fixture.state.clone(),
            "POST",
            &format!("/api/v1/approvals/alice/{approval_id}/grant"),
            token,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "grant failed: {granted}");
    }

    // Quorum reached: the flow starts.
    let (status, flow) = api_call(
        fixture.state.clone(),
        "POST",
        &format!("/api/v1/clients/{client_id}/flows"),
        "alice-token-0123456789",
        Some(serde_json::json!({ "flow_name": "ListProcesses" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "flow start failed: {flow}");
    assert_eq!(flow["state"], "running");
    assert_eq!(flow["flow_name"], "ListProcesses");
}

/// Tests that restricted flow classes require an admin caller even with
/// approvals in place.
#[tokio::test]
async fn test_api_restricted_flow_requires_admin() {
    let fixture = server_fixture();
    let agent = agent_fixture(&fixture.state);
    let nonce = Timestamp::from_micros(1_000_000);
    let bundle = agent
        .communicator
        .encode_bundle("outpost-server", &[enrollment_message(&agent)], nonce, nonce)
        .expect("encode enrollment");
    fixture.state.frontend.handle_poll(&bundle, "203.0.113.9").expect("enroll");
    let client_id = agent.client_name.clone();

    // Set up a valid approval for alice.
    let (_, approval) = api_call(
        fixture.state.clone(),
        "POST",
        "/api/v1/approvals",
        "alice-token-0123456789",
        Some(serde_json::json!({
            "approval_type": "client",
            "subject_id": client_id,
            "reason": "incident",
        })),
    )
    .await;
    let approval_id = approval["approval_id"].as_str().expect("approval id").to_string();
    for token in ["bob-token-0123456789ab", "carol-token-0123456789"] {
        api_call(
            fixture.state.clone(),
            "POST",
            &format!("/api/v1/approvals/alice/{approval_id}/grant"),
            token,
            None,
        )
        .await;
    }

    let (status, body) = api_call(
        fixture.state.clone(),
        "POST",
        &format!("/api/v1/clients/{client_id}/flows"),
        "alice-token-0123456789",
        Some(serde_json::json!({
            "flow_name": "ExecuteBinary",
            "args": {
                "type": "ExecuteBinaryArgs",
                "body": { "binary_path": "linux/collector", "args": [] }
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN, "unexpected: {body}");
}

/// Tests that a bad token is rejected before any authorization check.
#[tokio::test]
async fn test_api_rejects_unknown_tokens() {
    let fixture = server_fixture();
    let (status, _) =
        api_call(fixture.state.clone(), "GET", "/api/v1/clients", "wrong-token-000000000", None)
            .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
