// outpost-core/tests/flow_engine.rs
// ============================================================================
// Module: Flow Engine Tests
// Description: End-to-end flow state machine behavior over the in-memory
//              store.
// ============================================================================
//! ## Overview
//! Validates request/response correlation, cursor advance, quota
//! enforcement, retransmission handling, child flows, and cancellation.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

mod common;

use outpost_core::Clock;
use outpost_core::DataStore;
use outpost_core::DurationMicros;
use outpost_core::FlowClass;
use outpost_core::FlowContext;
use outpost_core::FlowError;
use outpost_core::FlowRegistry;
use outpost_core::FlowResponse;
use outpost_core::FlowState;
use outpost_core::Payload;
use outpost_core::RequestId;
use outpost_core::StartFlowRequest;
use outpost_core::StatusKind;
use outpost_core::payload::LogMessage;
use outpost_core::payload::Process;
use outpost_core::runtime::flows::message_payloads;
use outpost_core::runtime::flows::require_ok;

use common::drain_processing;
use common::enroll_client;
use common::ok_status;
use common::respond;
use common::test_env;
use common::test_env_with_registry;

/// Builds a process payload for tests.
fn process(pid: u32, name: &str) -> Payload {
    Payload::Process(Process {
        pid,
        ppid: 1,
        name: name.to_string(),
        cmdline: format!("/usr/bin/{name}"),
        username: "root".to_string(),
    })
}

// ============================================================================
// SECTION: Two-Step Flow
// ============================================================================

/// Tests the canonical single-action flow: one outbound message, three
/// payloads plus a status, cursor advance, results, and accounting.
#[test]
fn test_list_processes_flow_completes() {
    let env = test_env();
    let now = env.clock.now();
    let client_id = enroll_client(env.store.as_ref(), 0x0123_4567_89ab_cdef, "Linux", now);

    let flow = env
        .engine
        .start_flow(StartFlowRequest {
            client_id,
            flow_name: "ListProcesses".into(),
            args: Payload::Empty,
            creator: "alice".into(),
            cpu_limit_seconds: 0.0,
            network_bytes_limit: 0,
            flow_id: None,
            parent_hunt_id: None,
        })
        .expect("start flow");
    assert_eq!(flow.state, FlowState::Running);

    let messages = env.store.read_client_messages(client_id).expect("read messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].action, "ListProcesses");
    assert_eq!(messages[0].args, Payload::Empty);

    respond(
        env.store.as_ref(),
        client_id,
        flow.flow_id,
        RequestId::FIRST,
        &[process(10, "init"), process(20, "sshd"), process(30, "bash")],
        ok_status(1.0, 0.5, 2_048),
        env.clock.now(),
    );
    drain_processing(&env);

    let done = env.store.read_flow(client_id, flow.flow_id).expect("read flow");
    assert_eq!(done.state, FlowState::Finished);
    assert_eq!(done.next_request_to_process, RequestId::from_raw(2));
    assert!((done.cpu_time_used - 1.5).abs() < f64::EPSILON);
    assert_eq!(done.network_bytes_sent, 2_048);
    assert_eq!(done.result_count, 3);

    let results =
        env.store.read_flow_results(client_id, flow.flow_id, 0, 100).expect("read results");
    assert_eq!(results.len(), 3);

    // Terminal status retired the outbound message.
    assert!(env.store.read_client_messages(client_id).expect("read messages").is_empty());
}

// ============================================================================
// SECTION: Quota Enforcement
// ============================================================================

/// Tests that a CPU budget breach observed on one state terminates the flow
/// afterwards, without discarding that state's outputs.
#[test]
fn test_cpu_quota_breach_turns_flow_into_error() {
    let env = test_env();
    let now = env.clock.now();
    let client_id = enroll_client(env.store.as_ref(), 0x1111, "Linux", now);

    let flow = env
        .engine
        .start_flow(StartFlowRequest {
            client_id,
            flow_name: "ListProcesses".into(),
            args: Payload::Empty,
            creator: "alice".into(),
            cpu_limit_seconds: 60.0,
            network_bytes_limit: 0,
            flow_id: None,
            parent_hunt_id: None,
        })
        .expect("start flow");

    respond(
        env.store.as_ref(),
        client_id,
        flow.flow_id,
        RequestId::FIRST,
        &[process(10, "init")],
        ok_status(120.0, 0.0, 0),
        env.clock.now(),
    );
    drain_processing(&env);

    let done = env.store.read_flow(client_id, flow.flow_id).expect("read flow");
    assert_eq!(done.state, FlowState::Error);
    let message = done.error_message.expect("error message");
    assert!(message.contains("cpu limit"), "unexpected message: {message}");
    // The state that observed the breach still persisted its outputs.
    assert_eq!(done.result_count, 1);
}

// ============================================================================
// SECTION: Retransmission
// ============================================================================

/// Tests that a message leased past the retransmission limit is dropped and
/// a synthetic error status advances the flow to the error state.
#[test]
fn test_retransmission_limit_drops_message_and_fails_flow() {
    let env = test_env();
    let now = env.clock.now();
    let client_id = enroll_client(env.store.as_ref(), 0x2222, "Linux", now);

    let flow = env
        .engine
        .start_flow(StartFlowRequest {
            client_id,
            flow_name: "ListProcesses".into(),
            args: Payload::Empty,
            creator: "alice".into(),
            cpu_limit_seconds: 0.0,
            network_bytes_limit: 0,
            flow_id: None,
            parent_hunt_id: None,
        })
        .expect("start flow");

    // The agent keeps polling but never returns a status; each lease
    // increments the attempt counter once the previous lease expires.
    for attempt in 0..10 {
        let leased =
            env.engine.lease_outbound_messages(client_id, "frontend").expect("lease messages");
        assert_eq!(leased.len(), 1, "attempt {attempt} should still deliver");
        env.clock.advance(DurationMicros::from_secs(601));
    }
    let leased =
        env.engine.lease_outbound_messages(client_id, "frontend").expect("lease messages");
    assert!(leased.is_empty(), "the eleventh lease must drop the message");
    assert!(env.store.read_client_messages(client_id).expect("read messages").is_empty());

    drain_processing(&env);
    let done = env.store.read_flow(client_id, flow.flow_id).expect("read flow");
    assert_eq!(done.state, FlowState::Error);
    let message = done.error_message.expect("error message");
    assert!(message.contains("retransmission limit"), "unexpected message: {message}");
}

// ============================================================================
// SECTION: Crash Handling
// ============================================================================

/// Tests that a killed-agent status transitions the flow to crashed.
#[test]
fn test_client_killed_status_crashes_flow() {
    let env = test_env();
    let now = env.clock.now();
    let client_id = enroll_client(env.store.as_ref(), 0x3333, "Linux", now);

    let flow = env
        .engine
        .start_flow(StartFlowRequest {
            client_id,
            flow_name: "ListProcesses".into(),
            args: Payload::Empty,
            creator: "alice".into(),
            cpu_limit_seconds: 0.0,
            network_bytes_limit: 0,
            flow_id: None,
            parent_hunt_id: None,
        })
        .expect("start flow");

    respond(
        env.store.as_ref(),
        client_id,
        flow.flow_id,
        RequestId::FIRST,
        &[],
        outpost_core::Status::error(StatusKind::ClientKilled, "segfault in action"),
        env.clock.now(),
    );
    drain_processing(&env);

    let done = env.store.read_flow(client_id, flow.flow_id).expect("read flow");
    assert_eq!(done.state, FlowState::Crashed);
}

// ============================================================================
// SECTION: Cancellation
// ============================================================================

/// Tests cooperative cancellation through the pending-termination flag.
#[test]
fn test_cancel_flow_terminates_with_error() {
    let env = test_env();
    let now = env.clock.now();
    let client_id = enroll_client(env.store.as_ref(), 0x4444, "Linux", now);

    let flow = env
        .engine
        .start_flow(StartFlowRequest {
            client_id,
            flow_name: "ListProcesses".into(),
            args: Payload::Empty,
            creator: "alice".into(),
            cpu_limit_seconds: 0.0,
            network_bytes_limit: 0,
            flow_id: None,
            parent_hunt_id: None,
        })
        .expect("start flow");

    env.engine.cancel_flow(client_id, flow.flow_id, "operator abort").expect("cancel");
    drain_processing(&env);

    let done = env.store.read_flow(client_id, flow.flow_id).expect("read flow");
    assert_eq!(done.state, FlowState::Error);
    assert_eq!(done.error_message.as_deref(), Some("operator abort"));
}

// ============================================================================
// SECTION: Interrogation
// ============================================================================

/// Tests the two-step interrogation flow and its knowledge-base update.
#[test]
fn test_interrogate_updates_knowledge_base() {
    let env = test_env();
    let now = env.clock.now();
    let client_id = enroll_client(env.store.as_ref(), 0x5555, "", now);

    let flow = env
        .engine
        .start_flow(StartFlowRequest {
            client_id,
            flow_name: "Interrogate".into(),
            args: Payload::Empty,
            creator: "alice".into(),
            cpu_limit_seconds: 0.0,
            network_bytes_limit: 0,
            flow_id: None,
            parent_hunt_id: None,
        })
        .expect("start flow");

    let platform = Payload::PlatformInfo(outpost_core::payload::PlatformInfo {
        knowledge_base: outpost_core::KnowledgeBase {
            os: "Windows".to_string(),
            os_version: "10".to_string(),
            arch: "x86_64".to_string(),
            fqdn: "ws1.corp.example.com".to_string(),
        },
    });
    respond(
        env.store.as_ref(),
        client_id,
        flow.flow_id,
        RequestId::FIRST,
        &[platform],
        ok_status(0.1, 0.0, 64),
        env.clock.now(),
    );
    drain_processing(&env);

    // The second step is now outbound.
    let messages = env.store.read_client_messages(client_id).expect("read messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].action, "GetClientStats");

    let stats = Payload::ClientStats(outpost_core::payload::ClientStats {
        memory_bytes: 64 * 1024 * 1024,
        cpu_micros: 5_000_000,
        bytes_sent: 1_000,
        bytes_received: 2_000,
        boot_time: now,
    });
    respond(
        env.store.as_ref(),
        client_id,
        flow.flow_id,
        RequestId::from_raw(2),
        &[stats],
        ok_status(0.1, 0.0, 32),
        env.clock.now(),
    );
    drain_processing(&env);

    let done = env.store.read_flow(client_id, flow.flow_id).expect("read flow");
    assert_eq!(done.state, FlowState::Finished);
    assert_eq!(done.next_request_to_process, RequestId::from_raw(3));

    let client = env.store.read_client(client_id).expect("read client");
    assert_eq!(client.knowledge_base.os, "Windows");
    assert_eq!(client.knowledge_base.fqdn, "ws1.corp.example.com");
}

// ============================================================================
// SECTION: Child Flows
// ============================================================================

/// Parent flow used to exercise child composition.
struct ParentFlow;

impl FlowClass for ParentFlow {
    fn name(&self) -> &'static str {
        "Parent"
    }

    fn start(&self, ctx: &mut FlowContext<'_>) -> Result<(), FlowError> {
        ctx.call_flow("ListProcesses", Payload::Empty, "ChildDone")?;
        Ok(())
    }

    fn process(
        &self,
        ctx: &mut FlowContext<'_>,
        state: &str,
        responses: &[FlowResponse],
    ) -> Result<(), FlowError> {
        match state {
            "ChildDone" => {
                require_ok(responses)?;
                ctx.send_reply(Payload::LogMessage(LogMessage {
                    level: "info".to_string(),
                    message: "child finished".to_string(),
                }));
                Ok(())
            }
            other => Err(FlowError::UnknownState(other.to_string())),
        }
    }
}

/// Tests that a terminal child flow notifies and advances its parent.
#[test]
fn test_child_flow_completion_advances_parent() {
    let mut registry = FlowRegistry::builtin();
    registry.register("Parent", || Box::new(ParentFlow));
    let env = test_env_with_registry(registry);
    let now = env.clock.now();
    let client_id = enroll_client(env.store.as_ref(), 0x6666, "Linux", now);

    let parent = env
        .engine
        .start_flow(StartFlowRequest {
            client_id,
            flow_name: "Parent".into(),
            args: Payload::Empty,
            creator: "alice".into(),
            cpu_limit_seconds: 0.0,
            network_bytes_limit: 0,
            flow_id: None,
            parent_hunt_id: None,
        })
        .expect("start parent");

    // The child issued the actual client action.
    let messages = env.store.read_client_messages(client_id).expect("read messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].action, "ListProcesses");
    let child_flow_id = messages[0].flow_id;
    assert_ne!(child_flow_id, parent.flow_id);

    respond(
        env.store.as_ref(),
        client_id,
        child_flow_id,
        RequestId::FIRST,
        &[process(42, "calc")],
        ok_status(0.2, 0.1, 128),
        env.clock.now(),
    );
    drain_processing(&env);

    let child = env.store.read_flow(client_id, child_flow_id).expect("read child");
    assert_eq!(child.state, FlowState::Finished);
    assert_eq!(child.parent_flow_id, Some(parent.flow_id));

    let done = env.store.read_flow(client_id, parent.flow_id).expect("read parent");
    assert_eq!(done.state, FlowState::Finished);
    assert_eq!(done.result_count, 1);
    let results =
        env.store.read_flow_results(client_id, parent.flow_id, 0, 10).expect("read results");
    assert_eq!(results.len(), 1);
}

// ============================================================================
// SECTION: Ordering
// ============================================================================

/// Tests that a state callback failure is persisted as the error state.
#[test]
fn test_bad_args_fail_flow_start() {
    let env = test_env();
    let now = env.clock.now();
    let client_id = enroll_client(env.store.as_ref(), 0x7777, "Linux", now);

    let result = env.engine.start_flow(StartFlowRequest {
        client_id,
        flow_name: "StatFile".into(),
        args: Payload::Empty,
        creator: "alice".into(),
        cpu_limit_seconds: 0.0,
        network_bytes_limit: 0,
        flow_id: None,
        parent_hunt_id: None,
    });
    assert!(result.is_err(), "StatFile must reject empty args");
}

/// Tests that payload helpers expose ordered message payloads.
#[test]
fn test_message_payload_helper_preserves_order() {
    let env = test_env();
    let now = env.clock.now();
    let client_id = enroll_client(env.store.as_ref(), 0x8888, "Linux", now);

    let flow = env
        .engine
        .start_flow(StartFlowRequest {
            client_id,
            flow_name: "ListProcesses".into(),
            args: Payload::Empty,
            creator: "alice".into(),
            cpu_limit_seconds: 0.0,
            network_bytes_limit: 0,
            flow_id: None,
            parent_hunt_id: None,
        })
        .expect("start flow");

    respond(
        env.store.as_ref(),
        client_id,
        flow.flow_id,
        RequestId::FIRST,
        &[process(1, "a"), process(2, "b")],
        ok_status(0.0, 0.0, 0),
        env.clock.now(),
    );
    let ready = env
        .store
        .read_flow_requests_ready_for_processing(client_id, flow.flow_id, RequestId::FIRST)
        .expect("ready requests");
    assert_eq!(ready.len(), 1);
    let payloads = message_payloads(&ready[0].1);
    assert_eq!(payloads.len(), 2);
    match (payloads[0], payloads[1]) {
        (Payload::Process(first), Payload::Process(second)) => {
            assert_eq!(first.pid, 1);
            assert_eq!(second.pid, 2);
        }
        other => panic!("unexpected payloads: {other:?}"),
    }
}
