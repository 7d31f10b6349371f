// outpost-core/tests/common/mod.rs
// ============================================================================
// Module: Core Test Helpers
// Description: Shared fixtures for engine, hunt, and approval tests.
// ============================================================================
//! ## Overview
//! Builds a deterministic runtime over the in-memory store: fixed clock,
//! sequential ids, and helpers simulating agent responses.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    dead_code,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::sync::Arc;

use outpost_core::Client;
use outpost_core::ClientId;
use outpost_core::CpuUsage;
use outpost_core::DataStore;
use outpost_core::FixedClock;
use outpost_core::FlowEngine;
use outpost_core::FlowEngineConfig;
use outpost_core::FlowId;
use outpost_core::FlowRegistry;
use outpost_core::FlowResponse;
use outpost_core::HuntDispatcher;
use outpost_core::HuntDispatcherConfig;
use outpost_core::InMemoryDataStore;
use outpost_core::KnowledgeBase;
use outpost_core::Payload;
use outpost_core::RequestId;
use outpost_core::ResponseBody;
use outpost_core::ResponseId;
use outpost_core::SequentialIdGenerator;
use outpost_core::Status;
use outpost_core::Timestamp;

/// Deterministic runtime fixture.
pub struct TestEnv {
    /// In-memory store, shared with the engine.
    pub store: Arc<InMemoryDataStore>,
    /// Fixed clock, advanced explicitly.
    pub clock: Arc<FixedClock>,
    /// Flow engine under test.
    pub engine: Arc<FlowEngine>,
    /// Hunt dispatcher under test.
    pub dispatcher: Arc<HuntDispatcher>,
}

/// Builds the fixture with the built-in flow registry.
pub fn test_env() -> TestEnv {
    test_env_with_registry(FlowRegistry::builtin())
}

/// Builds the fixture with a custom flow registry.
pub fn test_env_with_registry(registry: FlowRegistry) -> TestEnv {
    let store = Arc::new(InMemoryDataStore::new());
    let clock = Arc::new(FixedClock::starting_at(Timestamp::from_secs(1_000_000)));
    let ids = Arc::new(SequentialIdGenerator::new());
    let engine = Arc::new(FlowEngine::new(
        store.clone(),
        clock.clone(),
        ids.clone(),
        Arc::new(registry),
        FlowEngineConfig::default(),
    ));
    let dispatcher = Arc::new(HuntDispatcher::new(
        store.clone(),
        clock.clone(),
        ids,
        engine.clone(),
        HuntDispatcherConfig::default(),
    ));
    TestEnv { store, clock, engine, dispatcher }
}

/// Enrolls a test client with the given raw id and OS fact.
pub fn enroll_client(store: &dyn DataStore, raw_id: u64, os: &str, now: Timestamp) -> ClientId {
    let client_id = ClientId::from_raw(raw_id);
    let mut client = Client::enrolled(
        client_id,
        "-----BEGIN PUBLIC KEY----- test -----END PUBLIC KEY-----".to_string(),
        format!("fp-{raw_id:016x}"),
        now,
        "203.0.113.7".to_string(),
    );
    client.knowledge_base = KnowledgeBase {
        os: os.to_string(),
        os_version: "1.0".to_string(),
        arch: "x86_64".to_string(),
        fqdn: format!("host{raw_id}.example.com"),
    };
    store.write_client(&client).expect("write client");
    client_id
}

/// Writes ordered payload responses followed by a terminal status, the way
/// an agent answers one request.
pub fn respond(
    store: &dyn DataStore,
    client_id: ClientId,
    flow_id: FlowId,
    request_id: RequestId,
    payloads: &[Payload],
    status: Status,
    now: Timestamp,
) {
    let mut responses: Vec<FlowResponse> = payloads
        .iter()
        .enumerate()
        .map(|(index, payload)| FlowResponse {
            client_id,
            flow_id,
            request_id,
            response_id: ResponseId::from_raw(index as u64 + 1),
            body: ResponseBody::Message(payload.clone()),
            received_at: now,
        })
        .collect();
    responses.push(FlowResponse {
        client_id,
        flow_id,
        request_id,
        response_id: ResponseId::from_raw(payloads.len() as u64 + 1),
        body: ResponseBody::Status(status),
        received_at: now,
    });
    store.write_flow_responses(&responses, now).expect("write responses");
}

/// Convenience: an ok status with the given resource usage.
pub fn ok_status(user_seconds: f64, system_seconds: f64, network_bytes: u64) -> Status {
    Status::ok(CpuUsage { user_seconds, system_seconds }, network_bytes)
}

/// Drains the processing queue until no work remains, enforcing hunt
/// ceilings the way the worker loop does.
pub fn drain_processing(env: &TestEnv) {
    for _ in 0..32 {
        let outcomes = env.engine.process_queue_once("test-worker").expect("process queue");
        if outcomes.is_empty() {
            return;
        }
        for outcome in outcomes {
            if let Ok(Some(hunt_id)) = outcome.result {
                let _ = env.dispatcher.enforce_ceilings(hunt_id);
            }
        }
    }
}
