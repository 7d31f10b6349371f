// outpost-core/tests/hunts.rs
// ============================================================================
// Module: Hunt Dispatcher Tests
// Description: Fan-out, admission control, throttling, and ceilings.
// ============================================================================
//! ## Overview
//! Validates rule matching, client-limit completion, per-window throttling,
//! dispatch deduplication, and crash-ceiling stops.

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

mod common;

use outpost_core::ClientRule;
use outpost_core::ClientRuleSet;
use outpost_core::CreateHuntRequest;
use outpost_core::Clock;
use outpost_core::DataStore;
use outpost_core::DurationMicros;
use outpost_core::FlowId;
use outpost_core::HuntState;
use outpost_core::Payload;
use outpost_core::RequestId;
use outpost_core::RuleMatchMode;
use outpost_core::Status;
use outpost_core::StatusKind;
use outpost_core::payload::CollectActionArgs;

use common::TestEnv;
use common::drain_processing;
use common::enroll_client;
use common::ok_status;
use common::respond;
use common::test_env;

/// Builds a hunt request collecting process listings from Linux clients.
fn hunt_request(client_limit: u64, crash_limit: u64, client_rate: u32) -> CreateHuntRequest {
    CreateHuntRequest {
        creator: "alice".into(),
        description: "collect process listings".to_string(),
        flow_name: "CollectAction".into(),
        flow_args: Payload::CollectActionArgs(CollectActionArgs {
            action: "ListProcesses".to_string(),
            args: Box::new(Payload::Empty),
        }),
        client_rule_set: ClientRuleSet {
            match_mode: RuleMatchMode::All,
            rules: vec![ClientRule::Os { os_names: vec!["Linux".to_string()] }],
        },
        client_rate,
        client_limit,
        crash_limit,
        avg_cpu_seconds_per_client_limit: 0.0,
        avg_network_bytes_per_client_limit: 0,
        avg_results_per_client_limit: 0,
    }
}

/// Answers a hunt child flow on one client with the given status.
fn answer_child(env: &TestEnv, raw_client: u64, hunt_raw: u64, status: Status) {
    let client_id = outpost_core::ClientId::from_raw(raw_client);
    respond(
        env.store.as_ref(),
        client_id,
        FlowId::from_raw(hunt_raw),
        RequestId::FIRST,
        &[],
        status,
        env.clock.now(),
    );
}

// ============================================================================
// SECTION: Rule Matching and Fan-Out
// ============================================================================

/// Tests that starting a hunt fans out only to rule-matching clients.
#[test]
fn test_hunt_dispatches_to_matching_clients_only() {
    let env = test_env();
    let now = env.clock.now();
    enroll_client(env.store.as_ref(), 1, "Linux", now);
    enroll_client(env.store.as_ref(), 2, "Windows", now);
    enroll_client(env.store.as_ref(), 3, "Linux", now);

    let hunt = env.dispatcher.create_hunt(hunt_request(100, 0, 0)).expect("create hunt");
    assert_eq!(hunt.state, HuntState::Paused);
    env.dispatcher.start_hunt(hunt.hunt_id).expect("start hunt");

    let updated = env.store.read_hunt(hunt.hunt_id).expect("read hunt");
    assert_eq!(updated.num_clients, 2);
    let flows = env.store.read_hunt_flows(hunt.hunt_id, 0, 100).expect("hunt flows");
    assert_eq!(flows.len(), 2);
    for flow in &flows {
        assert_eq!(flow.flow_id, FlowId::from_raw(hunt.hunt_id.as_raw()));
        assert_eq!(flow.parent_hunt_id, Some(hunt.hunt_id));
    }
}

/// Tests that repeat scans do not dispatch the same hunt twice per client.
#[test]
fn test_hunt_dispatch_deduplicates_per_client() {
    let env = test_env();
    let now = env.clock.now();
    enroll_client(env.store.as_ref(), 1, "Linux", now);

    let hunt = env.dispatcher.create_hunt(hunt_request(100, 0, 0)).expect("create hunt");
    env.dispatcher.start_hunt(hunt.hunt_id).expect("start hunt");
    env.dispatcher.scan_fleet_for_hunt(hunt.hunt_id).expect("rescan");

    let updated = env.store.read_hunt(hunt.hunt_id).expect("read hunt");
    assert_eq!(updated.num_clients, 1);
    assert_eq!(env.store.read_hunt_flows(hunt.hunt_id, 0, 100).expect("hunt flows").len(), 1);
}

// ============================================================================
// SECTION: Client Limit
// ============================================================================

/// Tests that a hunt never fans out past its client limit and completes.
#[test]
fn test_hunt_client_limit_completes_hunt() {
    let env = test_env();
    let now = env.clock.now();
    for raw in 1..=4 {
        enroll_client(env.store.as_ref(), raw, "Linux", now);
    }

    let hunt = env.dispatcher.create_hunt(hunt_request(2, 0, 0)).expect("create hunt");
    env.dispatcher.start_hunt(hunt.hunt_id).expect("start hunt");

    let updated = env.store.read_hunt(hunt.hunt_id).expect("read hunt");
    assert_eq!(updated.num_clients, 2);
    assert_eq!(updated.state, HuntState::Completed);
    assert_eq!(env.store.read_hunt_flows(hunt.hunt_id, 0, 100).expect("hunt flows").len(), 2);
}

// ============================================================================
// SECTION: Throttling
// ============================================================================

/// Tests the per-window client rate: remaining clients wait for later scans.
#[test]
fn test_hunt_client_rate_throttles_dispatch() {
    let env = test_env();
    let now = env.clock.now();
    for raw in 1..=3 {
        enroll_client(env.store.as_ref(), raw, "Linux", now);
    }

    let hunt = env.dispatcher.create_hunt(hunt_request(100, 0, 2)).expect("create hunt");
    env.dispatcher.start_hunt(hunt.hunt_id).expect("start hunt");
    assert_eq!(env.store.read_hunt(hunt.hunt_id).expect("read hunt").num_clients, 2);

    // Same window: still throttled.
    env.dispatcher.scan_fleet_for_hunt(hunt.hunt_id).expect("rescan");
    assert_eq!(env.store.read_hunt(hunt.hunt_id).expect("read hunt").num_clients, 2);

    // Next window admits the remaining client.
    env.clock.advance(DurationMicros::from_secs(61));
    env.dispatcher.scan_fleet_for_hunt(hunt.hunt_id).expect("rescan");
    assert_eq!(env.store.read_hunt(hunt.hunt_id).expect("read hunt").num_clients, 3);
}

// ============================================================================
// SECTION: Ceilings
// ============================================================================

/// Tests that the crash ceiling stops the hunt while finished children keep
/// counting.
#[test]
fn test_hunt_crash_ceiling_stops_hunt() {
    let env = test_env();
    let now = env.clock.now();
    for raw in 1..=3 {
        enroll_client(env.store.as_ref(), raw, "Linux", now);
    }

    let hunt = env.dispatcher.create_hunt(hunt_request(100, 2, 0)).expect("create hunt");
    env.dispatcher.start_hunt(hunt.hunt_id).expect("start hunt");
    assert_eq!(env.store.read_hunt(hunt.hunt_id).expect("read hunt").num_clients, 3);

    answer_child(&env, 1, hunt.hunt_id.as_raw(), Status::error(StatusKind::ClientKilled, "boom"));
    drain_processing(&env);
    let after_first = env.store.read_hunt(hunt.hunt_id).expect("read hunt");
    assert_eq!(after_first.num_crashed, 1);
    assert_eq!(after_first.state, HuntState::Started);

    answer_child(&env, 2, hunt.hunt_id.as_raw(), Status::error(StatusKind::ClientKilled, "boom"));
    drain_processing(&env);
    let after_second = env.store.read_hunt(hunt.hunt_id).expect("read hunt");
    assert_eq!(after_second.num_crashed, 2);
    assert_eq!(after_second.state, HuntState::Stopped);

    // Already-dispatched children continue and still aggregate.
    answer_child(&env, 3, hunt.hunt_id.as_raw(), ok_status(1.0, 0.0, 100));
    drain_processing(&env);
    let done = env.store.read_hunt(hunt.hunt_id).expect("read hunt");
    assert_eq!(done.num_successful, 1);
    assert_eq!(done.state, HuntState::Stopped);
}

/// Tests success accounting and resource aggregation on hunt children.
#[test]
fn test_hunt_aggregates_child_resources() {
    let env = test_env();
    let now = env.clock.now();
    enroll_client(env.store.as_ref(), 1, "Linux", now);
    enroll_client(env.store.as_ref(), 2, "Linux", now);

    let hunt = env.dispatcher.create_hunt(hunt_request(100, 0, 0)).expect("create hunt");
    env.dispatcher.start_hunt(hunt.hunt_id).expect("start hunt");

    answer_child(&env, 1, hunt.hunt_id.as_raw(), ok_status(1.5, 0.5, 1_000));
    answer_child(&env, 2, hunt.hunt_id.as_raw(), ok_status(2.0, 0.0, 2_000));
    drain_processing(&env);

    let done = env.store.read_hunt(hunt.hunt_id).expect("read hunt");
    assert_eq!(done.num_successful, 2);
    assert_eq!(done.num_failed, 0);
    assert_eq!(done.total_network_bytes, 3_000);
    assert!((done.total_cpu_seconds - 4.0).abs() < f64::EPSILON);
}
