// outpost-core/tests/approvals.rs
// ============================================================================
// Module: Approval Checker Tests
// Description: Quorum, expiry, admin-grantor, cache, and restriction rules.
// ============================================================================
//! ## Overview
//! Validates the authorization predicate: grant quorum, expiry boundaries,
//! admin requirements for hunts, label policies, the positive-check cache,
//! and restricted flow classes.

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

use std::sync::Arc;

use outpost_core::ApprovalChecker;
use outpost_core::ApprovalCheckerConfig;
use outpost_core::ApprovalError;
use outpost_core::ApprovalType;
use outpost_core::ClientLabel;
use outpost_core::ClientLabelPolicy;
use outpost_core::Clock;
use outpost_core::DataStore;
use outpost_core::DurationMicros;
use outpost_core::FixedClock;
use outpost_core::HuntId;
use outpost_core::InMemoryDataStore;
use outpost_core::SequentialIdGenerator;
use outpost_core::StaticUserCatalog;
use outpost_core::Timestamp;
use outpost_core::UserType;
use outpost_core::Username;

use common::enroll_client;

/// Approval test fixture.
struct ApprovalEnv {
    /// Shared store.
    store: Arc<InMemoryDataStore>,
    /// Fixed clock.
    clock: Arc<FixedClock>,
    /// Checker under test.
    checker: ApprovalChecker,
}

/// Builds a checker with `bob` as the only admin.
fn approval_env(config: ApprovalCheckerConfig) -> ApprovalEnv {
    let store = Arc::new(InMemoryDataStore::new());
    let clock = Arc::new(FixedClock::starting_at(Timestamp::from_secs(5_000_000)));
    let catalog = Arc::new(StaticUserCatalog::new([
        (Username::from("alice"), UserType::Standard),
        (Username::from("bob"), UserType::Admin),
        (Username::from("carol"), UserType::Standard),
        (Username::from("dave"), UserType::Standard),
    ]));
    let checker = ApprovalChecker::new(
        store.clone(),
        clock.clone(),
        Arc::new(SequentialIdGenerator::new()),
        catalog,
        config,
    );
    ApprovalEnv { store, clock, checker }
}

// ============================================================================
// SECTION: Quorum
// ============================================================================

/// Tests the full grant flow: denial, quorum, then access.
#[test]
fn test_client_access_requires_grant_quorum() {
    let env = approval_env(ApprovalCheckerConfig::default());
    let alice = Username::from("alice");
    let client_id = enroll_client(env.store.as_ref(), 0xAAAA, "Linux", env.clock.now());

    let denied = env.checker.check_client_access(&alice, client_id);
    match denied {
        Err(ApprovalError::Unauthorized { message, .. }) => {
            assert!(message.contains("no approval found"), "unexpected: {message}");
        }
        other => panic!("expected unauthorized, got {other:?}"),
    }

    let approval = env
        .checker
        .request_approval(
            alice.clone(),
            ApprovalType::Client,
            client_id.to_string(),
            "incident 4211".to_string(),
            vec![Username::from("bob"), Username::from("carol")],
            Vec::new(),
        )
        .expect("request approval");

    env.checker
        .grant_approval(&alice, approval.approval_id, Username::from("bob"))
        .expect("grant bob");
    assert!(env.checker.check_client_access(&alice, client_id).is_err());

    env.checker
        .grant_approval(&alice, approval.approval_id, Username::from("carol"))
        .expect("grant carol");
    env.checker.check_client_access(&alice, client_id).expect("access after quorum");
}

/// Tests that repeated grants by one user do not count twice.
#[test]
fn test_duplicate_grantor_counts_once() {
    let env = approval_env(ApprovalCheckerConfig::default());
    let alice = Username::from("alice");
    let client_id = enroll_client(env.store.as_ref(), 0xAB, "Linux", env.clock.now());

    let approval = env
        .checker
        .request_approval(
            alice.clone(),
            ApprovalType::Client,
            client_id.to_string(),
            "incident".to_string(),
            Vec::new(),
            Vec::new(),
        )
        .expect("request approval");
    env.checker.grant_approval(&alice, approval.approval_id, Username::from("bob")).expect("g1");
    env.checker.grant_approval(&alice, approval.approval_id, Username::from("bob")).expect("g2");
    assert!(env.checker.check_client_access(&alice, client_id).is_err());
}

// ============================================================================
// SECTION: Expiry
// ============================================================================

/// Tests the expiry boundary: valid just before, denied just after.
#[test]
fn test_approval_expiry_boundary() {
    let mut config = ApprovalCheckerConfig::default();
    config.cache_ttl = DurationMicros::from_micros(0);
    let env = approval_env(config);
    let alice = Username::from("alice");
    let client_id = enroll_client(env.store.as_ref(), 0xAC, "Linux", env.clock.now());

    let approval = env
        .checker
        .request_approval(
            alice.clone(),
            ApprovalType::Client,
            client_id.to_string(),
            "incident".to_string(),
            Vec::new(),
            Vec::new(),
        )
        .expect("request approval");
    env.checker.grant_approval(&alice, approval.approval_id, Username::from("bob")).expect("g1");
    env.checker.grant_approval(&alice, approval.approval_id, Username::from("carol")).expect("g2");

    let lifetime = approval.expiration.since(env.clock.now());
    env.clock.advance(DurationMicros::from_micros(lifetime.as_micros() - 1));
    env.checker.check_client_access(&alice, client_id).expect("valid before expiration");

    env.clock.advance(DurationMicros::from_micros(2));
    assert!(env.checker.check_client_access(&alice, client_id).is_err());
}

// ============================================================================
// SECTION: Admin Grantors
// ============================================================================

/// Tests that hunt approvals need at least one admin grantor.
#[test]
fn test_hunt_approval_requires_admin_grantor() {
    let env = approval_env(ApprovalCheckerConfig::default());
    let alice = Username::from("alice");
    let hunt_id = HuntId::from_raw(0x77);

    let approval = env
        .checker
        .request_approval(
            alice.clone(),
            ApprovalType::Hunt,
            hunt_id.to_string(),
            "fleet sweep".to_string(),
            Vec::new(),
            Vec::new(),
        )
        .expect("request approval");
    env.checker.grant_approval(&alice, approval.approval_id, Username::from("carol")).expect("g1");
    env.checker.grant_approval(&alice, approval.approval_id, Username::from("dave")).expect("g2");

    match env.checker.check_hunt_access(&alice, hunt_id) {
        Err(ApprovalError::Unauthorized { message, .. }) => {
            assert!(message.contains("admin"), "unexpected: {message}");
        }
        other => panic!("expected unauthorized, got {other:?}"),
    }

    env.checker.grant_approval(&alice, approval.approval_id, Username::from("bob")).expect("g3");
    env.checker.check_hunt_access(&alice, hunt_id).expect("admin grantor satisfies");
}

// ============================================================================
// SECTION: Label Policies
// ============================================================================

/// Tests label-attached grantor policies on client approvals.
#[test]
fn test_client_label_policy_requires_mandatory_grantor() {
    let mut config = ApprovalCheckerConfig::default();
    config.client_label_policies = vec![ClientLabelPolicy {
        label: "production".to_string(),
        mandatory_grantors: vec![Username::from("bob")],
    }];
    let env = approval_env(config);
    let alice = Username::from("alice");
    let client_id = enroll_client(env.store.as_ref(), 0xAD, "Linux", env.clock.now());
    env.store
        .add_client_labels(
            client_id,
            &[ClientLabel { owner: Username::from("carol"), name: "production".to_string() }],
        )
        .expect("label client");

    let approval = env
        .checker
        .request_approval(
            alice.clone(),
            ApprovalType::Client,
            client_id.to_string(),
            "incident".to_string(),
            Vec::new(),
            Vec::new(),
        )
        .expect("request approval");
    env.checker.grant_approval(&alice, approval.approval_id, Username::from("carol")).expect("g1");
    env.checker.grant_approval(&alice, approval.approval_id, Username::from("dave")).expect("g2");
    assert!(env.checker.check_client_access(&alice, client_id).is_err());

    env.checker.grant_approval(&alice, approval.approval_id, Username::from("bob")).expect("g3");
    env.checker.check_client_access(&alice, client_id).expect("mandatory grantor satisfies");
}

// ============================================================================
// SECTION: Cache
// ============================================================================

/// Tests that the positive-check cache serves within its TTL and refreshes
/// after it.
#[test]
fn test_positive_check_cache_ttl() {
    let env = approval_env(ApprovalCheckerConfig::default());
    let alice = Username::from("alice");
    let client_id = enroll_client(env.store.as_ref(), 0xAE, "Linux", env.clock.now());

    let approval = env
        .checker
        .request_approval(
            alice.clone(),
            ApprovalType::Client,
            client_id.to_string(),
            "incident".to_string(),
            Vec::new(),
            Vec::new(),
        )
        .expect("request approval");
    env.checker.grant_approval(&alice, approval.approval_id, Username::from("bob")).expect("g1");
    env.checker.grant_approval(&alice, approval.approval_id, Username::from("carol")).expect("g2");
    env.checker.check_client_access(&alice, client_id).expect("populate cache");

    // Within the TTL the cached positive short-circuits the store.
    env.clock.advance(DurationMicros::from_secs(30));
    env.checker.check_client_access(&alice, client_id).expect("cache hit");

    // Past the TTL the predicate is re-evaluated against the store.
    env.clock.advance(DurationMicros::from_secs(31));
    env.checker.check_client_access(&alice, client_id).expect("re-evaluated");
}

// ============================================================================
// SECTION: Restricted Flows
// ============================================================================

/// Tests that restricted flow classes require an admin caller.
#[test]
fn test_restricted_flows_require_admin() {
    let env = approval_env(ApprovalCheckerConfig::default());
    assert!(env.checker.check_flow_restrictions(&Username::from("alice"), "ExecuteBinary").is_err());
    assert!(env.checker.check_flow_restrictions(&Username::from("alice"), "UpdateAgent").is_err());
    env.checker
        .check_flow_restrictions(&Username::from("bob"), "ExecuteBinary")
        .expect("admin may run restricted flows");
    env.checker
        .check_flow_restrictions(&Username::from("alice"), "ListProcesses")
        .expect("unrestricted flows need no admin");
}
