// outpost-store-sqlite/tests/sqlite_store.rs
// ============================================================================
// Module: SQLite Store Tests
// Description: Durable store semantics mirrored from the reference store.
// ============================================================================
//! ## Overview
//! Validates persistence round trips, the leasing discipline, completion
//! bookkeeping, hunt admission, approvals, and blob addressing over a real
//! database file.

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

use outpost_core::Approval;
use outpost_core::ApprovalId;
use outpost_core::ApprovalType;
use outpost_core::BlobStore;
use outpost_core::Client;
use outpost_core::ClientId;
use outpost_core::ClientMessage;
use outpost_core::ClientRuleSet;
use outpost_core::DataStore;
use outpost_core::DurationMicros;
use outpost_core::Flow;
use outpost_core::FlowId;
use outpost_core::FlowRequest;
use outpost_core::FlowResponse;
use outpost_core::FlowState;
use outpost_core::Grant;
use outpost_core::Hunt;
use outpost_core::HuntAdmissionDecision;
use outpost_core::HuntId;
use outpost_core::HuntState;
use outpost_core::MessageId;
use outpost_core::Payload;
use outpost_core::RequestId;
use outpost_core::ResponseBody;
use outpost_core::ResponseId;
use outpost_core::Status;
use outpost_core::StoreError;
use outpost_core::Timestamp;
use outpost_core::interfaces::FlowStart;
use outpost_store_sqlite::SqliteJournalMode;
use outpost_store_sqlite::SqliteOutpostStore;
use outpost_store_sqlite::SqliteStoreConfig;
use outpost_store_sqlite::SqliteSyncMode;

/// Opens a store over a temp directory.
fn open_store() -> (SqliteOutpostStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = SqliteStoreConfig {
        path: dir.path().join("outpost.sqlite"),
        busy_timeout_ms: 1_000,
        journal_mode: SqliteJournalMode::Wal,
        sync_mode: SqliteSyncMode::Normal,
    };
    (SqliteOutpostStore::open(&config).expect("open store"), dir)
}

/// Builds a minimal client row.
fn client(raw: u64, now: Timestamp) -> Client {
    Client::enrolled(
        ClientId::from_raw(raw),
        "-----BEGIN PUBLIC KEY----- test -----END PUBLIC KEY-----".to_string(),
        format!("fp-{raw}"),
        now,
        "198.51.100.4".to_string(),
    )
}

/// Builds a running flow row with one pending request and its message.
fn flow_start(client_id: ClientId, flow_raw: u64, now: Timestamp) -> FlowStart {
    let flow_id = FlowId::from_raw(flow_raw);
    let flow = Flow {
        client_id,
        flow_id,
        parent_flow_id: None,
        parent_request_id: None,
        parent_hunt_id: None,
        flow_name: "ListProcesses".into(),
        args: Payload::Empty,
        creator: "alice".into(),
        created_at: now,
        updated_at: now,
        state: FlowState::Running,
        persistent_state: serde_json::Value::Null,
        cpu_time_used: 0.0,
        network_bytes_sent: 0,
        cpu_limit_seconds: 0.0,
        network_bytes_limit: 0,
        next_request_to_process: RequestId::FIRST,
        next_outbound_id: RequestId::from_raw(2),
        pending_termination: None,
        processing_owner: None,
        processing_deadline: None,
        processing_lease_count: 0,
        error_message: None,
        backtrace: None,
        result_count: 0,
    };
    let request = FlowRequest {
        client_id,
        flow_id,
        request_id: RequestId::FIRST,
        action: Some("ListProcesses".to_string()),
        args: Payload::Empty,
        next_state: "Listing".to_string(),
        needs_processing: false,
        responses_expected: None,
        created_at: now,
    };
    let message = ClientMessage {
        client_id,
        message_id: MessageId::from_raw(1),
        session_id: format!("{client_id}/{flow_id}"),
        flow_id,
        request_id: RequestId::FIRST,
        action: "ListProcesses".to_string(),
        args: Payload::Empty,
        cpu_limit_seconds: 0.0,
        network_bytes_limit: 0,
        require_fastpoll: false,
        lease_owner: None,
        lease_deadline: None,
        lease_count: 0,
        created_at: now,
    };
    FlowStart { flow, requests: vec![request], messages: vec![message], results: Vec::new() }
}

// ============================================================================
// SECTION: Clients
// ============================================================================

/// Tests client persistence, keyword search, and label mutation.
#[test]
fn test_client_round_trip_and_search() {
    let (store, _dir) = open_store();
    let now = Timestamp::from_secs(100);
    let mut row = client(0xBEEF, now);
    row.knowledge_base.os = "Linux".to_string();
    row.knowledge_base.fqdn = "db1.prod.example.com".to_string();
    store.write_client(&row).expect("write");

    let read = store.read_client(row.client_id).expect("read");
    assert_eq!(read, row);

    let by_os = store.query_client_keywords("linux").expect("search");
    assert_eq!(by_os, vec![row.client_id]);
    let by_host = store.query_client_keywords("db1").expect("search");
    assert_eq!(by_host, vec![row.client_id]);

    assert!(matches!(
        store.read_client(ClientId::from_raw(1)),
        Err(StoreError::UnknownClient(_))
    ));
}

// ============================================================================
// SECTION: Flow Lifecycle
// ============================================================================

/// Tests flow creation, duplicate rejection, and lease exclusivity.
#[test]
fn test_flow_create_and_lease_discipline() {
    let (store, _dir) = open_store();
    let now = Timestamp::from_secs(100);
    let row = client(0x1, now);
    store.write_client(&row).expect("write client");

    let start = flow_start(row.client_id, 0x10, now);
    store.create_flow(&start).expect("create flow");
    assert!(matches!(store.create_flow(&start), Err(StoreError::DuplicateKey(_))));

    let lease = DurationMicros::from_secs(600);
    let leased = store
        .lease_flow_for_processing(row.client_id, start.flow.flow_id, "w-a", now, lease)
        .expect("lease");
    assert_eq!(leased.processing_owner.as_deref(), Some("w-a"));
    assert!(matches!(
        store.lease_flow_for_processing(row.client_id, start.flow.flow_id, "w-b", now, lease),
        Err(StoreError::LeaseConflict(_))
    ));

    // Release with a wrong owner is refused.
    let mut released = leased.clone();
    released.processing_owner = None;
    released.processing_deadline = None;
    let plan = outpost_core::FlowPersistencePlan {
        flow: released,
        expected_owner: "w-b".to_string(),
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
    assert!(matches!(store.release_processed_flow(&plan), Err(StoreError::LeaseConflict(_))));
}

/// Tests response completion bookkeeping: status retires the message, marks
/// the request, and enqueues exactly one wake-up.
#[test]
fn test_response_completion_bookkeeping() {
    let (store, _dir) = open_store();
    let now = Timestamp::from_secs(100);
    let row = client(0x2, now);
    store.write_client(&row).expect("write client");
    let start = flow_start(row.client_id, 0x20, now);
    store.create_flow(&start).expect("create flow");

    let flow_id = start.flow.flow_id;
    let responses = vec![
        FlowResponse {
            client_id: row.client_id,
            flow_id,
            request_id: RequestId::FIRST,
            response_id: ResponseId::from_raw(1),
            body: ResponseBody::Message(Payload::Empty),
            received_at: now,
        },
        FlowResponse {
            client_id: row.client_id,
            flow_id,
            request_id: RequestId::FIRST,
            response_id: ResponseId::from_raw(2),
            body: ResponseBody::Status(Status::ok(outpost_core::CpuUsage::default(), 10)),
            received_at: now,
        },
    ];
    store.write_flow_responses(&responses, now).expect("write responses");

    assert!(store.read_client_messages(row.client_id).expect("messages").is_empty());
    let ready = store
        .read_flow_requests_ready_for_processing(row.client_id, flow_id, RequestId::FIRST)
        .expect("ready");
    assert_eq!(ready.len(), 1);
    assert!(ready[0].0.needs_processing);
    assert_eq!(ready[0].0.responses_expected, Some(2));
    assert_eq!(ready[0].1.len(), 2);

    let wakeups = store
        .lease_flow_processing_requests("w-a", now, DurationMicros::from_secs(60), 10)
        .expect("lease wakeups");
    assert_eq!(wakeups.len(), 1);
    // Leased wake-ups are not handed out twice within the lease.
    let again = store
        .lease_flow_processing_requests("w-b", now, DurationMicros::from_secs(60), 10)
        .expect("lease again");
    assert!(again.is_empty());

    store.ack_flow_processing_request(row.client_id, flow_id).expect("ack");
}

/// Tests outbound message leasing: attempt counting and expiry.
#[test]
fn test_client_message_lease_counting() {
    let (store, _dir) = open_store();
    let now = Timestamp::from_secs(100);
    let row = client(0x3, now);
    store.write_client(&row).expect("write client");
    let start = flow_start(row.client_id, 0x30, now);
    store.create_flow(&start).expect("create flow");

    let lease = DurationMicros::from_secs(600);
    let first = store
        .lease_client_messages(row.client_id, "fe", now, lease, 10)
        .expect("lease");
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].lease_count, 1);

    // Still leased: nothing to hand out.
    let during = store
        .lease_client_messages(row.client_id, "fe", now, lease, 10)
        .expect("lease again");
    assert!(during.is_empty());

    // After expiry the lease count keeps growing.
    let later = now.saturating_add(DurationMicros::from_secs(601));
    let second = store
        .lease_client_messages(row.client_id, "fe", later, lease, 10)
        .expect("lease after expiry");
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].lease_count, 2);
}

// ============================================================================
// SECTION: Hunts
// ============================================================================

/// Builds a minimal hunt row.
fn hunt(raw: u64, now: Timestamp) -> Hunt {
    Hunt {
        hunt_id: HuntId::from_raw(raw),
        creator: "alice".into(),
        description: "sweep".to_string(),
        flow_name: "CollectAction".into(),
        flow_args: Payload::Empty,
        client_rule_set: ClientRuleSet::default(),
        client_rate: 0,
        client_limit: 1,
        crash_limit: 0,
        avg_cpu_seconds_per_client_limit: 0.0,
        avg_network_bytes_per_client_limit: 0,
        avg_results_per_client_limit: 0,
        created_at: now,
        state: HuntState::Started,
        num_clients: 0,
        num_successful: 0,
        num_failed: 0,
        num_crashed: 0,
        num_results: 0,
        total_cpu_seconds: 0.0,
        total_network_bytes: 0,
        throttle_window_start: now,
        dispatches_this_window: 0,
    }
}

/// Tests atomic hunt admission against the client limit.
#[test]
fn test_hunt_admission_respects_client_limit() {
    let (store, _dir) = open_store();
    let now = Timestamp::from_secs(100);
    let row = hunt(0x40, now);
    store.write_hunt(&row).expect("write hunt");
    assert!(matches!(store.write_hunt(&row), Err(StoreError::DuplicateKey(_))));

    let window = DurationMicros::from_secs(60);
    let first = store.record_hunt_dispatch(row.hunt_id, now, window).expect("admit");
    assert_eq!(first.decision, HuntAdmissionDecision::Admitted);
    assert_eq!(first.hunt.num_clients, 1);

    let second = store.record_hunt_dispatch(row.hunt_id, now, window).expect("reject");
    assert_eq!(second.decision, HuntAdmissionDecision::LimitReached);
    assert_eq!(second.hunt.num_clients, 1);
}

// ============================================================================
// SECTION: Approvals
// ============================================================================

/// Tests approval persistence, expiry filtering, and grant appending.
#[test]
fn test_approval_round_trip_and_grants() {
    let (store, _dir) = open_store();
    let now = Timestamp::from_secs(100);
    let approval = Approval {
        requestor: "alice".into(),
        approval_type: ApprovalType::Client,
        subject_id: "C.0000000000000001".to_string(),
        approval_id: ApprovalId::from_raw(9),
        reason: "incident".to_string(),
        notified_users: Vec::new(),
        email_cc: Vec::new(),
        expiration: now.saturating_add(DurationMicros::from_secs(3600)),
        grants: Vec::new(),
        created_at: now,
    };
    store.write_approval(&approval).expect("write");

    let grant = Grant { grantor: "bob".into(), timestamp: now };
    store.grant_approval(&approval.requestor, approval.approval_id, &grant).expect("grant");
    let read = store.read_approval(&approval.requestor, approval.approval_id).expect("read");
    assert_eq!(read.grants.len(), 1);

    let fresh = store
        .read_approvals(&approval.requestor, ApprovalType::Client, None, false, now)
        .expect("read fresh");
    assert_eq!(fresh.len(), 1);
    let after_expiry = store
        .read_approvals(
            &approval.requestor,
            ApprovalType::Client,
            None,
            false,
            now.saturating_add(DurationMicros::from_secs(7200)),
        )
        .expect("read expired");
    assert!(after_expiry.is_empty());
}

// ============================================================================
// SECTION: Blobs
// ============================================================================

/// Tests content-addressed blob persistence across reopen.
#[test]
fn test_blob_round_trip_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = SqliteStoreConfig {
        path: dir.path().join("outpost.sqlite"),
        busy_timeout_ms: 1_000,
        journal_mode: SqliteJournalMode::Wal,
        sync_mode: SqliteSyncMode::Normal,
    };
    let content = b"durable bytes".to_vec();
    let id = {
        let store = SqliteOutpostStore::open(&config).expect("open");
        let ids = store.write_blobs(std::slice::from_ref(&content)).expect("write");
        ids[0]
    };
    let store = SqliteOutpostStore::open(&config).expect("reopen");
    assert_eq!(store.read_blobs(&[id]).expect("read")[0], content);
    assert_eq!(store.check_blobs_exist(&[id]).expect("check"), vec![true]);
}
