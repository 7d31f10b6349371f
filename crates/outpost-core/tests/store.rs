// outpost-core/tests/store.rs
// ============================================================================
// Module: In-Memory Store Tests
// Description: Leasing discipline, completion bookkeeping, blobs, and files.
// ============================================================================
//! ## Overview
//! Validates the reference store semantics every backend must mirror:
//! exclusive leases with expiry, response-completion bookkeeping, content
//! addressing, and guarded file reads.

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

use outpost_core::BlobId;
use outpost_core::BlobStore;
use outpost_core::Clock;
use outpost_core::DataStore;
use outpost_core::DurationMicros;
use outpost_core::Payload;
use outpost_core::RequestId;
use outpost_core::StartFlowRequest;
use outpost_core::StoreError;
use outpost_core::hashing::hex_encode;
use outpost_core::hashing::sha256_bytes;
use outpost_core::runtime::InMemoryBlobStore;
use outpost_core::runtime::read_file_bytes;
use outpost_core::runtime::stream_file_chunks;
use outpost_core::runtime::write_file;

use common::enroll_client;
use common::ok_status;
use common::respond;
use common::test_env;

// ============================================================================
// SECTION: Flow Leases
// ============================================================================

/// Tests that concurrent leases on one flow conflict until expiry
/// (exclusive-lease invariant).
#[test]
fn test_flow_lease_is_exclusive_until_expiry() {
    let env = test_env();
    let now = env.clock.now();
    let client_id = enroll_client(env.store.as_ref(), 0x10, "Linux", now);
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

    let lease = DurationMicros::from_secs(600);
    let first = env
        .store
        .lease_flow_for_processing(client_id, flow.flow_id, "worker-a", env.clock.now(), lease)
        .expect("first lease");
    assert_eq!(first.processing_owner.as_deref(), Some("worker-a"));
    assert_eq!(first.processing_lease_count, 1);

    let second = env.store.lease_flow_for_processing(
        client_id,
        flow.flow_id,
        "worker-b",
        env.clock.now(),
        lease,
    );
    assert!(matches!(second, Err(StoreError::LeaseConflict(_))));

    // After expiry another worker takes over and the count increases.
    env.clock.advance(DurationMicros::from_secs(601));
    let taken = env
        .store
        .lease_flow_for_processing(client_id, flow.flow_id, "worker-b", env.clock.now(), lease)
        .expect("lease after expiry");
    assert_eq!(taken.processing_owner.as_deref(), Some("worker-b"));
    assert_eq!(taken.processing_lease_count, 2);
}

// ============================================================================
// SECTION: Completion Bookkeeping
// ============================================================================

/// Tests that the outbound message exists exactly until the terminal status
/// arrives, and that completion marks the request and enqueues a wake-up.
#[test]
fn test_status_retires_message_and_enqueues_processing() {
    let env = test_env();
    let now = env.clock.now();
    let client_id = enroll_client(env.store.as_ref(), 0x11, "Linux", now);
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

    assert_eq!(env.store.read_client_messages(client_id).expect("messages").len(), 1);

    respond(
        env.store.as_ref(),
        client_id,
        flow.flow_id,
        RequestId::FIRST,
        &[],
        ok_status(0.0, 0.0, 0),
        env.clock.now(),
    );

    assert!(env.store.read_client_messages(client_id).expect("messages").is_empty());
    let ready = env
        .store
        .read_flow_requests_ready_for_processing(client_id, flow.flow_id, RequestId::FIRST)
        .expect("ready");
    assert_eq!(ready.len(), 1);
    assert!(ready[0].0.needs_processing);
    assert_eq!(ready[0].0.responses_expected, Some(1));

    let leased = env
        .store
        .lease_flow_processing_requests(
            "worker-a",
            env.clock.now(),
            DurationMicros::from_secs(600),
            10,
        )
        .expect("lease wakeups");
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].flow_id, flow.flow_id);
}

/// Tests that duplicate response writes are idempotent.
#[test]
fn test_duplicate_responses_are_deduplicated() {
    let env = test_env();
    let now = env.clock.now();
    let client_id = enroll_client(env.store.as_ref(), 0x12, "Linux", now);
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

    for _ in 0..2 {
        respond(
            env.store.as_ref(),
            client_id,
            flow.flow_id,
            RequestId::FIRST,
            &[],
            ok_status(0.0, 0.0, 0),
            env.clock.now(),
        );
    }
    let all = env
        .store
        .read_all_flow_requests_and_responses(client_id, flow.flow_id)
        .expect("read all");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].1.len(), 1, "the duplicate status must not be stored twice");
}

// ============================================================================
// SECTION: Blobs
// ============================================================================

/// Tests content addressing: the id is the SHA-256 of the bytes and writes
/// are idempotent.
#[test]
fn test_blob_ids_are_content_addresses() {
    let blobs = InMemoryBlobStore::new();
    let content = b"endpoint investigation bytes".to_vec();
    let ids = blobs.write_blobs(std::slice::from_ref(&content)).expect("write");
    assert_eq!(ids.len(), 1);
    assert_eq!(hex_encode(ids[0].as_bytes()), hex_encode(&sha256_bytes(&content)));

    let again = blobs.write_blobs(std::slice::from_ref(&content)).expect("rewrite");
    assert_eq!(ids, again);

    let read = blobs.read_blobs(&ids).expect("read");
    assert_eq!(read[0], content);

    let missing = BlobId::of(b"never written");
    assert!(matches!(
        blobs.read_blobs(&[missing]),
        Err(StoreError::UnknownBlob(id)) if id == missing
    ));
}

// ============================================================================
// SECTION: Files
// ============================================================================

/// Tests chunked file assembly and the unbounded-read guard.
#[test]
fn test_file_assembly_and_oversized_guard() {
    let blobs = InMemoryBlobStore::new();
    let content: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    let (file_id, references) = write_file(&blobs, &content, 4_096).expect("write file");
    assert_eq!(references.len(), 3);
    assert_eq!(file_id, BlobId::of(&content));

    let chunks = stream_file_chunks(&blobs, &file_id).expect("chunks");
    let reassembled: Vec<u8> =
        chunks.iter().flat_map(|chunk| chunk.data.iter().copied()).collect();
    assert_eq!(reassembled, content);

    // Unbounded reads past the limit fail closed.
    let guarded = read_file_bytes(&blobs, &file_id, 1_000, None);
    assert!(matches!(guarded, Err(StoreError::OversizedRead { .. })));

    // An explicit length overrides the guard.
    let bounded = read_file_bytes(&blobs, &file_id, 1_000, Some(5_000)).expect("bounded read");
    assert_eq!(bounded, content[..5_000]);

    // Small enough files read fully without a length.
    let full = read_file_bytes(&blobs, &file_id, 1_000_000, None).expect("full read");
    assert_eq!(full, content);
}
