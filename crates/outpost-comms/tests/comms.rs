// outpost-comms/tests/comms.rs
// ============================================================================
// Module: Communicator Tests
// Description: Bundle round trips, tamper rejection, and enrollment paths.
// ============================================================================
//! ## Overview
//! Validates authenticated encryption end to end between two communicators,
//! HMAC-first rejection of tampered packets, nonce echo verification,
//! compression, and code signing.

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

use outpost_comms::CommsError;
use outpost_comms::Communicator;
use outpost_comms::PrivateKey;
use outpost_comms::StaticPeerKeys;
use outpost_comms::sign_blob;
use outpost_comms::verify_blob;
use outpost_comms::wire::ClientCommunication;
use outpost_core::AgentMessage;
use outpost_core::AuthState;
use outpost_core::Payload;
use outpost_core::Priority;
use outpost_core::RequestId;
use outpost_core::ResponseBody;
use outpost_core::ResponseId;
use outpost_core::SessionId;
use outpost_core::Timestamp;
use outpost_core::payload::LogMessage;

/// Test fixture: a server and an agent communicator that pin each other.
struct Pair {
    /// Server-side communicator.
    server: Communicator,
    /// Agent-side communicator.
    agent: Communicator,
    /// Agent common name.
    agent_name: String,
}

/// Builds the mutually pinned pair.
fn pair() -> Pair {
    let server_key = PrivateKey::generate().expect("server key");
    let agent_key = PrivateKey::generate().expect("agent key");
    let agent_name =
        agent_key.public_key().client_id().expect("agent client id").to_string();

    let server = Communicator::new(
        "outpost-server",
        server_key.clone(),
        Arc::new(StaticPeerKeys::new([(agent_name.clone(), agent_key.public_key())])),
    );
    let agent = Communicator::new(
        agent_name.clone(),
        agent_key,
        Arc::new(StaticPeerKeys::new([(
            "outpost-server".to_string(),
            server_key.public_key(),
        )])),
    );
    Pair { server, agent, agent_name }
}

/// Builds a small log message for a flow session.
fn log_message(text: &str) -> AgentMessage {
    AgentMessage {
        session_id: SessionId::well_known("log"),
        request_id: RequestId::from_raw(0),
        response_id: ResponseId::from_raw(0),
        name: None,
        body: ResponseBody::Message(Payload::LogMessage(LogMessage {
            level: "info".to_string(),
            message: text.to_string(),
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
// SECTION: Round Trips
// ============================================================================

/// Tests agent-to-server encryption, authentication, and decoding.
#[test]
fn test_bundle_round_trip_is_authenticated() {
    let pair = pair();
    let now = Timestamp::from_secs(1_000);
    let nonce = Timestamp::from_micros(42_000_000);

    let messages = vec![log_message("hello"), log_message("world")];
    let bytes = pair
        .agent
        .encode_bundle("outpost-server", &messages, nonce, now)
        .expect("encode");

    let decoded = pair.server.decode_bundle(&bytes, None).expect("decode");
    assert!(decoded.authenticated);
    assert_eq!(decoded.source, pair.agent_name);
    assert_eq!(decoded.nonce, nonce.as_micros());
    assert_eq!(decoded.messages.len(), 2);
    for message in &decoded.messages {
        assert_eq!(message.auth_state, AuthState::Authenticated);
    }
    assert!(pair.agent.sent_bytes() > 0);
    assert!(pair.server.received_bytes() > 0);
}

/// Tests the server reply path with nonce echo verification on the agent.
#[test]
fn test_reply_nonce_echo_verification() {
    let pair = pair();
    let now = Timestamp::from_secs(1_000);
    let nonce = Timestamp::from_micros(77_000_000);

    let reply = pair
        .server
        .encode_bundle(&pair.agent_name, &[log_message("ack")], nonce, now)
        .expect("encode reply");

    let good = pair.agent.decode_bundle(&reply, Some(nonce.as_micros())).expect("decode");
    assert!(good.authenticated, "matching nonce echo must authenticate");

    let bad = pair.agent.decode_bundle(&reply, Some(nonce.as_micros() + 1)).expect("decode");
    assert!(!bad.authenticated, "a mismatched nonce marks the bundle unauthenticated");
    assert!(bad.messages.iter().all(|m| m.auth_state == AuthState::Unauthenticated));
}

/// Tests that large repetitive payloads take the zlib path and round-trip.
#[test]
fn test_compression_round_trip() {
    let pair = pair();
    let now = Timestamp::from_secs(1_000);
    let text = "a".repeat(64 * 1024);
    let bytes = pair
        .agent
        .encode_bundle(
            "outpost-server",
            &[log_message(&text)],
            Timestamp::from_micros(1),
            now,
        )
        .expect("encode");
    // The sealed bundle must be far smaller than the raw payload.
    assert!(bytes.len() < text.len() / 2, "zlib should have been chosen");

    let decoded = pair.server.decode_bundle(&bytes, None).expect("decode");
    match &decoded.messages[0].body {
        ResponseBody::Message(Payload::LogMessage(log)) => assert_eq!(log.message, text),
        other => panic!("unexpected body: {other:?}"),
    }
}

// ============================================================================
// SECTION: Tampering
// ============================================================================

/// Tests HMAC-first rejection: flipping one ciphertext bit drops the bundle
/// with zero side effects.
#[test]
fn test_tampered_ciphertext_fails_hmac() {
    let pair = pair();
    let now = Timestamp::from_secs(1_000);
    let bytes = pair
        .agent
        .encode_bundle("outpost-server", &[log_message("x")], Timestamp::from_micros(1), now)
        .expect("encode");

    let mut record = ClientCommunication::decode(&bytes).expect("decode record");
    let last = record.encrypted.len() - 1;
    record.encrypted[last] ^= 0x01;
    let tampered = record.encode();

    let result = pair.server.decode_bundle(&tampered, None);
    assert!(
        matches!(result, Err(CommsError::Crypto(_))),
        "tampered packets must fail closed, got {result:?}"
    );
}

/// Tests that an unknown sender decodes as unauthenticated (the enrollment
/// path) rather than erroring.
#[test]
fn test_unknown_sender_is_unauthenticated() {
    let server_key = PrivateKey::generate().expect("server key");
    let stranger_key = PrivateKey::generate().expect("stranger key");
    let server = Communicator::new(
        "outpost-server",
        server_key.clone(),
        Arc::new(StaticPeerKeys::new([])),
    );
    let stranger = Communicator::new(
        "C.00000000000000aa",
        stranger_key,
        Arc::new(StaticPeerKeys::new([(
            "outpost-server".to_string(),
            server_key.public_key(),
        )])),
    );

    let bytes = stranger
        .encode_bundle(
            "outpost-server",
            &[log_message("who am i")],
            Timestamp::from_micros(5),
            Timestamp::from_secs(1),
        )
        .expect("encode");
    let decoded = server.decode_bundle(&bytes, None).expect("decode");
    assert!(!decoded.authenticated);
    assert!(decoded.messages.iter().all(|m| m.auth_state == AuthState::Unauthenticated));
}

// ============================================================================
// SECTION: Code Signing
// ============================================================================

/// Tests blob signing against the pinned code-signing key.
#[test]
fn test_blob_signing_round_trip() {
    let signing_key = PrivateKey::generate().expect("signing key");
    let blob = b"#!/bin/sh\necho collector\n";
    let signature = sign_blob(&signing_key, blob).expect("sign");
    verify_blob(&signing_key.public_key(), blob, &signature).expect("verify");

    let mut corrupted = blob.to_vec();
    corrupted[0] ^= 0xff;
    assert!(verify_blob(&signing_key.public_key(), &corrupted, &signature).is_err());
}

// ============================================================================
// SECTION: Identity Derivation
// ============================================================================

/// Tests that client ids derive deterministically from public keys.
#[test]
fn test_client_id_derivation_is_stable() {
    let key = PrivateKey::generate().expect("key");
    let first = key.public_key().client_id().expect("client id");
    let second = key.public_key().client_id().expect("client id");
    assert_eq!(first, second);
    let fingerprint = key.public_key().fingerprint().expect("fingerprint");
    assert_eq!(fingerprint.len(), 64);
    assert!(first.to_string().starts_with("C."));
}
