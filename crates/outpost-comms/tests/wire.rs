// outpost-comms/tests/wire.rs
// ============================================================================
// Module: Wire Codec Tests
// Description: Tagged record encoding properties and bounds.
// ============================================================================
//! ## Overview
//! Validates record round trips (including property-based message lists),
//! unknown-field tolerance, and fail-closed handling of truncated input.

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

use proptest::prelude::*;

use outpost_comms::wire::ClientCommunication;
use outpost_comms::wire::PackedMessageList;
use outpost_comms::wire::WireError;
use outpost_comms::wire::WireMessage;
use outpost_comms::wire::WireMessageType;
use outpost_comms::wire::WireWriter;
use outpost_comms::wire::decode_message_list;
use outpost_comms::wire::encode_message_list;

/// Strategy over arbitrary wire messages.
fn wire_message_strategy() -> impl Strategy<Value = WireMessage> {
    (
        "[a-zA-Z0-9:./]{0,32}",
        any::<u64>(),
        any::<u64>(),
        "[a-zA-Z]{0,16}",
        prop::collection::vec(any::<u8>(), 0..256),
        any::<u64>(),
        any::<u64>(),
        any::<bool>(),
        0u32..3,
    )
        .prop_map(
            |(
                session_id,
                request_id,
                response_id,
                name,
                payload,
                task_id,
                network_bytes_limit,
                require_fastpoll,
                kind,
            )| WireMessage {
                session_id,
                request_id,
                response_id,
                name,
                args_type_name: "Empty".to_string(),
                payload,
                source: String::new(),
                auth_state: 0,
                message_type: match kind {
                    0 => WireMessageType::Message,
                    1 => WireMessageType::Status,
                    _ => WireMessageType::Iterator,
                },
                task_id,
                cpu_limit_micros: 0,
                network_bytes_limit,
                require_fastpoll,
                priority: 1,
            },
        )
}

// ============================================================================
// SECTION: Record Round Trips
// ============================================================================

/// Tests the top-level transport record round trip.
#[test]
fn test_client_communication_round_trip() {
    let record = ClientCommunication {
        encrypted_cipher: vec![1, 2, 3],
        encrypted_cipher_metadata: vec![4, 5],
        packet_iv: vec![0; 16],
        encrypted: vec![9; 48],
        hmac: vec![7; 32],
        full_hmac: vec![8; 32],
        api_version: 3,
        num_messages: 5,
    };
    let decoded = ClientCommunication::decode(&record.encode()).expect("decode");
    assert_eq!(decoded, record);
}

/// Tests the packed list round trip including the nonce timestamp.
#[test]
fn test_packed_message_list_round_trip() {
    let record = PackedMessageList {
        message_list: vec![1, 2, 3, 4],
        compression: outpost_comms::wire::CompressionType::Zlib,
        timestamp: -1,
        source: "C.0000000000000001".to_string(),
    };
    let decoded = PackedMessageList::decode(&record.encode()).expect("decode");
    assert_eq!(decoded, record);
}

/// Tests that unknown fields are skipped for forward compatibility.
#[test]
fn test_unknown_fields_are_skipped() {
    let mut writer = WireWriter::new();
    writer.field_str(1, "wk:log");
    writer.field_u64(99, 12345);
    writer.field_bytes(100, b"future data");
    let decoded = WireMessage::decode(&writer.into_bytes()).expect("decode");
    assert_eq!(decoded.session_id, "wk:log");
}

/// Tests fail-closed handling of truncated input.
#[test]
fn test_truncated_input_fails_closed() {
    let message = WireMessage { session_id: "wk:log".to_string(), ..WireMessage::default() };
    let bytes = message.encode();
    let result = WireMessage::decode(&bytes[..bytes.len() - 1]);
    assert!(matches!(result, Err(WireError::Truncated)));
}

proptest! {
    /// Property: message lists round-trip through the codec, preserving
    /// order.
    #[test]
    fn prop_message_list_round_trip(
        messages in prop::collection::vec(wire_message_strategy(), 0..8)
    ) {
        let encoded = encode_message_list(&messages);
        let decoded = decode_message_list(&encoded).unwrap();
        prop_assert_eq!(decoded, messages);
    }
}
