// outpost-core/tests/identifiers.rs
// ============================================================================
// Module: Identifier Tests
// Description: String-form round trips for ids and session routing.
// ============================================================================
//! ## Overview
//! Validates the fixed-width hex forms, strict parsing, and long flow
//! session id composition.

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

use outpost_core::ClientId;
use outpost_core::FlowId;
use outpost_core::HuntId;
use outpost_core::SessionId;

/// Tests the documented client id rendering.
#[test]
fn test_client_id_display_form() {
    let client_id = ClientId::from_raw(0x0123_4567_89ab_cdef);
    assert_eq!(client_id.to_string(), "C.0123456789abcdef");
    assert_eq!("C.0123456789abcdef".parse::<ClientId>().expect("parse"), client_id);
}

/// Tests the documented flow and hunt id renderings.
#[test]
fn test_flow_and_hunt_id_display_forms() {
    let flow_id = FlowId::from_raw(0x0123_4567_89AB_CDEF);
    assert_eq!(flow_id.to_string(), "0123456789ABCDEF");
    let hunt_id = HuntId::from_raw(0xFF);
    assert_eq!(hunt_id.to_string(), "H:00000000000000FF");
}

/// Tests strict rejection of malformed identifier strings.
#[test]
fn test_malformed_ids_are_rejected() {
    assert!("0123456789abcdef".parse::<ClientId>().is_err(), "missing prefix");
    assert!("C.123".parse::<ClientId>().is_err(), "short hex");
    assert!("C.zzzzzzzzzzzzzzzz".parse::<ClientId>().is_err(), "non-hex");
    assert!("123".parse::<FlowId>().is_err(), "short flow id");
    assert!("H:123".parse::<HuntId>().is_err(), "short hunt id");
}

/// Tests long flow session id composition and well-known forms.
#[test]
fn test_session_id_round_trips() {
    let client_id = ClientId::from_raw(7);
    let flow_id = FlowId::from_raw(9);
    let session = SessionId::for_flow(client_id, flow_id);
    let rendered = session.to_string();
    assert_eq!(rendered, "C.0000000000000007/0000000000000009");
    assert_eq!(rendered.parse::<SessionId>().expect("parse"), session);
    assert_eq!(session.leaf_flow_id(), Some(flow_id));

    let well_known = SessionId::well_known("enrollment");
    assert_eq!(well_known.to_string(), "wk:enrollment");
    assert_eq!(well_known.well_known_name(), Some("enrollment"));
    assert!("wk:enrollment".parse::<SessionId>().expect("parse").well_known_name().is_some());
}

proptest! {
    /// Property: every client id round-trips through its string form.
    #[test]
    fn prop_client_id_round_trip(raw in any::<u64>()) {
        let client_id = ClientId::from_raw(raw);
        prop_assert_eq!(client_id.to_string().parse::<ClientId>().unwrap(), client_id);
    }

    /// Property: every nested session id round-trips through its string
    /// form.
    #[test]
    fn prop_session_id_round_trip(client in any::<u64>(), flows in prop::collection::vec(any::<u64>(), 1..4)) {
        let session = SessionId::Flow {
            client_id: ClientId::from_raw(client),
            path: flows.into_iter().map(FlowId::from_raw).collect(),
        };
        prop_assert_eq!(session.to_string().parse::<SessionId>().unwrap(), session);
    }
}
