// outpost-config/tests/config.rs
// ============================================================================
// Module: Config Tests
// Description: Parsing, defaults, and fail-closed validation.
// ============================================================================
//! ## Overview
//! Validates TOML parsing with defaults, unknown-field rejection, and the
//! numeric bounds the server refuses to start without.

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

use outpost_config::ConfigError;
use outpost_config::OutpostConfig;
use outpost_config::StoreConfig;

/// Minimal valid configuration.
const MINIMAL: &str = r#"
[server]
bind_addr = "127.0.0.1:8000"
private_key_path = "keys/server.key.pem"

[store]
backend = "memory"
"#;

/// Tests that the minimal config parses with defaults applied.
#[test]
fn test_minimal_config_parses_with_defaults() {
    let config = OutpostConfig::parse(MINIMAL).expect("parse");
    assert_eq!(config.server.server_name, "outpost-server");
    assert!(matches!(config.store, StoreConfig::Memory));
    assert_eq!(config.frontend.max_retransmissions, 10);
    assert_eq!(config.frontend.message_lease_secs, 600);
    assert_eq!(config.engine.workers, 2);
    assert_eq!(config.approvals.approvers_required, 2);
    assert_eq!(config.api.max_page_size, 1_000);
}

/// Tests the sqlite store section.
#[test]
fn test_sqlite_store_section() {
    let text = r#"
[server]
bind_addr = "127.0.0.1:8000"
private_key_path = "keys/server.key.pem"

[store]
backend = "sqlite"
path = "/var/lib/outpost/outpost.sqlite"
journal_mode = "wal"
sync_mode = "normal"
"#;
    let config = OutpostConfig::parse(text).expect("parse");
    match config.store {
        StoreConfig::Sqlite { sqlite } => {
            assert_eq!(sqlite.path.to_string_lossy(), "/var/lib/outpost/outpost.sqlite");
        }
        StoreConfig::Memory => panic!("expected sqlite backend"),
    }
}

/// Tests unknown-field rejection.
#[test]
fn test_unknown_fields_are_rejected() {
    let text = r#"
[server]
bind_addr = "127.0.0.1:8000"
private_key_path = "keys/server.key.pem"
surprise = true

[store]
backend = "memory"
"#;
    assert!(matches!(OutpostConfig::parse(text), Err(ConfigError::Parse(_))));
}

/// Tests the worker-count bound.
#[test]
fn test_zero_workers_rejected() {
    let text = r#"
[server]
bind_addr = "127.0.0.1:8000"
private_key_path = "keys/server.key.pem"

[store]
backend = "memory"

[engine]
workers = 0
"#;
    assert!(matches!(OutpostConfig::parse(text), Err(ConfigError::Invalid(_))));
}

/// Tests the token-length bound on API users.
#[test]
fn test_short_tokens_rejected() {
    let text = r#"
[server]
bind_addr = "127.0.0.1:8000"
private_key_path = "keys/server.key.pem"

[store]
backend = "memory"

[[auth.users]]
username = "alice"
token = "short"
"#;
    assert!(matches!(OutpostConfig::parse(text), Err(ConfigError::Invalid(_))));
}

/// Tests user catalog conversion including privilege levels.
#[test]
fn test_user_catalog_conversion() {
    let text = r#"
[server]
bind_addr = "127.0.0.1:8000"
private_key_path = "keys/server.key.pem"

[store]
backend = "memory"

[[auth.users]]
username = "alice"
token = "alice-token-0123456789"

[[auth.users]]
username = "bob"
token = "bob-token-0123456789ab"
user_type = "admin"
"#;
    let config = OutpostConfig::parse(text).expect("parse");
    let entries = config.user_catalog_entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|(name, user_type)| {
        name.as_str() == "bob" && matches!(user_type, outpost_core::UserType::Admin)
    }));
}
