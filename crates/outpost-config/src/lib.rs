// outpost-config/src/lib.rs
// ============================================================================
// Module: Outpost Config Library
// Description: Public API surface for Outpost configuration.
// Purpose: Expose the config model and loader.
// Dependencies: crate::config
// ============================================================================

//! ## Overview
//! Canonical configuration model for the Outpost server, loaded from TOML
//! with fail-closed validation.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::ApiConfig;
pub use config::ApiUserConfig;
pub use config::ApprovalsConfig;
pub use config::AuthConfig;
pub use config::CONFIG_ENV_VAR;
pub use config::ConfigError;
pub use config::EngineConfig;
pub use config::FrontendConfig;
pub use config::HuntsConfig;
pub use config::LabelPolicyConfig;
pub use config::OutpostConfig;
pub use config::ServerConfig;
pub use config::StoreConfig;
pub use config::UserTypeConfig;
