// outpost-config/src/config.rs
// ============================================================================
// Module: Outpost Configuration
// Description: Configuration loading and validation for the Outpost server.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: outpost-core, outpost-store-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size limits and
//! unknown-field rejection. Missing or invalid configuration fails closed:
//! the server refuses to start rather than running with defaults it cannot
//! verify. Validated sections convert into the runtime config types of the
//! engine, dispatcher, and approval checker.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use outpost_core::DurationMicros;
use outpost_core::Username;
use outpost_core::UserType;
use outpost_core::runtime::ApprovalCheckerConfig;
use outpost_core::runtime::ClientLabelPolicy;
use outpost_core::runtime::FlowEngineConfig;
use outpost_core::runtime::HuntDispatcherConfig;
use outpost_store_sqlite::SqliteStoreConfig;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "outpost.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "OUTPOST_CONFIG";
/// Maximum configuration file size in bytes.
pub(crate) const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;
/// Maximum number of configured API users.
pub(crate) const MAX_API_USERS: usize = 1024;
/// Maximum length of an API bearer token.
pub(crate) const MAX_TOKEN_LENGTH: usize = 256;
/// Minimum length of an API bearer token.
pub(crate) const MIN_TOKEN_LENGTH: usize = 16;
/// Maximum worker threads for the flow-processing pool.
pub(crate) const MAX_WORKERS: u32 = 64;
/// Maximum page size the API will serve.
pub(crate) const MAX_PAGE_SIZE_CEILING: u64 = 10_000;
/// Maximum messages leased per poll.
pub(crate) const MAX_LEASED_MESSAGES_CEILING: u64 = 1_000;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("config io error: {0}")]
    Io(String),
    /// The config file exceeded the size limit.
    #[error("config file too large: {0} bytes")]
    TooLarge(u64),
    /// The config file failed to parse.
    #[error("config parse error: {0}")]
    Parse(String),
    /// A config value failed validation.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Sections
// ============================================================================

/// Server listener and identity settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address for the HTTP listener.
    pub bind_addr: SocketAddr,
    /// Common name embedded in signed cipher metadata.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Path to the server's PKCS#8 RSA private key PEM.
    pub private_key_path: PathBuf,
    /// Path to the code-signing public key PEM, when binary delivery is on.
    #[serde(default)]
    pub signing_public_key_path: Option<PathBuf>,
    /// Maximum concurrently served requests.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: u32,
}

/// Returns the default server common name.
fn default_server_name() -> String {
    "outpost-server".to_string()
}

/// Returns the default inflight request bound.
const fn default_max_inflight() -> u32 {
    256
}

/// Storage backend selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum StoreConfig {
    /// In-memory store; state is lost on restart.
    Memory,
    /// Durable `SQLite` store.
    Sqlite {
        /// `SQLite` store settings.
        #[serde(flatten)]
        sqlite: SqliteStoreConfig,
    },
}

/// Front-end poll handling settings.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FrontendConfig {
    /// Maximum outbound messages leased per poll.
    #[serde(default = "default_max_leased_messages")]
    pub max_leased_messages: u64,
    /// Outbound message lease duration in seconds.
    #[serde(default = "default_message_lease_secs")]
    pub message_lease_secs: u64,
    /// Delivery attempts before a message is dropped.
    #[serde(default = "default_max_retransmissions")]
    pub max_retransmissions: u64,
    /// Minimum seconds between per-client foreman hunt checks.
    #[serde(default = "default_foreman_interval_secs")]
    pub foreman_check_interval_secs: u64,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            max_leased_messages: default_max_leased_messages(),
            message_lease_secs: default_message_lease_secs(),
            max_retransmissions: default_max_retransmissions(),
            foreman_check_interval_secs: default_foreman_interval_secs(),
        }
    }
}

/// Returns the default leased-message bound.
const fn default_max_leased_messages() -> u64 {
    100
}

/// Returns the default message lease in seconds.
const fn default_message_lease_secs() -> u64 {
    600
}

/// Returns the default retransmission limit in attempts.
const fn default_max_retransmissions() -> u64 {
    10
}

/// Returns the default foreman check interval in seconds.
const fn default_foreman_interval_secs() -> u64 {
    1800
}

/// Flow-processing worker settings.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Worker tasks in the processing pool.
    #[serde(default = "default_workers")]
    pub workers: u32,
    /// Idle poll interval of the processing queue in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Flow processing lease duration in seconds.
    #[serde(default = "default_flow_lease_secs")]
    pub flow_lease_secs: u64,
    /// Processing wake-ups leased per worker pass.
    #[serde(default = "default_processing_batch")]
    pub processing_batch: u64,
    /// Default per-flow CPU budget in seconds; zero unlimited.
    #[serde(default)]
    pub default_cpu_limit_seconds: f64,
    /// Default per-flow network budget in bytes; zero unlimited.
    #[serde(default)]
    pub default_network_bytes_limit: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            flow_lease_secs: default_flow_lease_secs(),
            processing_batch: default_processing_batch(),
            default_cpu_limit_seconds: 0.0,
            default_network_bytes_limit: 0,
        }
    }
}

/// Returns the default worker count.
const fn default_workers() -> u32 {
    2
}

/// Returns the default queue poll interval in milliseconds.
const fn default_poll_interval_ms() -> u64 {
    500
}

/// Returns the default flow lease in seconds.
const fn default_flow_lease_secs() -> u64 {
    600
}

/// Returns the default processing batch size.
const fn default_processing_batch() -> u64 {
    32
}

/// Hunt dispatcher settings.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HuntsConfig {
    /// Throttle window in seconds backing the per-minute client rate.
    #[serde(default = "default_throttle_window_secs")]
    pub throttle_window_secs: u64,
    /// Page size for full-fleet scans.
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: u64,
}

impl Default for HuntsConfig {
    fn default() -> Self {
        Self {
            throttle_window_secs: default_throttle_window_secs(),
            scan_page_size: default_scan_page_size(),
        }
    }
}

/// Returns the default throttle window in seconds.
const fn default_throttle_window_secs() -> u64 {
    60
}

/// Returns the default scan page size.
const fn default_scan_page_size() -> u64 {
    512
}

/// Label-attached approval grantor policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LabelPolicyConfig {
    /// Label the policy applies to.
    pub label: String,
    /// Usernames of which at least one must grant.
    pub mandatory_grantors: Vec<String>,
}

/// Approval subsystem settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ApprovalsConfig {
    /// Distinct grants required for a valid approval.
    #[serde(default = "default_approvers_required")]
    pub approvers_required: u32,
    /// Positive-check cache lifetime in seconds.
    #[serde(default = "default_approval_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Lifetime of new approvals in seconds.
    #[serde(default = "default_approval_expiry_secs")]
    pub default_expiry_secs: u64,
    /// Label-attached grantor policies.
    #[serde(default)]
    pub label_policies: Vec<LabelPolicyConfig>,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            approvers_required: default_approvers_required(),
            cache_ttl_secs: default_approval_cache_ttl_secs(),
            default_expiry_secs: default_approval_expiry_secs(),
            label_policies: Vec::new(),
        }
    }
}

/// Returns the default grant quorum.
const fn default_approvers_required() -> u32 {
    2
}

/// Returns the default approval cache TTL in seconds.
const fn default_approval_cache_ttl_secs() -> u64 {
    60
}

/// Returns the default approval lifetime in seconds.
const fn default_approval_expiry_secs() -> u64 {
    28 * 24 * 3600
}

/// API surface settings.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    /// Hard maximum page size.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u64,
    /// Unbounded file read limit in bytes.
    #[serde(default = "default_unbounded_read_limit")]
    pub unbounded_read_limit: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            max_page_size: default_max_page_size(),
            unbounded_read_limit: default_unbounded_read_limit(),
        }
    }
}

/// Returns the default maximum page size.
const fn default_max_page_size() -> u64 {
    1_000
}

/// Returns the default unbounded read limit.
const fn default_unbounded_read_limit() -> u64 {
    10 * 1024 * 1024
}

/// Privilege level names accepted in user entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserTypeConfig {
    /// Regular user.
    Standard,
    /// Administrator.
    Admin,
}

impl From<UserTypeConfig> for UserType {
    fn from(value: UserTypeConfig) -> Self {
        match value {
            UserTypeConfig::Standard => Self::Standard,
            UserTypeConfig::Admin => Self::Admin,
        }
    }
}

/// One API user with its bearer token.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ApiUserConfig {
    /// Username asserted for this token.
    pub username: String,
    /// Bearer token value.
    pub token: String,
    /// Privilege level.
    #[serde(default = "default_user_type")]
    pub user_type: UserTypeConfig,
}

/// Returns the default user privilege level.
const fn default_user_type() -> UserTypeConfig {
    UserTypeConfig::Standard
}

/// API authentication settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Configured API users.
    #[serde(default)]
    pub users: Vec<ApiUserConfig>,
}

// ============================================================================
// SECTION: Root Config
// ============================================================================

/// Root configuration for the Outpost server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OutpostConfig {
    /// Server listener and identity settings.
    pub server: ServerConfig,
    /// Storage backend.
    pub store: StoreConfig,
    /// Front-end poll settings.
    #[serde(default)]
    pub frontend: FrontendConfig,
    /// Flow-processing worker settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Hunt dispatcher settings.
    #[serde(default)]
    pub hunts: HuntsConfig,
    /// Approval subsystem settings.
    #[serde(default)]
    pub approvals: ApprovalsConfig,
    /// API surface settings.
    #[serde(default)]
    pub api: ApiConfig,
    /// API authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,
}

impl OutpostConfig {
    /// Loads and validates configuration.
    ///
    /// Resolution order: explicit path, then the `OUTPOST_CONFIG`
    /// environment variable, then `outpost.toml` in the working directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file is missing, oversized,
    /// unparsable, or invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => env::var(CONFIG_ENV_VAR)
                .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_NAME), PathBuf::from),
        };
        let metadata = fs::metadata(&path).map_err(|err| ConfigError::Io(err.to_string()))?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::TooLarge(metadata.len()));
        }
        let text = fs::read_to_string(&path).map_err(|err| ConfigError::Io(err.to_string()))?;
        Self::parse(&text)
    }

    /// Parses and validates configuration text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] on any violated bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.workers == 0 || self.engine.workers > MAX_WORKERS {
            return Err(ConfigError::Invalid(format!(
                "engine.workers must be in 1..={MAX_WORKERS}"
            )));
        }
        if self.frontend.max_leased_messages == 0
            || self.frontend.max_leased_messages > MAX_LEASED_MESSAGES_CEILING
        {
            return Err(ConfigError::Invalid(format!(
                "frontend.max_leased_messages must be in 1..={MAX_LEASED_MESSAGES_CEILING}"
            )));
        }
        if self.api.max_page_size == 0 || self.api.max_page_size > MAX_PAGE_SIZE_CEILING {
            return Err(ConfigError::Invalid(format!(
                "api.max_page_size must be in 1..={MAX_PAGE_SIZE_CEILING}"
            )));
        }
        if self.approvals.approvers_required == 0 {
            return Err(ConfigError::Invalid(
                "approvals.approvers_required must be at least 1".to_string(),
            ));
        }
        if self.auth.users.len() > MAX_API_USERS {
            return Err(ConfigError::Invalid(format!(
                "auth.users exceeds the limit of {MAX_API_USERS}"
            )));
        }
        for user in &self.auth.users {
            if user.username.is_empty() {
                return Err(ConfigError::Invalid("auth user with empty username".to_string()));
            }
            if user.token.len() < MIN_TOKEN_LENGTH || user.token.len() > MAX_TOKEN_LENGTH {
                return Err(ConfigError::Invalid(format!(
                    "token for {} must be {MIN_TOKEN_LENGTH}..={MAX_TOKEN_LENGTH} bytes",
                    user.username
                )));
            }
        }
        for policy in &self.approvals.label_policies {
            if policy.label.is_empty() || policy.mandatory_grantors.is_empty() {
                return Err(ConfigError::Invalid(
                    "label policy needs a label and at least one grantor".to_string(),
                ));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Runtime conversions
    // ------------------------------------------------------------------

    /// Builds the flow engine configuration.
    #[must_use]
    pub fn engine_config(&self) -> FlowEngineConfig {
        FlowEngineConfig {
            flow_lease: DurationMicros::from_secs(self.engine.flow_lease_secs.cast_signed()),
            message_lease: DurationMicros::from_secs(
                self.frontend.message_lease_secs.cast_signed(),
            ),
            processing_lease: DurationMicros::from_secs(self.engine.flow_lease_secs.cast_signed()),
            max_retransmissions: self.frontend.max_retransmissions,
            max_leased_messages: self.frontend.max_leased_messages,
            processing_batch: self.engine.processing_batch,
        }
    }

    /// Builds the hunt dispatcher configuration.
    #[must_use]
    pub fn hunt_config(&self) -> HuntDispatcherConfig {
        HuntDispatcherConfig {
            throttle_window: DurationMicros::from_secs(
                self.hunts.throttle_window_secs.cast_signed(),
            ),
            foreman_check_interval: DurationMicros::from_secs(
                self.frontend.foreman_check_interval_secs.cast_signed(),
            ),
            scan_page_size: self.hunts.scan_page_size,
        }
    }

    /// Builds the approval checker configuration.
    #[must_use]
    pub fn approval_config(&self) -> ApprovalCheckerConfig {
        ApprovalCheckerConfig {
            approvers_required: self.approvals.approvers_required,
            cache_ttl: DurationMicros::from_secs(self.approvals.cache_ttl_secs.cast_signed()),
            default_expiry: DurationMicros::from_secs(
                self.approvals.default_expiry_secs.cast_signed(),
            ),
            client_label_policies: self
                .approvals
                .label_policies
                .iter()
                .map(|policy| ClientLabelPolicy {
                    label: policy.label.clone(),
                    mandatory_grantors: policy
                        .mandatory_grantors
                        .iter()
                        .map(|name| Username::new(name.clone()))
                        .collect(),
                })
                .collect(),
        }
    }

    /// Returns the configured `(username, user_type)` pairs.
    #[must_use]
    pub fn user_catalog_entries(&self) -> Vec<(Username, UserType)> {
        self.auth
            .users
            .iter()
            .map(|user| (Username::new(user.username.clone()), user.user_type.into()))
            .collect()
    }
}
