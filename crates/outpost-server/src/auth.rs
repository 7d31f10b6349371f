// outpost-server/src/auth.rs
// ============================================================================
// Module: API Authentication
// Description: Bearer-token resolution of API caller identities.
// Purpose: Map externally issued tokens to usernames, fail closed.
// Dependencies: outpost-core, subtle
// ============================================================================

//! ## Overview
//! The API trusts an external issuer for identity: configuration binds
//! bearer tokens to usernames and privilege levels. Token comparison is
//! constant-time across the whole table so lookup timing leaks neither
//! token content nor table position. Authorization (approvals) is layered
//! separately on top of the resolved identity.

// ============================================================================
// SECTION: Imports
// ============================================================================

use subtle::ConstantTimeEq;
use thiserror::Error;

use outpost_core::UserType;
use outpost_core::Username;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum accepted authorization header length.
const MAX_AUTH_HEADER_BYTES: usize = 8 * 1024;
/// Bearer scheme prefix.
const BEARER_PREFIX: &str = "Bearer ";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// API authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No usable authorization header was supplied.
    #[error("missing or malformed authorization header")]
    MissingCredentials,
    /// The supplied token matched no configured user.
    #[error("invalid token")]
    InvalidToken,
}

// ============================================================================
// SECTION: Identities
// ============================================================================

/// Resolved API caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    /// Caller username.
    pub username: Username,
    /// Caller privilege level.
    pub user_type: UserType,
}

/// One configured token binding.
#[derive(Debug, Clone)]
struct TokenEntry {
    /// Token value.
    token: String,
    /// Bound user.
    user: CurrentUser,
}

// ============================================================================
// SECTION: Authenticator
// ============================================================================

/// Bearer-token authenticator over the configured user table.
#[derive(Debug, Default)]
pub struct ApiAuth {
    /// Configured token bindings.
    entries: Vec<TokenEntry>,
}

impl ApiAuth {
    /// Builds an authenticator from `(username, token, user_type)` entries.
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = (Username, String, UserType)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(username, token, user_type)| TokenEntry {
                    token,
                    user: CurrentUser { username, user_type },
                })
                .collect(),
        }
    }

    /// Resolves the caller from an `Authorization` header value.
    ///
    /// The whole table is always scanned so timing does not reveal the
    /// matching entry.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when the header is missing, malformed, or the
    /// token is unknown.
    pub fn authenticate(&self, auth_header: Option<&str>) -> Result<CurrentUser, AuthError> {
        let header = auth_header.ok_or(AuthError::MissingCredentials)?;
        if header.len() > MAX_AUTH_HEADER_BYTES {
            return Err(AuthError::MissingCredentials);
        }
        let token = header.strip_prefix(BEARER_PREFIX).ok_or(AuthError::MissingCredentials)?;
        let mut matched: Option<&CurrentUser> = None;
        for entry in &self.entries {
            if constant_time_str_eq(&entry.token, token) {
                matched = matched.or(Some(&entry.user));
            }
        }
        matched.cloned().ok_or(AuthError::InvalidToken)
    }
}

/// Constant-time string equality including a length check.
fn constant_time_str_eq(left: &str, right: &str) -> bool {
    left.len() == right.len() && left.as_bytes().ct_eq(right.as_bytes()).into()
}
