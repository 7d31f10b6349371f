// outpost-core/src/runtime/approvals.rs
// ============================================================================
// Module: Outpost Approval Checker
// Description: Server-side authorization predicate for scoped operations.
// Purpose: Evaluate approvals with quorum, expiry, and admin rules.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! Every client-, hunt-, or cron-scoped API call passes through the approval
//! checker before reaching the underlying subsystem. An approval is valid iff
//! it has not expired, carries at least the configured number of distinct
//! grants, and (for hunts and cron jobs) at least one grantor is an admin.
//! Client approvals additionally honor label-attached grantor policies. The
//! first passing approval is cached briefly; failure messages are aggregated
//! per check and never include approvals from other users.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;

use crate::core::approval::Approval;
use crate::core::approval::ApprovalType;
use crate::core::approval::Grant;
use crate::core::approval::UserType;
use crate::core::identifiers::ApprovalId;
use crate::core::identifiers::ClientId;
use crate::core::identifiers::HuntId;
use crate::core::identifiers::Username;
use crate::core::time::DurationMicros;
use crate::core::time::Timestamp;
use crate::interfaces::Clock;
use crate::interfaces::DataStore;
use crate::interfaces::IdGenerator;
use crate::interfaces::StoreError;
use crate::runtime::flows::FlowRegistry;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Grantor policy attached to a client label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientLabelPolicy {
    /// Label the policy applies to.
    pub label: String,
    /// Usernames of which at least one must have granted the approval.
    pub mandatory_grantors: Vec<Username>,
}

/// Configuration for the approval checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalCheckerConfig {
    /// Number of distinct grants required for a valid approval.
    pub approvers_required: u32,
    /// Time-to-live of cached positive checks.
    pub cache_ttl: DurationMicros,
    /// Default lifetime of newly requested approvals.
    pub default_expiry: DurationMicros,
    /// Label-attached grantor policies for client approvals.
    pub client_label_policies: Vec<ClientLabelPolicy>,
}

impl Default for ApprovalCheckerConfig {
    fn default() -> Self {
        Self {
            approvers_required: 2,
            cache_ttl: DurationMicros::from_secs(60),
            default_expiry: DurationMicros::from_secs(28 * 24 * 3600),
            client_label_policies: Vec::new(),
        }
    }
}

// ============================================================================
// SECTION: User Catalog
// ============================================================================

/// Source of user privilege levels.
pub trait UserCatalog: Send + Sync {
    /// Returns the privilege level for a username. Unknown users are
    /// standard.
    fn user_type(&self, username: &Username) -> UserType;
}

/// Static user catalog backed by a map.
#[derive(Debug, Default)]
pub struct StaticUserCatalog {
    /// Username to privilege level map.
    users: HashMap<Username, UserType>,
}

impl StaticUserCatalog {
    /// Creates a catalog from `(username, user_type)` pairs.
    #[must_use]
    pub fn new(users: impl IntoIterator<Item = (Username, UserType)>) -> Self {
        Self { users: users.into_iter().collect() }
    }
}

impl UserCatalog for StaticUserCatalog {
    fn user_type(&self, username: &Username) -> UserType {
        self.users.get(username).copied().unwrap_or(UserType::Standard)
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Approval checker errors.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No valid approval exists for the caller and subject.
    #[error("unauthorized access to {subject}: {message}")]
    Unauthorized {
        /// Subject the access was denied to.
        subject: String,
        /// Aggregated reasons the caller's approvals failed.
        message: String,
    },
    /// Data store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// SECTION: Approval Checker
// ============================================================================

/// Cache key for positive checks.
type CacheKey = (Username, ApprovalType, String);

/// Server-side authorization predicate with a short positive-result cache.
pub struct ApprovalChecker {
    /// Data store backend.
    store: Arc<dyn DataStore>,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Identifier source for approval ids.
    ids: Arc<dyn IdGenerator>,
    /// User privilege catalog.
    catalog: Arc<dyn UserCatalog>,
    /// Checker configuration.
    config: ApprovalCheckerConfig,
    /// Positive check cache: key to insertion time.
    cache: Mutex<HashMap<CacheKey, Timestamp>>,
}

impl ApprovalChecker {
    /// Creates a new approval checker.
    #[must_use]
    pub fn new(
        store: Arc<dyn DataStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        catalog: Arc<dyn UserCatalog>,
        config: ApprovalCheckerConfig,
    ) -> Self {
        Self { store, clock, ids, catalog, config, cache: Mutex::new(HashMap::new()) }
    }

    /// Returns the privilege level of a user.
    #[must_use]
    pub fn user_type(&self, username: &Username) -> UserType {
        self.catalog.user_type(username)
    }

    // ------------------------------------------------------------------
    // Creation and grants
    // ------------------------------------------------------------------

    /// Creates an approval request expiring after the configured lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Store`] when the write fails.
    pub fn request_approval(
        &self,
        requestor: Username,
        approval_type: ApprovalType,
        subject_id: String,
        reason: String,
        notified_users: Vec<Username>,
        email_cc: Vec<String>,
    ) -> Result<Approval, ApprovalError> {
        let now = self.clock.now();
        let approval = Approval {
            requestor,
            approval_type,
            subject_id,
            approval_id: ApprovalId::from_raw(self.ids.next_id()),
            reason,
            notified_users,
            email_cc,
            expiration: now.saturating_add(self.config.default_expiry),
            grants: Vec::new(),
            created_at: now,
        };
        self.store.write_approval(&approval)?;
        Ok(approval)
    }

    /// Grants an approval on behalf of a grantor.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Store`] when the approval does not exist.
    pub fn grant_approval(
        &self,
        requestor: &Username,
        approval_id: ApprovalId,
        grantor: Username,
    ) -> Result<(), ApprovalError> {
        let grant = Grant { grantor, timestamp: self.clock.now() };
        self.store.grant_approval(requestor, approval_id, &grant)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Predicates
    // ------------------------------------------------------------------

    /// Checks client access for a user.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Unauthorized`] when no approval passes.
    pub fn check_client_access(
        &self,
        user: &Username,
        client_id: ClientId,
    ) -> Result<(), ApprovalError> {
        self.check_access(user, ApprovalType::Client, &client_id.to_string())
    }

    /// Checks hunt access for a user.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Unauthorized`] when no approval passes.
    pub fn check_hunt_access(&self, user: &Username, hunt_id: HuntId) -> Result<(), ApprovalError> {
        self.check_access(user, ApprovalType::Hunt, &hunt_id.to_string())
    }

    /// Checks cron job access for a user.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Unauthorized`] when no approval passes.
    pub fn check_cron_job_access(
        &self,
        user: &Username,
        cron_job_id: &str,
    ) -> Result<(), ApprovalError> {
        self.check_access(user, ApprovalType::CronJob, cron_job_id)
    }

    /// Checks that a user may start the named flow class.
    ///
    /// Restricted classes require an admin caller regardless of approvals.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Unauthorized`] for non-admin callers of
    /// restricted classes.
    pub fn check_flow_restrictions(
        &self,
        user: &Username,
        flow_name: &str,
    ) -> Result<(), ApprovalError> {
        if FlowRegistry::is_restricted(flow_name) && !self.catalog.user_type(user).is_admin() {
            return Err(ApprovalError::Unauthorized {
                subject: flow_name.to_string(),
                message: format!("flow class {flow_name} requires an admin caller"),
            });
        }
        Ok(())
    }

    /// Core predicate: finds the first valid approval, caching positives.
    fn check_access(
        &self,
        user: &Username,
        approval_type: ApprovalType,
        subject_id: &str,
    ) -> Result<(), ApprovalError> {
        let now = self.clock.now();
        let key: CacheKey = (user.clone(), approval_type, subject_id.to_string());
        if self.cache_hit(&key, now) {
            return Ok(());
        }

        let approvals =
            self.store.read_approvals(user, approval_type, Some(subject_id), false, now)?;
        if approvals.is_empty() {
            return Err(ApprovalError::Unauthorized {
                subject: subject_id.to_string(),
                message: "no approval found".to_string(),
            });
        }

        let mut failures = Vec::new();
        for approval in &approvals {
            match self.validate_approval(approval, now) {
                Ok(()) => {
                    self.cache_insert(key, now);
                    return Ok(());
                }
                Err(reason) => failures.push(format!("{}: {reason}", approval.approval_id)),
            }
        }
        Err(ApprovalError::Unauthorized {
            subject: subject_id.to_string(),
            message: failures.join("; "),
        })
    }

    /// Validates one approval against expiry, quorum, and policy rules.
    fn validate_approval(&self, approval: &Approval, now: Timestamp) -> Result<(), String> {
        if approval.is_expired(now) {
            return Err("approval expired".to_string());
        }
        let grantors = approval.grantors();
        if (grantors.len() as u64) < u64::from(self.config.approvers_required) {
            return Err(format!(
                "need at least {} approvers, got {}",
                self.config.approvers_required,
                grantors.len()
            ));
        }
        match approval.approval_type {
            ApprovalType::Hunt | ApprovalType::CronJob => {
                let has_admin =
                    grantors.iter().any(|grantor| self.catalog.user_type(grantor).is_admin());
                if !has_admin {
                    return Err("needs at least one admin grantor".to_string());
                }
            }
            ApprovalType::Client => {
                self.validate_client_label_policies(approval, &grantors)?;
            }
        }
        Ok(())
    }

    /// Applies label-attached grantor policies for client approvals.
    fn validate_client_label_policies(
        &self,
        approval: &Approval,
        grantors: &[&Username],
    ) -> Result<(), String> {
        if self.config.client_label_policies.is_empty() {
            return Ok(());
        }
        let client_id: ClientId = approval
            .subject_id
            .parse()
            .map_err(|_| format!("malformed client subject: {}", approval.subject_id))?;
        let labels = match self.store.read_client_labels(client_id) {
            Ok(labels) => labels,
            Err(StoreError::UnknownClient(_)) => return Ok(()),
            Err(err) => return Err(err.to_string()),
        };
        for policy in &self.config.client_label_policies {
            let applies = labels.iter().any(|label| label.name == policy.label);
            if !applies {
                continue;
            }
            let satisfied = grantors
                .iter()
                .any(|grantor| policy.mandatory_grantors.iter().any(|name| name == *grantor));
            if !satisfied {
                return Err(format!(
                    "label {} requires a grant from one of its approvers",
                    policy.label
                ));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cache
    // ------------------------------------------------------------------

    /// Returns true when a fresh positive check is cached.
    fn cache_hit(&self, key: &CacheKey, now: Timestamp) -> bool {
        self.cache.lock().is_ok_and(|guard| {
            guard.get(key).is_some_and(|inserted| now.since(*inserted) < self.config.cache_ttl)
        })
    }

    /// Caches a positive check, pruning stale entries.
    fn cache_insert(&self, key: CacheKey, now: Timestamp) {
        if let Ok(mut guard) = self.cache.lock() {
            guard.retain(|_, inserted| now.since(*inserted) < self.config.cache_ttl);
            guard.insert(key, now);
        }
    }
}
