// outpost-core/src/core/approval.rs
// ============================================================================
// Module: Outpost Approval Records
// Description: Persistent access approvals, grants, and user types.
// Purpose: Provide stable, serializable authorization state for the gate.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! An approval is an authorization granted by peer users allowing a requestor
//! to operate on a subject (client, hunt, or cron job). Validity is evaluated
//! against expiry, a configured grant quorum, and admin-grantor requirements;
//! see the approval checker in the runtime module.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::ApprovalId;
use crate::core::identifiers::Username;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: User Type
// ============================================================================

/// Privilege level of an API user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    /// Regular user.
    Standard,
    /// Administrator; required to grant hunt approvals and run restricted
    /// flow classes.
    Admin,
}

impl UserType {
    /// Returns true for administrators.
    #[must_use]
    pub const fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }
}

// ============================================================================
// SECTION: Approval Type
// ============================================================================

/// Kind of subject an approval covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    /// Access to a single client.
    Client,
    /// Access to a hunt.
    Hunt,
    /// Access to a cron job.
    CronJob,
}

impl fmt::Display for ApprovalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Client => "client",
            Self::Hunt => "hunt",
            Self::CronJob => "cron_job",
        };
        label.fmt(f)
    }
}

// ============================================================================
// SECTION: Grants
// ============================================================================

/// A single grant on an approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Username that granted the approval.
    pub grantor: Username,
    /// Grant timestamp.
    pub timestamp: Timestamp,
}

// ============================================================================
// SECTION: Approval Record
// ============================================================================

/// Persistent approval record keyed by
/// `(RequestorUsername, ApprovalType, SubjectId, ApprovalId)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    /// Username the approval was requested by.
    pub requestor: Username,
    /// Kind of subject covered.
    pub approval_type: ApprovalType,
    /// Subject identifier in its canonical string form.
    pub subject_id: String,
    /// Approval identifier.
    pub approval_id: ApprovalId,
    /// Reason text supplied by the requestor.
    pub reason: String,
    /// Users notified of the request.
    #[serde(default)]
    pub notified_users: Vec<Username>,
    /// Additional email addresses cc'd on the request.
    #[serde(default)]
    pub email_cc: Vec<String>,
    /// Expiration timestamp.
    pub expiration: Timestamp,
    /// Grants collected so far.
    #[serde(default)]
    pub grants: Vec<Grant>,
    /// Creation timestamp.
    pub created_at: Timestamp,
}

impl Approval {
    /// Returns true when the approval has expired at the given time.
    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expiration
    }

    /// Returns the distinct grantor usernames.
    #[must_use]
    pub fn grantors(&self) -> Vec<&Username> {
        let mut grantors: Vec<&Username> = self.grants.iter().map(|grant| &grant.grantor).collect();
        grantors.sort();
        grantors.dedup();
        grantors
    }
}
