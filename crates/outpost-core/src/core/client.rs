// outpost-core/src/core/client.rs
// ============================================================================
// Module: Outpost Client Records
// Description: Persistent client (agent) records, labels, and crash info.
// Purpose: Provide stable, serializable types for enrolled endpoint agents.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! A client record is created on first successful enrollment and updated by
//! every poll's metadata. Client records are never deleted automatically.
//! Knowledge-base facts are collected by interrogation flows; labels are
//! attached by API callers and drive hunt rule matching and approval policy.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::ClientId;
use crate::core::identifiers::Username;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Knowledge Base
// ============================================================================

/// Platform and OS facts collected from the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    /// Operating system name, e.g. `Linux`, `Windows`, `Darwin`.
    #[serde(default)]
    pub os: String,
    /// Operating system release or version string.
    #[serde(default)]
    pub os_version: String,
    /// Machine architecture, e.g. `x86_64`.
    #[serde(default)]
    pub arch: String,
    /// Fully qualified domain name reported by the agent.
    #[serde(default)]
    pub fqdn: String,
}

// ============================================================================
// SECTION: Labels
// ============================================================================

/// Label attached to a client by an owner.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientLabel {
    /// Username that owns the label.
    pub owner: Username,
    /// Label name.
    pub name: String,
}

// ============================================================================
// SECTION: Startup / Crash Records
// ============================================================================

/// Startup information reported by the agent on enrollment and restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupInfo {
    /// Agent software version string.
    #[serde(default)]
    pub client_version: String,
    /// Boot time of the agent process.
    #[serde(default)]
    pub boot_time: Timestamp,
}

/// Crash record published when an agent reports a killed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCrash {
    /// Client that crashed.
    pub client_id: ClientId,
    /// Session the crash was reported on.
    pub session_id: String,
    /// Crash timestamp.
    pub timestamp: Timestamp,
    /// Human-readable crash message.
    pub crash_message: String,
}

// ============================================================================
// SECTION: Client Record
// ============================================================================

/// Persistent record for an enrolled agent, keyed by [`ClientId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Client identifier.
    pub client_id: ClientId,
    /// PEM-encoded long-lived RSA public key pinned at enrollment.
    pub public_key_pem: String,
    /// SHA-256 fingerprint of the public key, lower hex.
    pub public_key_fingerprint: String,
    /// Enrollment timestamp.
    pub first_seen: Timestamp,
    /// Last successful poll timestamp.
    pub last_ping: Timestamp,
    /// Last agent-reported clock value.
    pub last_clock: Timestamp,
    /// Last source address observed for the agent.
    pub last_ip: String,
    /// Last time the foreman evaluated hunts for this client.
    pub last_foreman_check: Timestamp,
    /// Platform facts collected by interrogation.
    #[serde(default)]
    pub knowledge_base: KnowledgeBase,
    /// Labels attached to the client.
    #[serde(default)]
    pub labels: Vec<ClientLabel>,
    /// Startup info reported by the agent.
    #[serde(default)]
    pub startup_info: StartupInfo,
    /// Most recent crash record, when any.
    #[serde(default)]
    pub last_crash: Option<ClientCrash>,
}

impl Client {
    /// Creates a fresh client record at enrollment time.
    #[must_use]
    pub fn enrolled(
        client_id: ClientId,
        public_key_pem: String,
        public_key_fingerprint: String,
        now: Timestamp,
        source_ip: String,
    ) -> Self {
        Self {
            client_id,
            public_key_pem,
            public_key_fingerprint,
            first_seen: now,
            last_ping: now,
            last_clock: now,
            last_ip: source_ip,
            last_foreman_check: Timestamp::EPOCH,
            knowledge_base: KnowledgeBase::default(),
            labels: Vec::new(),
            startup_info: StartupInfo::default(),
            last_crash: None,
        }
    }

    /// Returns the keywords this client is indexed under for search.
    ///
    /// Keywords are lower-cased label names, OS facts, and the fqdn with its
    /// host component.
    #[must_use]
    pub fn search_keywords(&self) -> Vec<String> {
        let mut keywords = vec![self.client_id.to_string().to_lowercase()];
        for label in &self.labels {
            keywords.push(label.name.to_lowercase());
        }
        if !self.knowledge_base.os.is_empty() {
            keywords.push(self.knowledge_base.os.to_lowercase());
        }
        if !self.knowledge_base.os_version.is_empty() {
            keywords.push(self.knowledge_base.os_version.to_lowercase());
        }
        if !self.knowledge_base.fqdn.is_empty() {
            let fqdn = self.knowledge_base.fqdn.to_lowercase();
            if let Some(host) = fqdn.split('.').next()
                && !host.is_empty()
            {
                keywords.push(host.to_string());
            }
            keywords.push(fqdn);
        }
        keywords.sort();
        keywords.dedup();
        keywords
    }
}

// ============================================================================
// SECTION: Client Snapshot
// ============================================================================

/// Versioned snapshot of a client record at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    /// Snapshot capture timestamp.
    pub timestamp: Timestamp,
    /// The client record as of the capture time.
    pub client: Client,
}

// ============================================================================
// SECTION: VFS Paths
// ============================================================================

/// Filesystem metadata collected from the agent for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathInfo {
    /// Client the path was collected from.
    pub client_id: ClientId,
    /// Absolute path on the agent.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// Unix mode bits.
    pub mode: u32,
    /// Modification time reported by the agent.
    pub mtime: Timestamp,
    /// SHA-256 of the file content when collected, lower hex.
    #[serde(default)]
    pub content_hash: Option<String>,
    /// Collection timestamp.
    pub collected_at: Timestamp,
}
