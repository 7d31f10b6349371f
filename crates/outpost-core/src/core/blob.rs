// outpost-core/src/core/blob.rs
// ============================================================================
// Module: Outpost Blob and Signed Binary Records
// Description: Content-addressed blob ids, file references, signed binaries.
// Purpose: Provide stable identifiers and metadata for byte storage.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! Blobs are content-addressed: a blob id is the SHA-256 of the bytes and is
//! only ever derived from content. Logical files are reconstructed from an
//! ordered `BlobReference` list keyed by the file's hash id. Signed binaries
//! are ordered lists of signed blobs deliverable to agents; each blob's
//! signature verifies against the pinned code-signing public key.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::hashing::hex_decode;
use crate::core::hashing::hex_encode;
use crate::core::hashing::sha256_bytes;

// ============================================================================
// SECTION: Blob Identifier
// ============================================================================

/// Content address of a blob: the SHA-256 of its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId([u8; 32]);

/// Blob id parse errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlobIdParseError {
    /// The string form is not 64 hex characters.
    #[error("malformed blob id: {0}")]
    Malformed(String),
}

impl BlobId {
    /// Derives the blob id for the given content.
    #[must_use]
    pub fn of(content: &[u8]) -> Self {
        Self(sha256_bytes(content))
    }

    /// Creates a blob id from raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        hex_encode(&self.0).fmt(f)
    }
}

impl FromStr for BlobId {
    type Err = BlobIdParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes =
            hex_decode(value).ok_or_else(|| BlobIdParseError::Malformed(value.to_string()))?;
        let digest: [u8; 32] =
            bytes.try_into().map_err(|_| BlobIdParseError::Malformed(value.to_string()))?;
        Ok(Self(digest))
    }
}

impl TryFrom<String> for BlobId {
    type Error = BlobIdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BlobId> for String {
    fn from(value: BlobId) -> Self {
        value.to_string()
    }
}

// ============================================================================
// SECTION: Blob References
// ============================================================================

/// One segment of a logical file stored as a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobReference {
    /// Offset of the segment within the logical file.
    pub offset: u64,
    /// Segment size in bytes.
    pub size: u64,
    /// Blob holding the segment bytes.
    pub blob_id: BlobId,
}

// ============================================================================
// SECTION: Signed Binaries
// ============================================================================

/// Kind of signed binary deliverable to agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryKind {
    /// Interpreted script payload executed by the agent runtime.
    Script,
    /// Native executable payload.
    Executable,
}

impl fmt::Display for BinaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Script => "script",
            Self::Executable => "executable",
        };
        label.fmt(f)
    }
}

impl FromStr for BinaryKind {
    type Err = BlobIdParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "script" => Ok(Self::Script),
            "executable" => Ok(Self::Executable),
            other => Err(BlobIdParseError::Malformed(other.to_string())),
        }
    }
}

/// Identifier for a signed binary: its kind plus store path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignedBinaryId {
    /// Binary kind.
    pub binary_kind: BinaryKind,
    /// Store path, e.g. `linux/collector`.
    pub path: String,
}

/// One signed blob within a signed binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlobReference {
    /// Blob holding the segment bytes.
    pub blob_id: BlobId,
    /// Segment size in bytes.
    pub size: u64,
    /// Code signature over the segment bytes.
    pub signature: Vec<u8>,
}

/// Ordered signed-blob list composing one deliverable binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBinaryReferences {
    /// Binary identifier.
    pub id: SignedBinaryId,
    /// Ordered signed segments.
    pub blobs: Vec<SignedBlobReference>,
}
