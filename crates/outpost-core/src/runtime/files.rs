// outpost-core/src/runtime/files.rs
// ============================================================================
// Module: Outpost File Assembly
// Description: Logical-file reads over content-addressed blob segments.
// Purpose: Stream and reassemble files from ordered blob references.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! Logical files are stored as ordered blob segments indexed by the file's
//! content hash. Reads yield ordered chunks; unbounded whole-file reads are
//! guarded by a configured limit unless the caller passes an explicit byte
//! length.

// ============================================================================
// SECTION: Imports
// ============================================================================

use crate::core::blob::BlobId;
use crate::core::blob::BlobReference;
use crate::interfaces::BlobStore;
use crate::interfaces::StoreError;

// ============================================================================
// SECTION: Chunks
// ============================================================================

/// One ordered chunk of a logical file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    /// Offset of the chunk within the file.
    pub offset: u64,
    /// Chunk bytes.
    pub data: Vec<u8>,
}

// ============================================================================
// SECTION: Writes
// ============================================================================

/// Writes a logical file as fixed-size blob segments.
///
/// Returns the file id (the SHA-256 of the whole content) and the reference
/// list, which is also persisted under the file id.
///
/// # Errors
///
/// Returns [`StoreError`] when a blob write fails.
pub fn write_file(
    blobs: &dyn BlobStore,
    content: &[u8],
    chunk_size: usize,
) -> Result<(BlobId, Vec<BlobReference>), StoreError> {
    let chunk_size = chunk_size.max(1);
    let file_id = BlobId::of(content);
    let mut references = Vec::new();
    let mut offset = 0u64;
    for segment in content.chunks(chunk_size) {
        let ids = blobs.write_blobs(&[segment.to_vec()])?;
        let blob_id = ids
            .first()
            .copied()
            .ok_or_else(|| StoreError::Serialization("blob write returned no id".to_string()))?;
        references.push(BlobReference { offset, size: segment.len() as u64, blob_id });
        offset += segment.len() as u64;
    }
    blobs.write_blob_references(&file_id, &references)?;
    Ok((file_id, references))
}

// ============================================================================
// SECTION: Reads
// ============================================================================

/// Streams the ordered chunks of a logical file.
///
/// # Errors
///
/// Returns [`StoreError::UnknownBlob`] when the file or one of its segments
/// is missing.
pub fn stream_file_chunks(
    blobs: &dyn BlobStore,
    file_id: &BlobId,
) -> Result<Vec<FileChunk>, StoreError> {
    let mut references = blobs.read_blob_references(file_id)?;
    references.sort_by_key(|reference| reference.offset);
    let ids: Vec<BlobId> = references.iter().map(|reference| reference.blob_id).collect();
    let datas = blobs.read_blobs(&ids)?;
    Ok(references
        .into_iter()
        .zip(datas)
        .map(|(reference, data)| FileChunk { offset: reference.offset, data })
        .collect())
}

/// Reads a logical file's bytes, enforcing the unbounded-read guard.
///
/// Callers must pass an explicit `length` to read past `unbounded_limit`.
///
/// # Errors
///
/// Returns [`StoreError::OversizedRead`] when the file exceeds the limit and
/// no explicit length was given.
pub fn read_file_bytes(
    blobs: &dyn BlobStore,
    file_id: &BlobId,
    unbounded_limit: u64,
    length: Option<u64>,
) -> Result<Vec<u8>, StoreError> {
    let references = blobs.read_blob_references(file_id)?;
    let total: u64 = references.iter().map(|reference| reference.size).sum();
    let wanted = match length {
        Some(length) => length.min(total),
        None => {
            if total > unbounded_limit {
                return Err(StoreError::OversizedRead { requested: total, limit: unbounded_limit });
            }
            total
        }
    };
    let mut out = Vec::new();
    for chunk in stream_file_chunks(blobs, file_id)? {
        if out.len() as u64 >= wanted {
            break;
        }
        let remaining = usize::try_from(wanted - out.len() as u64).unwrap_or(usize::MAX);
        let take = chunk.data.len().min(remaining);
        out.extend_from_slice(&chunk.data[..take]);
    }
    Ok(out)
}
