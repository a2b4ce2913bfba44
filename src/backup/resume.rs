// sitebackup/src/backup/resume.rs
//! Resumable upload of a chunk set.
//!
//! Chunks are probed and uploaded in ascending index order only, so the remote
//! side always holds a contiguous prefix of the set. Re-running after any
//! interruption therefore only needs to find the first absent chunk.

use std::ops::Range;
use tracing::{info, warn};

use crate::backup::chunker::ArchiveChunk;
use crate::backup::s3_upload::{CHUNK_CONTENT_TYPE, ObjectStatus, ObjectStore};
use crate::errors::{AppError, Result};

/// Contiguous suffix of the chunk sequence that still has to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPlan {
    start: usize,
    total: usize,
}

impl UploadPlan {
    /// `first_absent == None` means every chunk is already present.
    pub fn new(total: usize, first_absent: Option<usize>) -> Self {
        UploadPlan {
            start: first_absent.map_or(total, |index| index.min(total)),
            total,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.total
    }

    pub fn indices(&self) -> Range<usize> {
        self.start..self.total
    }

    pub fn select<'c>(&self, chunks: &'c [ArchiveChunk]) -> &'c [ArchiveChunk] {
        chunks.get(self.indices()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadReport {
    /// A previous run already stored the whole set.
    AlreadyPresent { chunks: usize },
    Uploaded {
        uploaded: usize,
        resumed_from: usize,
        total: usize,
    },
}

/// Whether the store already holds `chunk`.
///
/// An object under the chunk's key with a different length was written from
/// another archive of the same name; it is never counted as uploaded.
pub async fn is_uploaded<S: ObjectStore>(store: &S, bucket: &str, chunk: &ArchiveChunk) -> Result<bool> {
    match store.probe(bucket, &chunk.key).await {
        ObjectStatus::Present {
            bytes: Some(remote_bytes),
        } if remote_bytes != chunk.bytes => Err(AppError::RemoteMismatch {
            key: chunk.key.clone(),
            remote_bytes,
            local_bytes: chunk.bytes,
        }),
        ObjectStatus::Present { .. } => Ok(true),
        ObjectStatus::Absent => Ok(false),
        ObjectStatus::Error(err) => Err(err.into()),
    }
}

/// Index of the first chunk the store does not have, probing in order and
/// stopping at the first absence.
pub async fn find_first_absent<S: ObjectStore>(
    store: &S,
    bucket: &str,
    chunks: &[ArchiveChunk],
) -> Result<Option<usize>> {
    for chunk in chunks {
        if !is_uploaded(store, bucket, chunk).await? {
            return Ok(Some(chunk.index));
        }
    }
    Ok(None)
}

/// Uploads whatever suffix of `chunks` is missing from `bucket`.
///
/// The first failed upload aborts the rest; the next run resumes from the
/// first absent chunk. Uploaded chunks are probed again before success is
/// reported.
pub async fn upload_chunks<S: ObjectStore>(
    store: &S,
    bucket: &str,
    acl: &str,
    chunks: &[ArchiveChunk],
) -> Result<UploadReport> {
    if chunks.is_empty() {
        return Err(AppError::Chunking("No chunks to upload".to_string()));
    }

    let first_absent = find_first_absent(store, bucket, chunks).await?;
    let plan = UploadPlan::new(chunks.len(), first_absent);
    if plan.is_empty() {
        info!(
            "All {} chunk(s) are already in bucket {}; nothing to upload",
            chunks.len(),
            bucket
        );
        return Ok(UploadReport::AlreadyPresent {
            chunks: chunks.len(),
        });
    }

    let pending = plan.select(chunks);
    if plan.indices().start > 0 {
        info!(
            "Resuming upload at chunk {} of {}",
            plan.indices().start,
            chunks.len()
        );
    }

    for chunk in pending {
        chunk.verify_local()?;
        info!(
            "   - uploading {} ({} bytes, {}/{})",
            chunk.key,
            chunk.bytes,
            chunk.index + 1,
            chunks.len()
        );
        store
            .put(bucket, &chunk.key, &chunk.path, CHUNK_CONTENT_TYPE, acl)
            .await?;
    }

    for chunk in pending {
        if !is_uploaded(store, bucket, chunk).await? {
            warn!("Chunk {} is missing right after upload", chunk.key);
            return Err(AppError::Verification(format!(
                "{} couldn't be found in bucket {} after upload",
                chunk.key, bucket
            )));
        }
    }

    Ok(UploadReport::Uploaded {
        uploaded: pending.len(),
        resumed_from: plan.indices().start,
        total: chunks.len(),
    })
}
