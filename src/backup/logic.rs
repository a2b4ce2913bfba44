// sitebackup/src/backup/logic.rs
use std::fs;
use std::io;
use std::path::Path;
use tracing::{info, warn};

use crate::backup::BackupJob;
use crate::backup::archive::partial_path;
use crate::backup::chunker::ChunkManifest;
use crate::backup::resume::{UploadReport, upload_chunks};
use crate::backup::s3_upload::{BucketStatus, ObjectStore};
use crate::backup::stages::{Stage, StageKind, StageSequencer};
use crate::errors::{AppError, Result};
use crate::utils::command::{CommandRunner, RunLog};

/// How far a previous run with the same backup name got locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveState {
    /// Nothing usable; every stage runs.
    Missing,
    /// The `.tgz` exists but was never split.
    Compressed,
    /// A complete chunk directory exists.
    Chunked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Uploaded { chunks: usize, resumed_from: usize },
    /// Every chunk was already in the bucket; nothing was uploaded.
    AlreadyPresent { chunks: usize },
}

/// Deletes one local artifact; a missing path is not an error.
type Remover = fn(&Path) -> io::Result<()>;

/// Drives one backup run: staging, compression, chunking, upload, cleanup.
pub struct RunController<R: CommandRunner, S: ObjectStore> {
    runner: R,
    store: S,
    remove: Remover,
}

impl<R: CommandRunner, S: ObjectStore> RunController<R, S> {
    pub fn new(runner: R, store: S) -> Self {
        RunController {
            runner,
            store,
            remove: remove_artifact,
        }
    }

    #[cfg(test)]
    fn with_remover(mut self, remove: Remover) -> Self {
        self.remove = remove;
        self
    }

    /// Only complete artifacts count; `.partial` leftovers are ignored.
    pub fn inspect(job: &BackupJob) -> ArchiveState {
        if ChunkManifest::is_complete(&job.chunk_dir()) {
            ArchiveState::Chunked
        } else if job.archive_path().is_file() {
            ArchiveState::Compressed
        } else {
            ArchiveState::Missing
        }
    }

    /// # Returns
    /// What happened on the object store side. Any stage, upload, or cleanup
    /// failure aborts the run with the local artifacts kept for the next attempt.
    pub async fn run(&self, job: &BackupJob) -> Result<RunOutcome> {
        info!("📦 Creating backup {}...", job.name);
        fs::create_dir_all(&job.output_dir).map_err(|e| AppError::io(&job.output_dir, e))?;
        let log = RunLog::open(&job.log_path())?;
        log.note(&format!("run started: {}", job.name))?;

        let state = Self::inspect(job);
        let stages = self.prepare(job, state)?;
        StageSequencer::new(&self.runner, &log).run(&stages)?;

        let chunk_dir = job.chunk_dir();
        let manifest = ChunkManifest::load(&chunk_dir)?;
        let chunks = manifest.chunks_in(&chunk_dir);

        info!("☁️ Uploading {} chunk(s) to bucket {}...", chunks.len(), job.bucket);
        match self.store.ensure_bucket(&job.bucket).await? {
            BucketStatus::Created => info!("   - created bucket {}", job.bucket),
            BucketStatus::Existing => {}
            BucketStatus::Unverified => {
                warn!("   - couldn't verify bucket {}; trying uploads anyway", job.bucket)
            }
        }
        let report = upload_chunks(&self.store, &job.bucket, &job.acl, &chunks).await?;
        log.note(&format!("upload finished: {:?}", report))?;

        if job.cleanup {
            remove_local_artifacts(job, self.remove)?;
        } else {
            info!("Keeping local artifacts in {}", job.output_dir.display());
        }

        Ok(match report {
            UploadReport::AlreadyPresent { chunks } => RunOutcome::AlreadyPresent { chunks },
            UploadReport::Uploaded {
                total,
                resumed_from,
                ..
            } => RunOutcome::Uploaded {
                chunks: total,
                resumed_from,
            },
        })
    }

    /// Picks the stages still needed for `state` and readies the staging tree.
    fn prepare(&self, job: &BackupJob, state: ArchiveState) -> Result<Vec<Stage>> {
        match state {
            ArchiveState::Chunked => {
                info!(
                    "{} is already split into chunks. Skipping archive generation.",
                    job.name
                );
                Ok(Vec::new())
            }
            ArchiveState::Compressed => {
                info!(
                    "{} already exists. Skipping to chunking.",
                    job.archive_path().display()
                );
                Ok(stages_of(&job.stages, &[StageKind::Chunking]))
            }
            ArchiveState::Missing => {
                for dir in job.staging_subdirs() {
                    fs::create_dir_all(&dir).map_err(|e| AppError::io(&dir, e))?;
                }
                Ok(job.stages.clone())
            }
        }
    }
}

fn stages_of(stages: &[Stage], kinds: &[StageKind]) -> Vec<Stage> {
    stages
        .iter()
        .filter(|s| kinds.contains(&s.kind))
        .cloned()
        .collect()
}

/// Removes everything but the run log once the bucket holds the full set.
fn remove_local_artifacts(job: &BackupJob, remove: Remover) -> Result<()> {
    let chunk_dir = job.chunk_dir();
    let archive = job.archive_path();
    let staging = job.staging_dir();
    for path in [
        partial_path(&chunk_dir),
        chunk_dir,
        partial_path(&archive),
        archive,
        staging,
    ] {
        remove(&path).map_err(|source| AppError::Cleanup { path, source })?;
    }
    info!("🧹 Removed local artifacts of {}", job.name);
    Ok(())
}

fn remove_artifact(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
