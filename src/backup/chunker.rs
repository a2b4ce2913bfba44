// sitebackup/src/backup/chunker.rs
//! Splits a finished archive into numbered, size-bounded chunk files.
//!
//! A chunk directory is either absent or complete: chunks are written into a
//! `.partial` sibling, verified, described by `manifest.json`, and only then
//! renamed into place.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backup::archive::partial_path;
use crate::errors::{AppError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";
/// Four-digit suffixes; more chunks than this means the chunk size is far too small.
pub const MAX_CHUNKS: u64 = 10_000;

/// Object key (and local file name) of chunk `index` of `archive_name`.
pub fn chunk_key(archive_name: &str, index: usize) -> String {
    format!("{}.{:04}", archive_name, index)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub index: usize,
    pub key: String,
    pub bytes: u64,
}

/// Record of a complete chunk set, stored beside the chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub archive_name: String,
    pub archive_bytes: u64,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkEntry>,
}

/// One slice of the archive as seen on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveChunk {
    pub index: usize,
    pub key: String,
    pub bytes: u64,
    pub path: PathBuf,
}

impl ArchiveChunk {
    /// Fails unless the local file exists with exactly the recorded size.
    pub fn verify_local(&self) -> Result<()> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.is_file() && meta.len() == self.bytes => Ok(()),
            Ok(meta) => Err(AppError::Chunking(format!(
                "Local chunk {} has {} bytes, expected {}; refusing to upload a truncated chunk",
                self.path.display(),
                meta.len(),
                self.bytes
            ))),
            Err(e) => Err(AppError::Chunking(format!(
                "Local chunk {} is unreadable: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

impl ChunkManifest {
    pub fn is_complete(chunk_dir: &Path) -> bool {
        chunk_dir.join(MANIFEST_FILE).is_file()
    }

    /// Loads and checks the manifest of a complete chunk directory.
    pub fn load(chunk_dir: &Path) -> Result<Self> {
        let path = chunk_dir.join(MANIFEST_FILE);
        let content = fs::read(&path).map_err(|e| AppError::io(&path, e))?;
        let manifest: ChunkManifest = serde_json::from_slice(&content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.chunks.is_empty() {
            return Err(AppError::Chunking(format!(
                "Manifest for {} lists no chunks",
                self.archive_name
            )));
        }
        let mut total = 0u64;
        for (position, entry) in self.chunks.iter().enumerate() {
            if entry.index != position || entry.key != chunk_key(&self.archive_name, position) {
                return Err(AppError::Chunking(format!(
                    "Manifest for {} is not contiguous at position {} (found {})",
                    self.archive_name, position, entry.key
                )));
            }
            if entry.bytes == 0 || entry.bytes > self.chunk_size {
                return Err(AppError::Chunking(format!(
                    "Manifest entry {} has invalid size {}",
                    entry.key, entry.bytes
                )));
            }
            total += entry.bytes;
        }
        if total != self.archive_bytes {
            return Err(AppError::Chunking(format!(
                "Manifest for {} covers {} bytes, archive had {}",
                self.archive_name, total, self.archive_bytes
            )));
        }
        Ok(())
    }

    /// Ordered chunk sequence, resolved against `chunk_dir`.
    pub fn chunks_in(&self, chunk_dir: &Path) -> Vec<ArchiveChunk> {
        self.chunks
            .iter()
            .map(|entry| ArchiveChunk {
                index: entry.index,
                key: entry.key.clone(),
                bytes: entry.bytes,
                path: chunk_dir.join(&entry.key),
            })
            .collect()
    }

    fn write_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let mut file = File::create(&path).map_err(|e| AppError::io(&path, e))?;
        file.write_all(&serde_json::to_vec_pretty(self)?)
            .and_then(|_| file.sync_all())
            .map_err(|e| AppError::io(&path, e))
    }
}

/// Splits `archive` into `chunk_size`-byte pieces inside `chunk_dir`.
///
/// The unsplit archive is deleted only after every chunk has been written,
/// synced, and the byte total checked. On failure the archive is left alone
/// and no `chunk_dir` exists.
pub fn chunk_archive(archive: &Path, chunk_dir: &Path, chunk_size: u64) -> Result<ChunkManifest> {
    if chunk_size == 0 {
        return Err(AppError::Chunking("Chunk size must be greater than zero".to_string()));
    }
    let archive_name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AppError::Chunking(format!("Invalid archive name: {}", archive.display())))?
        .to_string();

    let archive_bytes = fs::metadata(archive).map_err(|e| AppError::io(archive, e))?.len();
    if archive_bytes == 0 {
        return Err(AppError::Chunking(format!("Archive {} is empty", archive.display())));
    }
    let expected_chunks = archive_bytes.div_ceil(chunk_size);
    if expected_chunks > MAX_CHUNKS {
        return Err(AppError::Chunking(format!(
            "Archive of {} bytes would need {} chunks of {} bytes (limit {})",
            archive_bytes, expected_chunks, chunk_size, MAX_CHUNKS
        )));
    }

    let partial = partial_path(chunk_dir);
    for stale in [partial.as_path(), chunk_dir] {
        if stale.exists() {
            warn!("Discarding incomplete chunk directory {}", stale.display());
            fs::remove_dir_all(stale).map_err(|e| AppError::io(stale, e))?;
        }
    }
    fs::create_dir_all(&partial).map_err(|e| AppError::io(&partial, e))?;

    info!(
        "Splitting {} ({} bytes) into {} chunk(s) of up to {} bytes",
        archive.display(),
        archive_bytes,
        expected_chunks,
        chunk_size
    );

    let source = File::open(archive).map_err(|e| AppError::io(archive, e))?;
    let mut reader = BufReader::new(source);
    let mut chunks = Vec::new();
    loop {
        let index = chunks.len();
        let key = chunk_key(&archive_name, index);
        let path = partial.join(&key);
        let written = write_chunk(&mut reader, &path, chunk_size).map_err(|e| AppError::io(&path, e))?;
        if written == 0 {
            fs::remove_file(&path).map_err(|e| AppError::io(&path, e))?;
            break;
        }
        chunks.push(ChunkEntry { index, key, bytes: written });
    }

    let manifest = ChunkManifest {
        archive_name,
        archive_bytes,
        chunk_size,
        chunks,
    };
    if manifest.chunks.len() as u64 != expected_chunks {
        return Err(AppError::Chunking(format!(
            "Expected {} chunks but wrote {}",
            expected_chunks,
            manifest.chunks.len()
        )));
    }
    manifest.validate()?;
    manifest.write_to(&partial)?;

    fs::rename(&partial, chunk_dir).map_err(|e| AppError::io(chunk_dir, e))?;
    fs::remove_file(archive).map_err(|e| AppError::io(archive, e))?;

    info!("✓ Archive split into {} chunk(s)", manifest.chunks.len());
    Ok(manifest)
}

fn write_chunk<R: Read>(reader: &mut R, path: &Path, chunk_size: u64) -> io::Result<u64> {
    let mut writer = BufWriter::new(File::create(path)?);
    let written = io::copy(&mut reader.by_ref().take(chunk_size), &mut writer)?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(written)
}
