// sitebackup/src/backup/archive.rs
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::info;
use walkdir::WalkDir;

use crate::errors::{AppError, Result};

/// Suffix of an archive that is still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Creates a GZipped TAR archive from a source directory.
///
/// Entries are stored under `root_name/` so that unpacking recreates a single
/// directory. The archive is written next to `archive_dest_path` with a
/// `.partial` suffix and only renamed into place once the gzip stream is
/// finished and flushed, so an existing `archive_dest_path` is always complete.
///
/// # Arguments
/// * `source_dir` - The directory whose contents will be archived.
/// * `root_name` - Top-level directory name inside the archive.
/// * `archive_dest_path` - The full path where the `.tgz` archive will be created.
///
/// # Returns
/// Size of the finished archive in bytes.
pub fn create_tar_gz_archive(
    source_dir: &Path,
    root_name: &str,
    archive_dest_path: &Path,
) -> Result<u64> {
    if !source_dir.is_dir() {
        return Err(AppError::Compression(format!(
            "Source for archival is not a directory: {}",
            source_dir.display()
        )));
    }

    info!(
        "Creating tar.gz archive from {} to {}",
        source_dir.display(),
        archive_dest_path.display()
    );

    let partial = partial_path(archive_dest_path);
    let archive_file = File::create(&partial).map_err(|e| AppError::io(&partial, e))?;
    let enc = GzEncoder::new(archive_file, Compression::default());
    let mut tar_builder = Builder::new(enc);
    tar_builder.follow_symlinks(false);

    tar_builder
        .append_dir(root_name, source_dir)
        .map_err(|e| AppError::Compression(format!("Failed to add archive root {}: {}", root_name, e)))?;

    for entry in WalkDir::new(source_dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            AppError::Compression(format!("Failed to walk directory {}: {}", source_dir.display(), e))
        })?;
        let path = entry.path();
        let relative = path.strip_prefix(source_dir).map_err(|e| {
            AppError::Compression(format!(
                "Failed to strip prefix {} from {}: {}",
                source_dir.display(),
                path.display(),
                e
            ))
        })?;

        if relative.as_os_str().is_empty() {
            continue;
        }
        let name = Path::new(root_name).join(relative);

        let appended = if entry.file_type().is_dir() {
            tar_builder.append_dir(&name, path)
        } else {
            tar_builder.append_path_with_name(path, &name)
        };
        appended.map_err(|e| {
            AppError::Compression(format!(
                "Failed to append {} as {} to archive: {}",
                path.display(),
                name.display(),
                e
            ))
        })?;
    }

    let encoder = tar_builder.into_inner().map_err(|e| {
        AppError::Compression(format!(
            "Failed to finish tar stream for {}: {}",
            archive_dest_path.display(),
            e
        ))
    })?;
    let archive_file = encoder.finish().map_err(|e| {
        AppError::Compression(format!(
            "Failed to finish Gzip encoding for {}: {}",
            archive_dest_path.display(),
            e
        ))
    })?;
    archive_file.sync_all().map_err(|e| AppError::io(&partial, e))?;
    drop(archive_file);

    fs::rename(&partial, archive_dest_path).map_err(|e| AppError::io(archive_dest_path, e))?;
    let size = fs::metadata(archive_dest_path)
        .map_err(|e| AppError::io(archive_dest_path, e))?
        .len();

    info!(
        "✓ Tar.gz archive created at {} ({} bytes)",
        archive_dest_path.display(),
        size
    );
    Ok(size)
}
