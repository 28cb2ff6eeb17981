//! Filesystem helpers shared by storage backends.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dfs_proto::{DfsError, DfsResult};
use tracing::{debug, warn};

/// Directory under the store folder that holds partially written files.
pub const PARTIAL_DIR: &str = ".partial";

static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Map a filename to its path under `base`.
///
/// Names that would escape the folder, or collide with the partial-write
/// directory, are rejected.
pub fn file_path(base: &Path, filename: &str) -> DfsResult<PathBuf> {
    if filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename == PARTIAL_DIR
        || filename.contains(['/', '\\', '\0'])
    {
        debug!("rejecting filename {:?}", filename);
        return Err(DfsError::Protocol);
    }
    Ok(base.join(filename))
}

/// Atomic write: write data to a temporary file, then rename into place.
///
/// A crash mid-write never leaves a truncated file under its real name,
/// so a Dstore never lists a file it has not fully received.
pub fn atomic_write(base: &Path, target: &Path, data: &[u8]) -> DfsResult<()> {
    let partial = base.join(PARTIAL_DIR);
    fs::create_dir_all(&partial).map_err(|_| DfsError::Eio)?;

    let seq = PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp_path = partial.join(format!("{}.{}", std::process::id(), seq));

    let mut file = fs::File::create(&tmp_path).map_err(|e| {
        warn!("failed to create tmp file {}: {}", tmp_path.display(), e);
        DfsError::Eio
    })?;
    file.write_all(data).map_err(|e| {
        warn!("failed to write tmp file {}: {}", tmp_path.display(), e);
        let _ = fs::remove_file(&tmp_path);
        DfsError::Eio
    })?;
    file.sync_all().map_err(|e| {
        warn!("failed to sync tmp file {}: {}", tmp_path.display(), e);
        let _ = fs::remove_file(&tmp_path);
        DfsError::Eio
    })?;
    drop(file);

    fs::rename(&tmp_path, target).map_err(|e| {
        warn!(
            "failed to rename {} -> {}: {}",
            tmp_path.display(),
            target.display(),
            e
        );
        let _ = fs::remove_file(&tmp_path);
        DfsError::Eio
    })
}

/// Names of the regular files directly under `dir`, sorted. Directories
/// (including the partial-write area) are skipped.
pub fn scan_dir(dir: &Path) -> DfsResult<Vec<String>> {
    let mut names = Vec::new();
    if !dir.exists() {
        return Ok(names);
    }

    let entries = fs::read_dir(dir).map_err(|e| {
        warn!("failed to read dir {}: {}", dir.display(), e);
        DfsError::Eio
    })?;
    for entry in entries {
        let entry = entry.map_err(|_| DfsError::Eio)?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(name) => debug!("skipping non-UTF-8 file {:?}", name),
        }
    }
    names.sort();
    Ok(names)
}

/// Delete everything under `dir`, keeping `dir` itself.
pub fn clear_dir(dir: &Path) -> DfsResult<usize> {
    let mut removed = 0;
    let entries = fs::read_dir(dir).map_err(|_| DfsError::Eio)?;
    for entry in entries {
        let entry = entry.map_err(|_| DfsError::Eio)?;
        let path = entry.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|e| {
            warn!("failed to remove {}: {}", path.display(), e);
            DfsError::Eio
        })?;
        removed += 1;
    }
    Ok(removed)
}
