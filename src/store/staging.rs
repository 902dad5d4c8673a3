//! Crash-safe file replacement.
//!
//! Contents are first written to a sibling temporary file named
//! `<file>.<token>` and only become visible under the canonical name through
//! a rename, so a reader never observes a partially-written file.

use crate::errors::{FwError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::trace;

/// A temporary file waiting to be renamed over its target.
#[derive(Debug)]
pub struct StagedFile {
    temp: PathBuf,
    target: PathBuf,
    keep_backup: bool,
}

/// `<path>.<suffix>`, keeping the full original file name.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// The backup name a configuration file is moved to before replacement.
pub fn backup_path(path: &Path) -> PathBuf {
    with_suffix(path, "old")
}

/// Writes `contents` to the temporary file for `target`, creating parent
/// directories as needed.
pub async fn stage_file(target: &Path, token: &str, contents: &[u8]) -> Result<StagedFile> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| FwError::store_io(parent, e))?;
    }
    let temp = with_suffix(target, token);
    trace!(path = %temp.display(), "Writing temp file");
    fs::write(&temp, contents)
        .await
        .map_err(|e| FwError::store_io(&temp, e))?;
    Ok(StagedFile {
        temp,
        target: target.to_path_buf(),
        keep_backup: false,
    })
}

impl StagedFile {
    /// Move the current canonical file to its `.old` backup on commit.
    pub fn with_backup(mut self) -> Self {
        self.keep_backup = true;
        self
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Renames the temporary file into place.
    pub async fn commit(self) -> Result<PathBuf> {
        if self.keep_backup {
            rename_if_exists(&self.target, &backup_path(&self.target)).await?;
        }
        trace!(from = %self.temp.display(), to = %self.target.display(), "Renaming temp file");
        fs::rename(&self.temp, &self.target)
            .await
            .map_err(|e| FwError::store_io(&self.target, e))?;
        Ok(self.target)
    }

    /// Removes the temporary file without touching the target.
    pub async fn discard(self) -> Result<()> {
        remove_if_exists(&self.temp).await.map(|_| ())
    }
}

/// Stages and commits in one step.
pub async fn replace_file(target: &Path, token: &str, contents: &[u8]) -> Result<PathBuf> {
    stage_file(target, token, contents).await?.commit().await
}

/// Renames `from` to `to`; a missing `from` is not an error. Returns whether
/// anything was moved.
pub async fn rename_if_exists(from: &Path, to: &Path) -> Result<bool> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FwError::store_io(from, e)),
    }
}

/// Removes `path`; a missing file counts as already removed. Returns whether
/// anything was deleted.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FwError::store_io(path, e)),
    }
}
