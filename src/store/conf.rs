//! Per-instance configuration files.

use super::staging::{backup_path, rename_if_exists, stage_file};
use crate::core::Instance;
use crate::errors::Result;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The canonical and backup paths of one instance's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfPaths {
    pub current: PathBuf,
    pub backup: PathBuf,
}

/// Locates and writes configuration files under each instance's root.
#[derive(Debug, Clone)]
pub struct ConfWriter {
    relative: PathBuf,
}

impl ConfWriter {
    /// `relative` is joined onto every instance root.
    pub fn new(relative: impl Into<PathBuf>) -> Self {
        Self {
            relative: relative.into(),
        }
    }

    pub fn path_for(&self, instance: &Instance) -> PathBuf {
        instance.root.join(&self.relative)
    }

    pub fn paths_for(&self, instance: &Instance) -> ConfPaths {
        let current = self.path_for(instance);
        ConfPaths {
            backup: backup_path(&current),
            current,
        }
    }

    /// Writes every file, in parallel. Each file is staged first; only once
    /// all temporary files exist are they moved into place, previous files
    /// becoming `.old` backups.
    pub async fn write_all(&self, files: &BTreeMap<PathBuf, String>, token: &str) -> Result<()> {
        let staged = try_join_all(
            files
                .iter()
                .map(|(path, text)| stage_file(path, token, text.as_bytes())),
        )
        .await?;
        let written = try_join_all(staged.into_iter().map(|s| s.with_backup().commit())).await?;
        debug!(count = written.len(), "Wrote configuration files");
        metrics::counter!("fw_configs_written_total").increment(written.len() as u64);
        Ok(())
    }

    /// Moves an instance's configuration aside so the filter no longer
    /// loads it. A missing file is fine.
    pub async fn retire(&self, instance: &Instance) -> Result<bool> {
        let paths = self.paths_for(instance);
        retire_path(&paths.current, &paths.backup).await
    }
}

async fn retire_path(current: &Path, backup: &Path) -> Result<bool> {
    let moved = rename_if_exists(current, backup).await?;
    debug!(path = %current.display(), moved, "Retired configuration file");
    Ok(moved)
}
