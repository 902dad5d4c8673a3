//! Persistence layer: the rule store, the remote instance store and the
//! generated per-instance configuration files.

pub mod conf;
pub mod json;
pub mod lock;
pub mod staging;

pub use conf::{ConfPaths, ConfWriter};
pub use json::{JsonStore, StoreEntry};
pub use lock::StoreLock;
pub use staging::{stage_file, StagedFile};

use crate::config::Config;
use crate::core::{RemoteInstance, Rule};
use std::path::PathBuf;

/// Everything the engine reads from and writes to disk.
#[derive(Debug, Clone)]
pub struct Store {
    pub rules: JsonStore<Rule>,
    pub mirrors: JsonStore<RemoteInstance>,
    pub conf: ConfWriter,
    lock_file: PathBuf,
}

impl Store {
    pub fn new(
        rule_dir: impl Into<PathBuf>,
        mirror_dir: impl Into<PathBuf>,
        lock_file: impl Into<PathBuf>,
        conf_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            rules: JsonStore::new(rule_dir),
            mirrors: JsonStore::new(mirror_dir),
            conf: ConfWriter::new(conf_path),
            lock_file: lock_file.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.store.rule_dir,
            &config.store.mirror_dir,
            &config.store.lock_file,
            &config.render.conf_path,
        )
    }

    /// Takes the exclusive lock guarding mutating operations.
    pub async fn lock(&self) -> crate::errors::Result<StoreLock> {
        StoreLock::acquire(&self.lock_file).await
    }
}
