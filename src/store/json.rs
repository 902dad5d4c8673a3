//! Directory-backed JSON stores for rules and remote instances.
//!
//! Each entry lives in its own `<dir>/<id>.json` file, serialized exactly as
//! it is returned to callers.

use super::staging::{remove_if_exists, stage_file};
use crate::core::{check_id, RemoteInstance, Rule};
use crate::errors::{FwError, Result};
use futures::future::try_join_all;
use serde::{de::DeserializeOwned, Serialize};
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, trace};

/// An entity that can be kept in a [`JsonStore`].
pub trait StoreEntry: Serialize + DeserializeOwned + Send + Sync {
    /// Used in error messages and log fields.
    const KIND: &'static str;

    fn store_id(&self) -> &str;
}

impl StoreEntry for Rule {
    const KIND: &'static str = "rule";

    fn store_id(&self) -> &str {
        &self.id
    }
}

impl StoreEntry for RemoteInstance {
    const KIND: &'static str = "remote instance";

    fn store_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone)]
pub struct JsonStore<T> {
    dir: PathBuf,
    _entry: PhantomData<fn() -> T>,
}

impl<T: StoreEntry> JsonStore<T> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            _entry: PhantomData,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Loads every entry, sorted by file name. A missing directory is an
    /// empty store; temporary files are skipped.
    pub async fn load_all(&self) -> Result<Vec<T>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(
                    dir = %self.dir.display(),
                    kind = T::KIND,
                    "Store directory missing, treating as empty"
                );
                return Ok(Vec::new());
            }
            Err(e) => return Err(FwError::store_io(&self.dir, e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FwError::store_io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let items = try_join_all(paths.iter().map(|path| read_entry::<T>(path))).await?;
        debug!(dir = %self.dir.display(), kind = T::KIND, count = items.len(), "Loaded store");
        Ok(items)
    }

    /// Loads one entry; `None` when no file exists for `id` or `id` cannot
    /// name an entry of this store.
    pub async fn get(&self, id: &str) -> Result<Option<T>> {
        if check_id(T::KIND, id).is_err() {
            return Ok(None);
        }
        match read_entry::<T>(&self.path_for(id)).await {
            Ok(item) => Ok(Some(item)),
            Err(FwError::StoreIo { source, .. }) if source.kind() == ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Writes `items` in parallel, each through a temporary file named with
    /// `token`.
    pub async fn write_all(&self, items: &[T], token: &str) -> Result<Vec<PathBuf>> {
        try_join_all(items.iter().map(|item| self.write(item, token))).await
    }

    pub async fn write(&self, item: &T, token: &str) -> Result<PathBuf> {
        check_id(T::KIND, item.store_id())?;
        let path = self.path_for(item.store_id());
        let json = serde_json::to_vec_pretty(item).map_err(|source| FwError::StoreFormat {
            path: path.clone(),
            source,
        })?;
        trace!(kind = T::KIND, id = item.store_id(), "Writing store entry");
        stage_file(&path, token, &json).await?.commit().await
    }

    /// Removes the entries for `ids`. Already-missing files are fine.
    pub async fn remove_all(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            check_id(T::KIND, id)?;
        }
        try_join_all(ids.iter().map(|id| {
            let path = self.path_for(id);
            async move { remove_if_exists(&path).await }
        }))
        .await?;
        Ok(())
    }
}

async fn read_entry<T: StoreEntry>(path: &Path) -> Result<T> {
    let raw = fs::read(path).await.map_err(|e| FwError::store_io(path, e))?;
    serde_json::from_slice(&raw).map_err(|source| FwError::StoreFormat {
        path: path.to_path_buf(),
        source,
    })
}
