//! Exclusive store lock.
//!
//! Mutating operations hold an advisory `flock(2)` lock on a lock file for
//! their whole load, compute and persist sequence. The lock is released when
//! the guard is dropped.

use crate::errors::{FwError, Result};
use nix::fcntl::{flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Blocks (off the async runtime) until the exclusive lock is held.
    pub async fn acquire(path: &Path) -> Result<StoreLock> {
        let path = path.to_path_buf();
        let owned = path.clone();
        tokio::task::spawn_blocking(move || Self::acquire_blocking(owned))
            .await
            .map_err(|e| {
                FwError::store_io(&path, std::io::Error::new(std::io::ErrorKind::Other, e))
            })?
    }

    fn acquire_blocking(path: PathBuf) -> Result<StoreLock> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FwError::store_io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| FwError::store_io(&path, e))?;
        trace!(path = %path.display(), "Waiting for store lock");
        flock(file.as_raw_fd(), FlockArg::LockExclusive)
            .map_err(|errno| FwError::store_io(&path, std::io::Error::from(errno)))?;
        debug!(path = %path.display(), "Acquired store lock");
        Ok(StoreLock { file, path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well.
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        trace!(path = %self.path.display(), "Released store lock");
    }
}
