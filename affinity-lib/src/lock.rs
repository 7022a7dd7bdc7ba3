//! Advisory exclusive locks that keep two runs off the same prefix or cache

use crate::error::{AffinityError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Held for the lifetime of the value; released on drop.
#[derive(Debug)]
pub struct ExclusiveLock {
    file: File,
    path: PathBuf,
}

impl ExclusiveLock {
    /// Take the lock without waiting. A lock held elsewhere is `Busy`.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                return Err(AffinityError::Busy(path.to_path_buf()));
            }
            return Err(e.into());
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!("Acquired lock {}", path.display());

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Lock guarding `prefix`: a sibling `<prefix>.lock` so the prefix itself
    /// may be absent or recreated while held
    pub fn prefix_lock_path(prefix: &Path) -> PathBuf {
        let mut path = prefix.as_os_str().to_owned();
        path.push(".lock");
        PathBuf::from(path)
    }

    pub fn cache_lock_path(cache_dir: &Path) -> PathBuf {
        cache_dir.join(".lock")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}
