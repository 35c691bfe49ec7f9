use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Another process already owns one of the instance locks. Fatal at startup.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("another dockhand instance already owns {path}")]
    Contended { path: PathBuf },

    #[error("failed to create lock file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Cross-process advisory lock held for the lifetime of the process.
///
/// The lock is released when the file handle is dropped (process exit
/// included), so a crashed instance never leaves a stale lock behind.
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Lock the working directory. Prevents two instances from sharing
    /// per-directory state and `.env` context.
    pub fn acquire_for_dir(dir: &Path) -> Result<Self, LockError> {
        Self::acquire(dir.join(".dockhand.lock"))
    }

    fn acquire(path: PathBuf) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;

        file.try_lock_exclusive()
            .map_err(|_| LockError::Contended { path: path.clone() })?;

        tracing::debug!(path = %path.display(), "acquired instance lock");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquisition_fails() {
        let dir = TempDir::new().unwrap();
        let first = InstanceLock::acquire_for_dir(dir.path()).unwrap();
        assert!(matches!(
            InstanceLock::acquire_for_dir(dir.path()),
            Err(LockError::Contended { .. })
        ));
        drop(first);
        // Released on drop; a fresh instance can start.
        InstanceLock::acquire_for_dir(dir.path()).unwrap();
    }
}
