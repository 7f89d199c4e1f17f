use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use fs2::FileExt;
use crate::error::{EngineError, Result};
use crate::util::is_valid_identifier;

/// An exclusive advisory lock on one package identifier.
///
/// The lock is a `<identifier>.lock` file in the lock directory, held with
/// `flock`-style locking for as long as this value lives. Operations on the
/// same identifier serialize; different identifiers never contend.
#[derive(Debug)]
pub struct PackageLock {
    file: File,
    path: PathBuf,
}

impl PackageLock {
    /// Blocks until the lock for `identifier` is available.
    ///
    /// # Errors
    /// Returns an error if the lock file cannot be created or locked.
    pub fn acquire<P: AsRef<Path>>(lock_dir: P, identifier: &str) -> Result<Self> {
        let (file, path) = open_lock_file(lock_dir.as_ref(), identifier)?;
        tracing::trace!(identifier, path = %path.display(), "waiting for package lock");
        file.lock_exclusive().map_err(|e| EngineError::io(&path, e))?;
        Ok(Self { file, path })
    }

    /// Takes the lock for `identifier` only if nobody else holds it.
    ///
    /// # Errors
    /// Returns [`EngineError::Locked`] when the lock is held elsewhere.
    pub fn try_acquire<P: AsRef<Path>>(lock_dir: P, identifier: &str) -> Result<Self> {
        let (file, path) = open_lock_file(lock_dir.as_ref(), identifier)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(EngineError::Locked {
                identifier: identifier.to_string(),
            }),
            Err(e) => Err(EngineError::io(&path, e)),
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PackageLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release package lock");
        }
    }
}

fn open_lock_file(lock_dir: &Path, identifier: &str) -> Result<(File, PathBuf)> {
    if !is_valid_identifier(identifier) {
        return Err(EngineError::invalid(identifier, "identifier cannot be used as a lock name"));
    }
    std::fs::create_dir_all(lock_dir).map_err(|e| EngineError::io(lock_dir, e))?;
    let path = lock_dir.join(format!("{identifier}.lock"));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| EngineError::io(&path, e))?;
    Ok((file, path))
}
