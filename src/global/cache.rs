use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use crate::error::{EngineError, Result};
use crate::util::is_valid_identifier;
use crate::verify::{verify_bytes, Checksum};

/// Cache of verified artifacts, laid out as `<dir>/<identifier>/<artifact_name>`.
///
/// Only artifacts that passed verification are stored, and a cached file is
/// re-verified every time it is read back, so a corrupted cache entry is
/// treated as a miss.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
}

impl ArtifactCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, identifier: &str, artifact_name: &str) -> Option<PathBuf> {
        if !is_valid_identifier(identifier) || !is_valid_identifier(artifact_name) {
            return None;
        }
        Some(self.dir.join(identifier).join(artifact_name))
    }

    /// Returns the cached artifact bytes if present and still matching `checksum`.
    ///
    /// The bytes returned are the bytes that were verified; the file is read once.
    pub fn get(&self, identifier: &str, artifact_name: &str, checksum: &Checksum) -> Option<Vec<u8>> {
        let path = self.entry_path(identifier, artifact_name)?;
        let bytes = std::fs::read(&path).ok()?;
        let url = format!("file://{}", path.display());
        if let Err(e) = verify_bytes(&bytes, checksum, &url) {
            tracing::warn!(path = %path.display(), error = %e, "discarding corrupt cached artifact");
            evict(&path);
            return None;
        }
        Some(bytes)
    }

    /// Stores verified artifact bytes.
    pub fn store(&self, identifier: &str, artifact_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self
            .entry_path(identifier, artifact_name)
            .ok_or_else(|| EngineError::invalid(identifier, format!("cannot cache '{artifact_name}'")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
        std::fs::write(&path, bytes).map_err(|e| EngineError::io(&path, e))?;
        Ok(path)
    }

    /// Returns true if any artifact is cached for `identifier`.
    pub fn is_cached(&self, identifier: &str) -> bool {
        self.cached_files(identifier).next().is_some()
    }

    /// Removes cached artifacts of `identifier` except `keep`.
    ///
    /// Returns the removed paths.
    pub fn prune(&self, identifier: &str, keep: Option<&str>) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for path in self.cached_files(identifier).collect::<Vec<_>>() {
            let name = path.file_name().map(|n| n.to_string_lossy().to_string());
            if keep.is_some() && name.as_deref() == keep {
                continue;
            }
            std::fs::remove_file(&path).map_err(|e| EngineError::io(&path, e))?;
            removed.push(path);
        }
        Ok(removed)
    }

    /// Empties the whole cache.
    pub fn clean(&self) -> Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir).map_err(|e| EngineError::io(&self.dir, e))?;
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| EngineError::io(&self.dir, e))?;
        Ok(())
    }

    fn cached_files(&self, identifier: &str) -> impl Iterator<Item = PathBuf> {
        let root = if is_valid_identifier(identifier) {
            Some(self.dir.join(identifier))
        } else {
            None
        };
        root.filter(|r| r.is_dir())
            .into_iter()
            .flat_map(|r| WalkDir::new(r).min_depth(1).max_depth(1))
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
    }
}

/// Removes a cache entry, logging instead of failing. Returns true if it was removed.
fn evict(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not evict cached artifact");
            false
        }
    }
}
