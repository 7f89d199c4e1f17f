use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use crate::collab::{InstalledRecord, Registry};
use crate::error::{EngineError, Result};
use crate::util::is_valid_identifier;

/// A registry that keeps one JSON file per identifier in a directory.
///
/// Writes go to a temporary file in the same directory which is then renamed
/// over the record, so a reader sees either the old or the new record and
/// never a partial one.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    dir: PathBuf,
}

impl FileRegistry {
    /// Opens (and creates if needed) a registry rooted at `dir`.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| EngineError::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, identifier: &str) -> Result<PathBuf> {
        if !is_valid_identifier(identifier) {
            return Err(registry_error(identifier, "identifier is not a valid file name"));
        }
        Ok(self.dir.join(format!("{identifier}.json")))
    }
}

fn registry_error(identifier: &str, reason: impl ToString) -> EngineError {
    EngineError::Registry {
        identifier: identifier.to_string(),
        reason: reason.to_string(),
    }
}

impl Registry for FileRegistry {
    fn get(&self, identifier: &str) -> Result<Option<InstalledRecord>> {
        let path = self.record_path(identifier)?;
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(registry_error(identifier, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| registry_error(identifier, format!("corrupt record {}: {e}", path.display())))
    }

    fn put(&self, record: &InstalledRecord) -> Result<()> {
        let id = &record.identifier;
        let path = self.record_path(id)?;
        let content = serde_json::to_vec_pretty(record).map_err(|e| registry_error(id, e))?;
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| registry_error(id, e))?;
        tmp.write_all(&content).map_err(|e| registry_error(id, e))?;
        tmp.as_file().sync_all().map_err(|e| registry_error(id, e))?;
        tmp.persist(&path).map_err(|e| registry_error(id, e.error))?;
        tracing::trace!(identifier = %id, path = %path.display(), "record written");
        Ok(())
    }

    fn delete(&self, identifier: &str) -> Result<()> {
        let path = self.record_path(identifier)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(registry_error(identifier, e)),
        }
    }

    fn list(&self) -> Result<Vec<InstalledRecord>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| EngineError::io(&self.dir, e))?;
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::io(&self.dir, e))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(identifier) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get(identifier) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable registry record");
                }
            }
        }
        records.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(records)
    }
}

/// An in-process registry, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: Mutex<BTreeMap<String, InstalledRecord>>,
}

impl MemoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, InstalledRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Registry for MemoryRegistry {
    fn get(&self, identifier: &str) -> Result<Option<InstalledRecord>> {
        Ok(self.records().get(identifier).cloned())
    }

    fn put(&self, record: &InstalledRecord) -> Result<()> {
        self.records()
            .insert(record.identifier.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, identifier: &str) -> Result<()> {
        self.records().remove(identifier);
        Ok(())
    }

    fn list(&self) -> Result<Vec<InstalledRecord>> {
        Ok(self.records().values().cloned().collect())
    }
}
