//! Native package appliers.
//!
//! `.pkg` artifacts are handed to the system installer and removed using the
//! file list of their `pkgutil` receipt; `.zip` and `.tar.gz` artifacts are unpacked into the
//! application directory with a receipt recording what was placed there.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use crate::collab::PackageApplier;
use crate::error::{EngineError, Result};
use crate::util::{has_extension, is_valid_identifier};

const PKG_EXTENSIONS: &[&str] = &[".pkg", ".mpkg"];
const ZIP_EXTENSIONS: &[&str] = &[".zip"];
const TAR_GZ_EXTENSIONS: &[&str] = &[".tar.gz", ".tgz"];

/// Applies macOS `.pkg` installers with `installer(8)`; removal deletes the
/// payload listed by `pkgutil(1)` and then forgets the receipt.
#[derive(Debug, Clone)]
pub struct PkgApplier {
    installer: String,
    pkgutil: String,
    target: String,
}

impl PkgApplier {
    /// Creates an applier installing onto the volume `target` (usually `/`).
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            installer: "installer".to_string(),
            pkgutil: "pkgutil".to_string(),
            target: target.into(),
        }
    }

    /// Overrides the programs used, e.g. to route through a wrapper.
    pub fn with_programs(mut self, installer: impl Into<String>, pkgutil: impl Into<String>) -> Self {
        self.installer = installer.into();
        self.pkgutil = pkgutil.into();
        self
    }

    /// Lists the paths of a receipt, relative to the install volume.
    fn receipt_paths(&self, registry_id: &str, kind: &str) -> Result<Vec<PathBuf>> {
        let output = Command::new(&self.pkgutil)
            .args([kind, "--files", registry_id])
            .output()
            .map_err(|e| EngineError::RemoveFailed {
                registry_id: registry_id.to_string(),
                reason: format!("could not run {}: {e}", self.pkgutil),
            })?;
        if !output.status.success() {
            return Err(EngineError::RemoveFailed {
                registry_id: registry_id.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Joins a receipt path onto the target volume, refusing anything that
    /// could leave it.
    fn on_target(&self, relative: &Path) -> Option<PathBuf> {
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        let named = relative.components().any(|c| matches!(c, Component::Normal(_)));
        (contained && named).then(|| Path::new(&self.target).join(relative))
    }

    /// Deletes the files recorded in the receipt, then prunes bundle
    /// directories left empty. Shared directories such as `usr/local/bin`
    /// are never removed.
    fn remove_payload(&self, registry_id: &str) -> Result<()> {
        let mut removed = 0usize;
        for relative in self.receipt_paths(registry_id, "--only-files")? {
            let Some(path) = self.on_target(&relative) else {
                tracing::warn!(registry_id, path = %relative.display(), "ignoring receipt path outside the target");
                continue;
            };
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(EngineError::RemoveFailed {
                        registry_id: registry_id.to_string(),
                        reason: format!("{}: {e}", path.display()),
                    })
                }
            }
        }

        let mut dirs: Vec<PathBuf> = self
            .receipt_paths(registry_id, "--only-dirs")?
            .into_iter()
            .filter(|dir| dir.components().any(|c| c.as_os_str().to_string_lossy().ends_with(".app")))
            .filter_map(|dir| self.on_target(&dir))
            .collect();
        dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
        for dir in dirs {
            // non-empty or already gone
            let _ = std::fs::remove_dir(&dir);
        }
        tracing::debug!(registry_id, removed, "removed package payload");
        Ok(())
    }

    fn receipt_known(&self, registry_id: &str) -> Result<bool> {
        let output = Command::new(&self.pkgutil)
            .args(["--pkg-info", registry_id])
            .output();
        match output {
            Ok(output) => Ok(output.status.success()),
            // Without pkgutil there is no receipt database to consult.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(EngineError::RemoveFailed {
                registry_id: registry_id.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

impl PackageApplier for PkgApplier {
    fn apply(&self, artifact: &Path, _registry_id: &str) -> Result<()> {
        tracing::info!(artifact = %artifact.display(), target = %self.target, "running installer");
        let failed = |reason: String| EngineError::ApplyFailed {
            artifact: artifact.to_path_buf(),
            reason,
        };
        let output = Command::new(&self.installer)
            .arg("-pkg")
            .arg(artifact)
            .args(["-target", &self.target])
            .output()
            .map_err(|e| failed(format!("could not run {}: {e}", self.installer)))?;
        if !output.status.success() {
            return Err(failed(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        Ok(())
    }

    fn remove(&self, registry_id: &str) -> Result<()> {
        if !self.receipt_known(registry_id)? {
            tracing::debug!(registry_id, "no package receipt to forget");
            return Ok(());
        }
        self.remove_payload(registry_id)?;
        let output = Command::new(&self.pkgutil)
            .args(["--forget", registry_id])
            .output()
            .map_err(|e| EngineError::RemoveFailed {
                registry_id: registry_id.to_string(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(EngineError::RemoveFailed {
                registry_id: registry_id.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// What an [`ArchiveApplier`] placed in the destination for one registry id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Top-level entries created in the destination directory.
    pub entries: Vec<PathBuf>,
}

/// Unpacks archives into a destination directory.
#[derive(Debug, Clone)]
pub struct ArchiveApplier {
    dest: PathBuf,
    receipts: PathBuf,
}

impl ArchiveApplier {
    /// Creates an applier unpacking into `dest` and keeping receipts in `receipts`.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(dest: P, receipts: Q) -> Self {
        Self {
            dest: dest.as_ref().to_path_buf(),
            receipts: receipts.as_ref().to_path_buf(),
        }
    }

    /// Returns true if this applier understands the artifact format.
    pub fn supports(artifact: &Path) -> bool {
        has_extension(artifact, ZIP_EXTENSIONS) || has_extension(artifact, TAR_GZ_EXTENSIONS)
    }

    fn receipt_path(&self, registry_id: &str) -> Result<PathBuf> {
        if !is_valid_identifier(registry_id) {
            return Err(EngineError::RemoveFailed {
                registry_id: registry_id.to_string(),
                reason: "registry id is not a valid file name".to_string(),
            });
        }
        Ok(self.receipts.join(format!("{registry_id}.json")))
    }

    /// Reads the receipt for `registry_id`, if one exists.
    pub fn receipt(&self, registry_id: &str) -> Result<Option<Receipt>> {
        let path = self.receipt_path(registry_id)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| EngineError::RemoveFailed {
                    registry_id: registry_id.to_string(),
                    reason: format!("corrupt receipt {}: {e}", path.display()),
                }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::io(path, e)),
        }
    }

    fn unpack(&self, artifact: &Path, into: &Path) -> std::result::Result<(), String> {
        let file = File::open(artifact).map_err(|e| e.to_string())?;
        if has_extension(artifact, ZIP_EXTENSIONS) {
            let mut archive = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;
            archive.extract(into).map_err(|e| e.to_string())
        } else if has_extension(artifact, TAR_GZ_EXTENSIONS) {
            tar::Archive::new(GzDecoder::new(file))
                .unpack(into)
                .map_err(|e| e.to_string())
        } else {
            Err("unsupported archive format".to_string())
        }
    }

    fn write_receipt(&self, registry_id: &str, receipt: &Receipt) -> Result<()> {
        std::fs::create_dir_all(&self.receipts).map_err(|e| EngineError::io(&self.receipts, e))?;
        let path = self.receipt_path(registry_id)?;
        let content = serde_json::to_string_pretty(receipt).map_err(|e| EngineError::ApplyFailed {
            artifact: path.clone(),
            reason: e.to_string(),
        })?;
        std::fs::write(&path, content).map_err(|e| EngineError::io(path, e))
    }
}

fn remove_entry(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

impl PackageApplier for ArchiveApplier {
    fn apply(&self, artifact: &Path, registry_id: &str) -> Result<()> {
        let failed = |reason: String| EngineError::ApplyFailed {
            artifact: artifact.to_path_buf(),
            reason,
        };
        std::fs::create_dir_all(&self.dest).map_err(|e| failed(e.to_string()))?;
        let previous = self.receipt(registry_id).map_err(|e| failed(e.to_string()))?;

        // Unpack next to the destination so the final moves are renames.
        let staging = tempfile::Builder::new()
            .prefix(".casket-unpack")
            .tempdir_in(&self.dest)
            .map_err(|e| failed(e.to_string()))?;
        self.unpack(artifact, staging.path()).map_err(failed)?;

        let mut entries = Vec::new();
        let listing = std::fs::read_dir(staging.path()).map_err(|e| failed(e.to_string()))?;
        for entry in listing {
            let entry = entry.map_err(|e| failed(e.to_string()))?;
            let target = self.dest.join(entry.file_name());
            remove_entry(&target).map_err(|e| failed(format!("{}: {e}", target.display())))?;
            std::fs::rename(entry.path(), &target)
                .map_err(|e| failed(format!("{}: {e}", target.display())))?;
            entries.push(target);
        }
        entries.sort();
        if entries.is_empty() {
            return Err(failed("archive is empty".to_string()));
        }

        if let Some(previous) = previous {
            let current: BTreeSet<&PathBuf> = entries.iter().collect();
            for stale in previous.entries.iter().filter(|p| !current.contains(p)) {
                if let Err(e) = remove_entry(stale) {
                    tracing::warn!(path = %stale.display(), error = %e, "could not remove stale entry");
                }
            }
        }

        tracing::info!(registry_id, entries = entries.len(), dest = %self.dest.display(), "unpacked archive");
        self.write_receipt(registry_id, &Receipt { entries })
    }

    fn remove(&self, registry_id: &str) -> Result<()> {
        let Some(receipt) = self.receipt(registry_id)? else {
            return Ok(());
        };
        for entry in &receipt.entries {
            if !entry.starts_with(&self.dest) {
                return Err(EngineError::RemoveFailed {
                    registry_id: registry_id.to_string(),
                    reason: format!("receipt entry {} is outside {}", entry.display(), self.dest.display()),
                });
            }
            remove_entry(entry).map_err(|e| EngineError::RemoveFailed {
                registry_id: registry_id.to_string(),
                reason: format!("{}: {e}", entry.display()),
            })?;
        }
        let path = self.receipt_path(registry_id)?;
        remove_entry(&path).map_err(|e| EngineError::io(path, e))
    }
}

/// Dispatches to [`PkgApplier`] or [`ArchiveApplier`] by artifact type.
#[derive(Debug, Clone)]
pub struct NativeApplier {
    pkg: PkgApplier,
    archive: ArchiveApplier,
}

impl NativeApplier {
    /// Combines the two appliers.
    pub fn new(pkg: PkgApplier, archive: ArchiveApplier) -> Self {
        Self { pkg, archive }
    }
}

impl PackageApplier for NativeApplier {
    fn apply(&self, artifact: &Path, registry_id: &str) -> Result<()> {
        if has_extension(artifact, PKG_EXTENSIONS) {
            self.pkg.apply(artifact, registry_id)
        } else if ArchiveApplier::supports(artifact) {
            self.archive.apply(artifact, registry_id)
        } else {
            Err(EngineError::ApplyFailed {
                artifact: artifact.to_path_buf(),
                reason: "unsupported artifact type".to_string(),
            })
        }
    }

    fn remove(&self, registry_id: &str) -> Result<()> {
        if self.archive.receipt(registry_id)?.is_some() {
            self.archive.remove(registry_id)
        } else {
            self.pkg.remove(registry_id)
        }
    }
}
