//! Interfaces to the collaborators the lifecycle engine drives.
//!
//! The engine never talks to the network, the native installer, the
//! registry store or the filesystem directly; it goes through these traits so
//! each can be swapped out (the crate ships default implementations in
//! [`crate::loader`], [`crate::fetch`], [`crate::applier`], [`crate::registry`]
//! and [`crate::fs`]).

use std::path::Path;
use semver::Version;
use serde::{Deserialize, Serialize};
use crate::error::{FsError, Result};
use crate::manifest::Manifest;

/// Produces validated manifests by identifier.
pub trait ManifestLoader {
    /// Loads the latest manifest for `identifier`.
    ///
    /// Fails with [`crate::EngineError::ManifestNotFound`] when none exists.
    fn load(&self, identifier: &str) -> Result<Manifest>;

    /// Lists every known version of `identifier` in ascending order.
    fn versions(&self, identifier: &str) -> Result<Vec<Version>>;
}

/// Downloads artifacts.
pub trait ArtifactFetcher {
    /// Fetches the full content at `url`.
    ///
    /// Any transport failure, including timeouts, is reported as
    /// [`crate::EngineError::FetchFailed`].
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Applies and removes native packages.
pub trait PackageApplier {
    /// Installs the staged artifact, recording it under `registry_id`.
    fn apply(&self, artifact: &Path, registry_id: &str) -> Result<()>;

    /// Removes whatever was recorded under `registry_id`.
    ///
    /// Removing a receipt that does not exist succeeds.
    fn remove(&self, registry_id: &str) -> Result<()>;
}

/// Lifecycle state of an installed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecordState {
    /// The recorded version is fully installed.
    Installed,
    /// An install or upgrade towards `target` started and has not finished.
    Installing {
        /// Version being installed.
        target: String,
    },
}

/// What the registry knows about an installed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRecord {
    /// Package identifier, the registry key.
    pub identifier: String,
    /// Installed version (the previous one while an upgrade is in flight).
    pub version: String,
    /// Native receipt id used for removal.
    pub registry_id: String,
    /// Expanded uninstall paths for the installed version.
    #[serde(default)]
    pub installed_paths: Vec<std::path::PathBuf>,
    /// File name of the artifact the installed version was applied from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Unix timestamp of the last state change.
    #[serde(default)]
    pub installed_at: u64,
    /// Installed or in progress.
    #[serde(flatten)]
    pub state: RecordState,
}

impl InstalledRecord {
    /// Returns true if the record describes a finished installation.
    pub fn is_installed(&self) -> bool {
        self.state == RecordState::Installed
    }
}

/// Store of installed records with atomic single-key operations.
pub trait Registry {
    /// Reads the record for `identifier`, if any.
    fn get(&self, identifier: &str) -> Result<Option<InstalledRecord>>;
    /// Writes `record`, replacing any existing one for the same identifier.
    fn put(&self, record: &InstalledRecord) -> Result<()>;
    /// Deletes the record for `identifier`; deleting an absent record succeeds.
    fn delete(&self, identifier: &str) -> Result<()>;
    /// Lists all records.
    fn list(&self) -> Result<Vec<InstalledRecord>>;
}

/// The filesystem operations cleanup needs.
pub trait Filesystem {
    /// Returns true if something exists at `path` (without following a final symlink).
    fn exists(&self, path: &Path) -> bool;
    /// Deletes a file, symlink or directory tree. An absent path is a success.
    fn delete(&self, path: &Path) -> std::result::Result<(), FsError>;
}

impl<T: ManifestLoader + ?Sized> ManifestLoader for &T {
    fn load(&self, identifier: &str) -> Result<Manifest> {
        (**self).load(identifier)
    }
    fn versions(&self, identifier: &str) -> Result<Vec<Version>> {
        (**self).versions(identifier)
    }
}

impl<T: ArtifactFetcher + ?Sized> ArtifactFetcher for &T {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        (**self).fetch(url)
    }
}

impl<T: PackageApplier + ?Sized> PackageApplier for &T {
    fn apply(&self, artifact: &Path, registry_id: &str) -> Result<()> {
        (**self).apply(artifact, registry_id)
    }
    fn remove(&self, registry_id: &str) -> Result<()> {
        (**self).remove(registry_id)
    }
}

impl<T: Registry + ?Sized> Registry for &T {
    fn get(&self, identifier: &str) -> Result<Option<InstalledRecord>> {
        (**self).get(identifier)
    }
    fn put(&self, record: &InstalledRecord) -> Result<()> {
        (**self).put(record)
    }
    fn delete(&self, identifier: &str) -> Result<()> {
        (**self).delete(identifier)
    }
    fn list(&self) -> Result<Vec<InstalledRecord>> {
        (**self).list()
    }
}

impl<T: Filesystem + ?Sized> Filesystem for &T {
    fn exists(&self, path: &Path) -> bool {
        (**self).exists(path)
    }
    fn delete(&self, path: &Path) -> std::result::Result<(), FsError> {
        (**self).delete(path)
    }
}
