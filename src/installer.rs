//! The package lifecycle: install, upgrade, uninstall and zap.
//!
//! [`Engine`] drives one package identifier at a time through
//! `Absent → Installing → Installed → Absent`, with upgrades replacing the
//! installed record in place and zap purging user data. Side effects go
//! through the collaborator traits in [`crate::collab`]; every operation
//! holds the identifier's [`PackageLock`] for its whole duration.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use crate::arch::{resolve, ResolvedArtifact};
use crate::cleanup::{plan, CleanupContext};
use crate::collab::{
    ArtifactFetcher, Filesystem, InstalledRecord, ManifestLoader, PackageApplier, RecordState,
    Registry,
};
use crate::error::{EngineError, FsError, Result};
use crate::global::cache::ArtifactCache;
use crate::lock::PackageLock;
use crate::manifest::Manifest;
use crate::util::parse_version;
use crate::verify::verify_bytes;

/// The host a package is being installed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    /// Normalized architecture tag.
    pub arch: String,
    /// Home directory `~` expands to.
    pub home_dir: PathBuf,
    /// Directory applications live in.
    pub app_dir: PathBuf,
}

/// A deletion that could not be carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    /// The path that was not deleted.
    pub path: PathBuf,
    /// Why.
    pub reason: String,
    /// True when the failure was a permission problem.
    pub permission_denied: bool,
}

/// What a cleanup pass did, path by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Paths that existed and were deleted.
    pub removed: Vec<PathBuf>,
    /// Paths that were already absent.
    pub missing: Vec<PathBuf>,
    /// Paths that could not be deleted.
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// True when every target is now absent.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.missing.extend(other.missing);
        self.failures.extend(other.failures);
    }
}

/// The successful result of a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The package was installed at `version`.
    Installed {
        /// Installed version.
        version: String,
    },
    /// The package moved from `from` to `to`.
    Upgraded {
        /// Previously installed version.
        from: String,
        /// Newly installed version.
        to: String,
    },
    /// Nothing to do: the installed version is not older than the requested one.
    AlreadyUpToDate {
        /// Installed version.
        installed: String,
        /// Version the manifest offers.
        requested: String,
    },
    /// The package was uninstalled.
    Uninstalled {
        /// Version that was removed.
        version: String,
        /// Deletion of the uninstall paths.
        report: CleanupReport,
    },
    /// Nothing to uninstall.
    AlreadyAbsent,
    /// User data was purged, after uninstalling the package if it was still present.
    Zapped {
        /// Version uninstalled as part of the zap, if any.
        uninstalled: Option<String>,
        /// Deletion of uninstall and zap paths.
        report: CleanupReport,
    },
}

/// Where a package currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageStatus {
    /// No record exists.
    Absent,
    /// An install or upgrade started and did not finish.
    Installing {
        /// Version installed before the interrupted operation, if any.
        from: Option<String>,
        /// Version being installed.
        target: String,
    },
    /// Installed at `version`.
    Installed {
        /// Installed version.
        version: String,
    },
}

/// Drives the lifecycle of packages through the given collaborators.
#[derive(Debug)]
pub struct Engine<L, F, A, R, S> {
    loader: L,
    fetcher: F,
    applier: A,
    registry: R,
    fs: S,
    host: HostContext,
    lock_dir: PathBuf,
    cache: Option<ArtifactCache>,
}

impl<L, F, A, R, S> Engine<L, F, A, R, S>
where
    L: ManifestLoader,
    F: ArtifactFetcher,
    A: PackageApplier,
    R: Registry,
    S: Filesystem,
{
    /// Assembles an engine. Locks are taken in `lock_dir`.
    pub fn new(
        loader: L,
        fetcher: F,
        applier: A,
        registry: R,
        fs: S,
        host: HostContext,
        lock_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            loader,
            fetcher,
            applier,
            registry,
            fs,
            host,
            lock_dir: lock_dir.into(),
            cache: None,
        }
    }

    /// Reuses verified downloads from `cache`.
    pub fn with_cache(mut self, cache: ArtifactCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The host this engine installs for.
    pub fn host(&self) -> &HostContext {
        &self.host
    }

    /// Loads the latest manifest for `identifier`.
    pub fn manifest(&self, identifier: &str) -> Result<Manifest> {
        self.loader.load(identifier)
    }

    /// Lists the known versions of `identifier`.
    pub fn versions(&self, identifier: &str) -> Result<Vec<semver::Version>> {
        self.loader.versions(identifier)
    }

    /// Lists every installed or in-progress record.
    pub fn list(&self) -> Result<Vec<InstalledRecord>> {
        self.registry.list()
    }

    /// Reports the state of `identifier` without taking its lock.
    pub fn status(&self, identifier: &str) -> Result<PackageStatus> {
        Ok(match self.registry.get(identifier)? {
            None => PackageStatus::Absent,
            Some(record) => match record.state {
                RecordState::Installed => PackageStatus::Installed {
                    version: record.version,
                },
                RecordState::Installing { target } => PackageStatus::Installing {
                    from: (record.version != target).then_some(record.version),
                    target,
                },
            },
        })
    }

    /// Installs the latest version of `identifier`.
    ///
    /// An interrupted earlier install or upgrade is resumed.
    ///
    /// # Errors
    ///
    /// [`EngineError::AlreadyInstalled`] if the package is installed; any
    /// resolution, fetch, verification or apply error otherwise.
    pub fn install(&self, identifier: &str) -> Result<Outcome> {
        let _lock = PackageLock::acquire(&self.lock_dir, identifier)?;
        let manifest = self.loader.load(identifier)?;
        let prior = self.registry.get(identifier)?;
        if let Some(record) = &prior {
            if record.is_installed() {
                return Err(EngineError::AlreadyInstalled {
                    identifier: identifier.to_string(),
                    version: record.version.clone(),
                });
            }
            tracing::warn!(identifier, version = %record.version, "resuming interrupted installation");
        }
        let record = self.run_pipeline(&manifest, prior.as_ref())?;
        tracing::info!(identifier, version = %record.version, "installed");
        Ok(Outcome::Installed {
            version: record.version,
        })
    }

    /// Upgrades `identifier` to the latest version.
    ///
    /// Returns [`Outcome::AlreadyUpToDate`] without touching anything when
    /// the installed version is not older than the manifest's.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotInstalled`] if there is nothing to upgrade.
    pub fn upgrade(&self, identifier: &str) -> Result<Outcome> {
        let _lock = PackageLock::acquire(&self.lock_dir, identifier)?;
        let manifest = self.loader.load(identifier)?;
        let prior = self
            .registry
            .get(identifier)?
            .ok_or_else(|| EngineError::NotInstalled {
                identifier: identifier.to_string(),
            })?;
        self.upgrade_locked(&manifest, prior)
    }

    /// Installs `identifier` if absent, upgrades it otherwise.
    pub fn install_or_upgrade(&self, identifier: &str) -> Result<Outcome> {
        let _lock = PackageLock::acquire(&self.lock_dir, identifier)?;
        let manifest = self.loader.load(identifier)?;
        match self.registry.get(identifier)? {
            Some(prior) => self.upgrade_locked(&manifest, prior),
            None => {
                let record = self.run_pipeline(&manifest, None)?;
                tracing::info!(identifier, version = %record.version, "installed");
                Ok(Outcome::Installed {
                    version: record.version,
                })
            }
        }
    }

    fn upgrade_locked(&self, manifest: &Manifest, prior: InstalledRecord) -> Result<Outcome> {
        let identifier = &manifest.identifier;
        let installed = parse_version(&prior.version).ok_or_else(|| EngineError::Registry {
            identifier: identifier.clone(),
            reason: format!("recorded version '{}' is not orderable", prior.version),
        })?;
        if prior.is_installed() && manifest.ordered_version() <= &installed {
            tracing::info!(identifier = %identifier, installed = %prior.version, "already up to date");
            return Ok(Outcome::AlreadyUpToDate {
                installed: prior.version,
                requested: manifest.version.clone(),
            });
        }
        let record = self.run_pipeline(manifest, Some(&prior))?;
        if prior.registry_id != record.registry_id {
            if let Err(e) = self.applier.remove(&prior.registry_id) {
                tracing::warn!(identifier = %identifier, registry_id = %prior.registry_id, error = %e, "could not remove previous receipt");
            }
        }
        tracing::info!(identifier = %identifier, from = %prior.version, to = %record.version, "upgraded");
        Ok(Outcome::Upgraded {
            from: prior.version,
            to: record.version,
        })
    }

    /// Uninstalls `identifier`.
    ///
    /// Uninstalling a package that is not installed succeeds with
    /// [`Outcome::AlreadyAbsent`]. Paths that cannot be deleted are reported
    /// in the outcome rather than failing the operation.
    ///
    /// # Errors
    ///
    /// [`EngineError::RemoveFailed`] or [`EngineError::UnsafeCleanupPath`];
    /// the record is left in place in both cases.
    pub fn uninstall(&self, identifier: &str) -> Result<Outcome> {
        let _lock = PackageLock::acquire(&self.lock_dir, identifier)?;
        match self.registry.get(identifier)? {
            None => {
                tracing::info!(identifier, "not installed; nothing to uninstall");
                Ok(Outcome::AlreadyAbsent)
            }
            Some(record) => {
                let report = self.uninstall_locked(&record)?;
                Ok(Outcome::Uninstalled {
                    version: record.version,
                    report,
                })
            }
        }
    }

    /// Purges the user data of `identifier`, uninstalling it first if needed.
    ///
    /// Every zap path is planned before anything is deleted, so an unsafe
    /// template aborts the whole operation.
    pub fn zap(&self, identifier: &str) -> Result<Outcome> {
        let _lock = PackageLock::acquire(&self.lock_dir, identifier)?;
        let manifest = self.loader.load(identifier)?;
        let record = self.registry.get(identifier)?;
        let targets = self.zap_targets(&manifest, record.as_ref())?;

        let mut report = CleanupReport::default();
        let uninstalled = match &record {
            Some(record) => {
                report.merge(self.uninstall_locked(record)?);
                Some(record.version.clone())
            }
            None => None,
        };
        report.merge(self.delete_all(&targets));
        tracing::info!(
            identifier,
            removed = report.removed.len(),
            failed = report.failures.len(),
            "zapped"
        );
        Ok(Outcome::Zapped {
            uninstalled,
            report,
        })
    }

    /// Lists what [`Engine::zap`] would delete, without deleting anything.
    pub fn plan_zap(&self, identifier: &str) -> Result<Vec<PathBuf>> {
        let manifest = self.loader.load(identifier)?;
        let record = self.registry.get(identifier)?;
        let mut targets = Vec::new();
        if let Some(record) = &record {
            targets.extend(self.plan_recorded_paths(record)?);
        }
        targets.extend(self.zap_targets(&manifest, record.as_ref())?);
        Ok(targets)
    }

    /// Drops cached downloads of `identifier` except the installed version's.
    pub fn cleanup_cache(&self, identifier: &str) -> Result<Vec<PathBuf>> {
        let Some(cache) = &self.cache else {
            return Ok(Vec::new());
        };
        let _lock = PackageLock::acquire(&self.lock_dir, identifier)?;
        let keep = self
            .registry
            .get(identifier)?
            .and_then(|record| record.artifact);
        cache.prune(identifier, keep.as_deref())
    }

    fn cleanup_context<'a>(&'a self, version: &'a str) -> CleanupContext<'a> {
        CleanupContext {
            home_dir: &self.host.home_dir,
            app_dir: &self.host.app_dir,
            version,
        }
    }

    fn zap_targets(&self, manifest: &Manifest, record: Option<&InstalledRecord>) -> Result<Vec<PathBuf>> {
        let version = record.map_or(manifest.version.as_str(), |r| r.version.as_str());
        plan(&manifest.zap_paths, &self.cleanup_context(version))
    }

    fn plan_recorded_paths(&self, record: &InstalledRecord) -> Result<Vec<PathBuf>> {
        let templates: Vec<String> = record
            .installed_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        plan(&templates, &self.cleanup_context(&record.version))
    }

    /// Resolve, fetch, verify, stage, apply and record one manifest.
    ///
    /// Nothing is written to the registry until the artifact is verified. If
    /// the applier fails, `prior` is restored (or the record removed).
    fn run_pipeline(&self, manifest: &Manifest, prior: Option<&InstalledRecord>) -> Result<InstalledRecord> {
        let identifier = &manifest.identifier;
        let resolved = resolve(manifest, &self.host.arch)?;
        let installed_paths = plan(
            &manifest.uninstall.delete_paths,
            &self.cleanup_context(&manifest.version),
        )?;
        let bytes = self.obtain(manifest, &resolved)?;

        let staging = tempfile::Builder::new()
            .prefix("casket-stage")
            .tempdir()
            .map_err(|e| EngineError::io(std::env::temp_dir(), e))?;
        let artifact_path = staging.path().join(&resolved.artifact_name);
        std::fs::write(&artifact_path, &bytes).map_err(|e| EngineError::io(&artifact_path, e))?;
        drop(bytes);

        let target = manifest.version.clone();
        let registry_id = manifest.registry_id().to_string();
        let pending = match prior {
            Some(prior) => InstalledRecord {
                state: RecordState::Installing {
                    target: target.clone(),
                },
                installed_at: now(),
                ..prior.clone()
            },
            None => InstalledRecord {
                identifier: identifier.clone(),
                version: target.clone(),
                registry_id: registry_id.clone(),
                installed_paths: installed_paths.clone(),
                artifact: Some(resolved.artifact_name.clone()),
                installed_at: now(),
                state: RecordState::Installing {
                    target: target.clone(),
                },
            },
        };
        self.registry.put(&pending)?;
        tracing::debug!(identifier = %identifier, target = %target, "applying artifact");

        if let Err(e) = self.applier.apply(&artifact_path, &registry_id) {
            self.roll_back(identifier, prior);
            return Err(e);
        }

        let record = InstalledRecord {
            identifier: identifier.clone(),
            version: target,
            registry_id,
            installed_paths,
            artifact: Some(resolved.artifact_name.clone()),
            installed_at: now(),
            state: RecordState::Installed,
        };
        self.registry.put(&record)?;
        Ok(record)
    }

    /// Returns verified artifact bytes, from the cache when possible.
    fn obtain(&self, manifest: &Manifest, resolved: &ResolvedArtifact) -> Result<Vec<u8>> {
        let identifier = &manifest.identifier;
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.get(identifier, &resolved.artifact_name, &resolved.checksum) {
                tracing::debug!(identifier = %identifier, artifact = %resolved.artifact_name, "using cached artifact");
                return Ok(bytes);
            }
        }
        tracing::info!(identifier = %identifier, url = %resolved.url, "downloading");
        let bytes = self.fetcher.fetch(&resolved.url)?;
        verify_bytes(&bytes, &resolved.checksum, &resolved.url)?;
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(identifier, &resolved.artifact_name, &bytes) {
                tracing::warn!(identifier = %identifier, error = %e, "could not cache artifact");
            }
        }
        Ok(bytes)
    }

    fn roll_back(&self, identifier: &str, prior: Option<&InstalledRecord>) {
        let restored = match prior {
            Some(prior) => self.registry.put(prior),
            None => self.registry.delete(identifier),
        };
        if let Err(e) = restored {
            tracing::error!(identifier, error = %e, "could not roll back registry record");
        }
    }

    fn uninstall_locked(&self, record: &InstalledRecord) -> Result<CleanupReport> {
        let identifier = &record.identifier;
        let paths = self.plan_recorded_paths(record)?;
        self.applier.remove(&record.registry_id)?;
        let report = self.delete_all(&paths);
        self.registry.delete(identifier)?;
        tracing::info!(identifier = %identifier, version = %record.version, "uninstalled");
        Ok(report)
    }

    /// Deletes every path, collecting failures instead of stopping at them.
    fn delete_all(&self, paths: &[PathBuf]) -> CleanupReport {
        let mut report = CleanupReport::default();
        for path in paths {
            if !self.fs.exists(path) {
                report.missing.push(path.clone());
                continue;
            }
            match self.fs.delete(path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "deleted");
                    report.removed.push(path.clone());
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "could not delete");
                    report.failures.push(failure(path, &e));
                }
            }
        }
        report
    }
}

fn failure(path: &Path, error: &FsError) -> CleanupFailure {
    CleanupFailure {
        path: path.to_path_buf(),
        reason: error.to_string(),
        permission_denied: matches!(error, FsError::PermissionDenied(_)),
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
