use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use semver::Version;
use tempfile::TempDir;
use casket::verify::digest_bytes;
use casket::*;

const IDENTIFIER: &str = "com.example.tool";

fn payload(version: &str) -> Vec<u8> {
    format!("tool payload {version}").into_bytes()
}

fn checksum(bytes: &[u8]) -> String {
    hex::encode(digest_bytes(bytes))
}

fn url(version: &str) -> String {
    format!("https://downloads.example.test/tool-{version}.tar.gz")
}

fn manifest(version: &str) -> Manifest {
    manifest_with(version, IDENTIFIER, r#"["~/Library/Application Support/com.example.tool", "~/.tool.json"]"#)
}

fn manifest_with(version: &str, registry_id: &str, zap_paths: &str) -> Manifest {
    let toml = format!(
        r#"
identifier = "{IDENTIFIER}"
version = "{version}"
display_name = "Tool"
caveats = "Restart your shell."
zap_paths = {zap_paths}

[variants.arm64]
url = "https://downloads.example.test/tool-{{version}}.tar.gz"
checksum = "{sum}"

[uninstall]
registry_id = "{registry_id}"
delete_paths = ["~/Applications/Tool.app"]
"#,
        sum = checksum(&payload(version)),
    );
    Manifest::from_toml_str(&toml).unwrap()
}

#[derive(Default)]
struct FakeLoader {
    manifests: Mutex<Vec<Manifest>>,
}

impl FakeLoader {
    fn publish(&self, manifest: Manifest) {
        self.manifests.lock().unwrap().push(manifest);
    }
}

impl ManifestLoader for FakeLoader {
    fn load(&self, identifier: &str) -> Result<Manifest> {
        self.manifests
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.identifier == identifier)
            .max_by(|a, b| a.ordered_version().cmp(b.ordered_version()))
            .cloned()
            .ok_or_else(|| EngineError::ManifestNotFound {
                identifier: identifier.to_string(),
            })
    }

    fn versions(&self, identifier: &str) -> Result<Vec<Version>> {
        let mut versions: Vec<_> = self
            .manifests
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.identifier == identifier)
            .map(|m| m.ordered_version().clone())
            .collect();
        versions.sort();
        Ok(versions)
    }
}

#[derive(Default)]
struct FakeFetcher {
    overrides: Mutex<HashMap<String, Vec<u8>>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl FakeFetcher {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ArtifactFetcher for FakeFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(EngineError::FetchFailed {
                url: url.to_string(),
                reason: "timed out".to_string(),
            });
        }
        if let Some(bytes) = self.overrides.lock().unwrap().get(url) {
            return Ok(bytes.clone());
        }
        let version = url
            .strip_prefix("https://downloads.example.test/tool-")
            .and_then(|rest| rest.strip_suffix(".tar.gz"))
            .unwrap_or_default();
        Ok(payload(version))
    }
}

/// Installs by writing the payload into `<app_dir>/Tool.app/payload`.
struct FakeApplier {
    app: PathBuf,
    fail_apply: AtomicBool,
    fail_remove: AtomicBool,
    applied: Mutex<Vec<(String, String)>>,
    removed: Mutex<Vec<String>>,
}

impl FakeApplier {
    fn new(app_dir: &Path) -> Self {
        Self {
            app: app_dir.join("Tool.app"),
            fail_apply: AtomicBool::new(false),
            fail_remove: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    fn apply_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }
}

impl PackageApplier for FakeApplier {
    fn apply(&self, artifact: &Path, registry_id: &str) -> Result<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(EngineError::ApplyFailed {
                artifact: artifact.to_path_buf(),
                reason: "installer exited with status 1".to_string(),
            });
        }
        let bytes = std::fs::read(artifact).unwrap();
        std::fs::create_dir_all(&self.app).unwrap();
        std::fs::write(self.app.join("payload"), &bytes).unwrap();
        let name = artifact.file_name().unwrap().to_string_lossy().to_string();
        self.applied.lock().unwrap().push((name, registry_id.to_string()));
        Ok(())
    }

    fn remove(&self, registry_id: &str) -> Result<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(EngineError::RemoveFailed {
                registry_id: registry_id.to_string(),
                reason: "pkgutil exited with status 1".to_string(),
            });
        }
        self.removed.lock().unwrap().push(registry_id.to_string());
        Ok(())
    }
}

struct World {
    dir: TempDir,
    home: PathBuf,
    apps: PathBuf,
    loader: FakeLoader,
    fetcher: FakeFetcher,
    applier: FakeApplier,
}

type TestEngine<'a> = Engine<&'a FakeLoader, &'a FakeFetcher, &'a FakeApplier, FileRegistry, LocalFilesystem>;

impl World {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("home");
        let apps = home.join("Applications");
        std::fs::create_dir_all(&apps).unwrap();
        Self {
            applier: FakeApplier::new(&apps),
            dir,
            home,
            apps,
            loader: FakeLoader::default(),
            fetcher: FakeFetcher::default(),
        }
    }

    fn engine(&self) -> TestEngine<'_> {
        self.engine_for("arm64")
    }

    fn engine_for(&self, arch: &str) -> TestEngine<'_> {
        Engine::new(
            &self.loader,
            &self.fetcher,
            &self.applier,
            self.registry(),
            LocalFilesystem,
            HostContext {
                arch: arch.to_string(),
                home_dir: self.home.clone(),
                app_dir: self.apps.clone(),
            },
            self.dir.path().join("locks"),
        )
    }

    fn registry(&self) -> FileRegistry {
        FileRegistry::open(self.dir.path().join("registry")).unwrap()
    }

    fn record(&self) -> Option<InstalledRecord> {
        self.registry().get(IDENTIFIER).unwrap()
    }

    fn app(&self) -> PathBuf {
        self.apps.join("Tool.app")
    }

    fn user_data(&self) -> Vec<PathBuf> {
        let support = self.home.join("Library/Application Support/com.example.tool");
        std::fs::create_dir_all(&support).unwrap();
        std::fs::write(support.join("settings.json"), "{}").unwrap();
        let dotfile = self.home.join(".tool.json");
        std::fs::write(&dotfile, "{}").unwrap();
        vec![support, dotfile]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_records_and_applies() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let engine = world.engine();

        let outcome = engine.install(IDENTIFIER).unwrap();
        assert_eq!(outcome, Outcome::Installed { version: "1.0.0".to_string() });

        let record = world.record().unwrap();
        assert!(record.is_installed());
        assert_eq!(record.version, "1.0.0");
        assert_eq!(record.registry_id, IDENTIFIER);
        assert_eq!(record.installed_paths, vec![world.app()]);
        assert_eq!(record.artifact.as_deref(), Some("tool-1.0.0.tar.gz"));
        assert_eq!(
            world.applier.applied.lock().unwrap().as_slice(),
            &[("tool-1.0.0.tar.gz".to_string(), IDENTIFIER.to_string())]
        );
        assert_eq!(std::fs::read(world.app().join("payload")).unwrap(), payload("1.0.0"));
        assert_eq!(
            engine.status(IDENTIFIER).unwrap(),
            PackageStatus::Installed { version: "1.0.0".to_string() }
        );
    }

    #[test]
    fn test_install_twice_is_already_installed() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let engine = world.engine();
        engine.install(IDENTIFIER).unwrap();

        let err = engine.install(IDENTIFIER).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyInstalled { ref version, .. } if version == "1.0.0"));
        assert_eq!(world.fetcher.calls(), 1);
    }

    #[test]
    fn test_install_uninstall_install_ends_installed() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let engine = world.engine();

        engine.install(IDENTIFIER).unwrap();
        let outcome = engine.uninstall(IDENTIFIER).unwrap();
        match outcome {
            Outcome::Uninstalled { version, report } => {
                assert_eq!(version, "1.0.0");
                assert_eq!(report.removed, vec![world.app()]);
                assert!(report.is_clean());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(world.record().is_none());
        assert!(!world.app().exists());
        assert_eq!(world.applier.removed.lock().unwrap().as_slice(), &[IDENTIFIER.to_string()]);

        engine.install(IDENTIFIER).unwrap();
        let records = engine.list().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_installed());
        assert_eq!(records[0].version, "1.0.0");
    }

    #[test]
    fn test_uninstall_twice_is_idempotent() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let engine = world.engine();
        engine.install(IDENTIFIER).unwrap();
        engine.uninstall(IDENTIFIER).unwrap();
        assert_eq!(engine.uninstall(IDENTIFIER).unwrap(), Outcome::AlreadyAbsent);
        assert_eq!(world.applier.removed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_uninstall_tolerates_missing_paths() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let engine = world.engine();
        engine.install(IDENTIFIER).unwrap();
        std::fs::remove_dir_all(world.app()).unwrap();

        match engine.uninstall(IDENTIFIER).unwrap() {
            Outcome::Uninstalled { report, .. } => {
                assert!(report.removed.is_empty());
                assert_eq!(report.missing, vec![world.app()]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(world.record().is_none());
    }

    #[test]
    fn test_remove_failure_keeps_record() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let engine = world.engine();
        engine.install(IDENTIFIER).unwrap();
        world.applier.fail_remove.store(true, Ordering::SeqCst);

        let err = engine.uninstall(IDENTIFIER).unwrap_err();
        assert!(matches!(err, EngineError::RemoveFailed { .. }));
        assert!(world.record().unwrap().is_installed());
        assert!(world.app().exists());
    }

    #[test]
    fn test_upgrade_replaces_record() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let engine = world.engine();
        engine.install(IDENTIFIER).unwrap();

        world.loader.publish(manifest("1.1.0"));
        let outcome = engine.upgrade(IDENTIFIER).unwrap();
        assert_eq!(
            outcome,
            Outcome::Upgraded { from: "1.0.0".to_string(), to: "1.1.0".to_string() }
        );
        let record = world.record().unwrap();
        assert_eq!(record.version, "1.1.0");
        assert!(record.is_installed());
        assert_eq!(world.registry().list().unwrap().len(), 1);
        assert_eq!(std::fs::read(world.app().join("payload")).unwrap(), payload("1.1.0"));
        // same receipt id, nothing to forget
        assert!(world.applier.removed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_upgrade_to_same_or_older_is_up_to_date() {
        let world = World::new();
        world.loader.publish(manifest("1.1.0"));
        let engine = world.engine();
        engine.install(IDENTIFIER).unwrap();
        let before = world.record().unwrap();

        assert_eq!(
            engine.upgrade(IDENTIFIER).unwrap(),
            Outcome::AlreadyUpToDate { installed: "1.1.0".to_string(), requested: "1.1.0".to_string() }
        );

        world.loader.manifests.lock().unwrap().clear();
        world.loader.publish(manifest("1.0.9"));
        assert!(matches!(engine.upgrade(IDENTIFIER).unwrap(), Outcome::AlreadyUpToDate { .. }));

        assert_eq!(world.record().unwrap(), before);
        assert_eq!(world.fetcher.calls(), 1);
        assert_eq!(world.applier.apply_count(), 1);
    }

    #[test]
    fn test_upgrade_orders_versions_numerically() {
        let world = World::new();
        world.loader.publish(manifest("1.9.0"));
        let engine = world.engine();
        engine.install(IDENTIFIER).unwrap();
        world.loader.publish(manifest("1.10.0"));
        assert!(matches!(engine.upgrade(IDENTIFIER).unwrap(), Outcome::Upgraded { .. }));
    }

    #[test]
    fn test_upgrade_requires_installation() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let err = world.engine().upgrade(IDENTIFIER).unwrap_err();
        assert!(matches!(err, EngineError::NotInstalled { .. }));
        assert_eq!(world.fetcher.calls(), 0);
    }

    #[test]
    fn test_upgrade_with_new_registry_id_forgets_old_receipt() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let engine = world.engine();
        engine.install(IDENTIFIER).unwrap();

        world.loader.publish(manifest_with("2.0.0", "com.example.tool.v2", "[]"));
        engine.upgrade(IDENTIFIER).unwrap();
        assert_eq!(world.record().unwrap().registry_id, "com.example.tool.v2");
        assert_eq!(world.applier.removed.lock().unwrap().as_slice(), &[IDENTIFIER.to_string()]);
    }

    #[test]
    fn test_install_or_upgrade_routes() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let engine = world.engine();
        assert!(matches!(engine.install_or_upgrade(IDENTIFIER).unwrap(), Outcome::Installed { .. }));
        assert!(matches!(engine.install_or_upgrade(IDENTIFIER).unwrap(), Outcome::AlreadyUpToDate { .. }));
        world.loader.publish(manifest("1.0.1"));
        assert!(matches!(engine.install_or_upgrade(IDENTIFIER).unwrap(), Outcome::Upgraded { .. }));
    }

    #[test]
    fn test_unsupported_architecture_fails_before_fetch() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let err = world.engine_for("x86_64").install(IDENTIFIER).unwrap_err();
        match err {
            EngineError::UnsupportedArchitecture { host, available, .. } => {
                assert_eq!(host, "x64");
                assert_eq!(available, "arm64");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(world.fetcher.calls(), 0);
        assert!(world.record().is_none());
    }

    #[test]
    fn test_integrity_mismatch_leaves_no_trace() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        world
            .fetcher
            .overrides
            .lock()
            .unwrap()
            .insert(url("1.0.0"), b"tampered".to_vec());

        let err = world.engine().install(IDENTIFIER).unwrap_err();
        match err {
            EngineError::IntegrityMismatch { expected, actual, .. } => {
                assert_eq!(expected, checksum(&payload("1.0.0")));
                assert_eq!(actual, checksum(b"tampered"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(world.record().is_none());
        assert_eq!(world.applier.apply_count(), 0);
        assert!(!world.app().exists());
    }

    #[test]
    fn test_fetch_failure_during_upgrade_keeps_old_version() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let engine = world.engine();
        engine.install(IDENTIFIER).unwrap();
        let before = world.record().unwrap();

        world.loader.publish(manifest("1.1.0"));
        world.fetcher.offline.store(true, Ordering::SeqCst);
        let err = engine.upgrade(IDENTIFIER).unwrap_err();
        assert!(matches!(err, EngineError::FetchFailed { .. }));
        assert_eq!(world.record().unwrap(), before);
    }

    #[test]
    fn test_apply_failure_rolls_back() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let engine = world.engine();
        world.applier.fail_apply.store(true, Ordering::SeqCst);
        assert!(matches!(engine.install(IDENTIFIER), Err(EngineError::ApplyFailed { .. })));
        assert!(world.record().is_none());

        world.applier.fail_apply.store(false, Ordering::SeqCst);
        engine.install(IDENTIFIER).unwrap();
        let before = world.record().unwrap();

        world.loader.publish(manifest("1.1.0"));
        world.applier.fail_apply.store(true, Ordering::SeqCst);
        assert!(matches!(engine.upgrade(IDENTIFIER), Err(EngineError::ApplyFailed { .. })));
        assert_eq!(world.record().unwrap(), before);
    }

    #[test]
    fn test_interrupted_install_is_resumed() {
        let world = World::new();
        world.loader.publish(manifest("1.1.0"));
        world
            .registry()
            .put(&InstalledRecord {
                identifier: IDENTIFIER.to_string(),
                version: "1.0.0".to_string(),
                registry_id: IDENTIFIER.to_string(),
                installed_paths: vec![world.app()],
                artifact: None,
                installed_at: 0,
                state: RecordState::Installing { target: "1.1.0".to_string() },
            })
            .unwrap();
        let engine = world.engine();
        assert_eq!(
            engine.status(IDENTIFIER).unwrap(),
            PackageStatus::Installing { from: Some("1.0.0".to_string()), target: "1.1.0".to_string() }
        );

        assert_eq!(
            engine.install(IDENTIFIER).unwrap(),
            Outcome::Installed { version: "1.1.0".to_string() }
        );
        assert!(world.record().unwrap().is_installed());
    }

    #[test]
    fn test_zap_uninstalls_and_purges() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let engine = world.engine();
        engine.install(IDENTIFIER).unwrap();
        let data = world.user_data();

        match engine.zap(IDENTIFIER).unwrap() {
            Outcome::Zapped { uninstalled, report } => {
                assert_eq!(uninstalled.as_deref(), Some("1.0.0"));
                let mut expected = vec![world.app()];
                expected.extend(data.iter().cloned());
                assert_eq!(report.removed, expected);
                assert!(report.is_clean());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(world.record().is_none());
        assert!(data.iter().all(|p| !p.exists()));
        assert!(world.home.exists());
    }

    #[test]
    fn test_zap_twice_is_idempotent() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let engine = world.engine();
        engine.install(IDENTIFIER).unwrap();
        world.user_data();
        engine.zap(IDENTIFIER).unwrap();

        match engine.zap(IDENTIFIER).unwrap() {
            Outcome::Zapped { uninstalled, report } => {
                assert_eq!(uninstalled, None);
                assert!(report.removed.is_empty());
                assert_eq!(report.missing.len(), 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(world.record().is_none());
    }

    #[test]
    fn test_unsafe_zap_path_aborts_before_deleting() {
        let world = World::new();
        world.loader.publish(manifest_with("1.0.0", IDENTIFIER, r#"["~/.tool.json", "/etc/hosts"]"#));
        let engine = world.engine();
        engine.install(IDENTIFIER).unwrap();
        let data = world.user_data();

        let err = engine.zap(IDENTIFIER).unwrap_err();
        assert!(matches!(err, EngineError::UnsafeCleanupPath { ref template, .. } if template == "/etc/hosts"));
        assert!(data.iter().all(|p| p.exists()));
        assert!(world.app().exists());
        assert!(world.record().unwrap().is_installed());
    }

    #[cfg(unix)]
    #[test]
    fn test_zap_refuses_symlinked_library_leaving_home() {
        let world = World::new();
        world.loader.publish(manifest_with("1.0.0", IDENTIFIER, r#"["~/Library/Caches/victim"]"#));
        let engine = world.engine();
        engine.install(IDENTIFIER).unwrap();

        let outside = world.dir.path().join("outside");
        std::fs::create_dir_all(outside.join("Caches")).unwrap();
        let victim = outside.join("Caches/victim");
        std::fs::write(&victim, "keep me").unwrap();
        std::os::unix::fs::symlink(&outside, world.home.join("Library")).unwrap();

        assert!(matches!(
            engine.plan_zap(IDENTIFIER),
            Err(EngineError::UnsafeCleanupPath { .. })
        ));
        let err = engine.zap(IDENTIFIER).unwrap_err();
        assert!(matches!(err, EngineError::UnsafeCleanupPath { ref template, .. } if template == "~/Library/Caches/victim"));
        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "keep me");
        assert!(world.app().exists());
        assert!(world.record().unwrap().is_installed());
    }

    #[test]
    fn test_plan_zap_lists_targets_without_deleting() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let engine = world.engine();
        engine.install(IDENTIFIER).unwrap();
        let data = world.user_data();

        let mut expected = vec![world.app()];
        expected.extend(data.iter().cloned());
        assert_eq!(engine.plan_zap(IDENTIFIER).unwrap(), expected);
        assert!(data.iter().all(|p| p.exists()));
        assert!(world.record().is_some());
    }

    #[test]
    fn test_cache_avoids_second_download() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let cache = ArtifactCache::new(world.dir.path().join("cache"));
        let engine = world.engine().with_cache(cache.clone());

        engine.install(IDENTIFIER).unwrap();
        engine.uninstall(IDENTIFIER).unwrap();
        engine.install(IDENTIFIER).unwrap();
        assert_eq!(world.fetcher.calls(), 1);
        assert_eq!(world.applier.apply_count(), 2);

        world.loader.publish(manifest("1.1.0"));
        engine.upgrade(IDENTIFIER).unwrap();
        let removed = engine.cleanup_cache(IDENTIFIER).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].ends_with("tool-1.0.0.tar.gz"));
        assert!(cache.is_cached(IDENTIFIER));
    }

    #[test]
    fn test_concurrent_installs_serialize() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        let engine = world.engine();

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2).map(|_| s.spawn(|| engine.install(IDENTIFIER))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let installed = results.iter().filter(|r| matches!(r, Ok(Outcome::Installed { .. }))).count();
        let refused = results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::AlreadyInstalled { .. })))
            .count();
        assert_eq!((installed, refused), (1, 1));
        assert_eq!(world.applier.apply_count(), 1);
    }

    #[test]
    fn test_versions_and_manifest_passthrough() {
        let world = World::new();
        world.loader.publish(manifest("1.0.0"));
        world.loader.publish(manifest("1.1.0"));
        let engine = world.engine();
        assert_eq!(
            engine.versions(IDENTIFIER).unwrap(),
            vec![Version::new(1, 0, 0), Version::new(1, 1, 0)]
        );
        assert_eq!(engine.manifest(IDENTIFIER).unwrap().version, "1.1.0");
        assert!(matches!(engine.manifest("com.example.other"), Err(EngineError::ManifestNotFound { .. })));
    }
}
