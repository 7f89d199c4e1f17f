use std::path::{Path, PathBuf};
use semver::Version;
use crate::collab::ManifestLoader;
use crate::error::{EngineError, Result};
use crate::manifest::Manifest;
use crate::util::{is_valid_identifier, sort_versions};

const EXTENSIONS: &[&str] = &["toml", "json"];

/// Loads manifests from a directory.
///
/// Two layouts are understood:
///
/// * `<dir>/<identifier>.toml` (or `.json`) holding a single manifest;
/// * `<dir>/<identifier>/` holding one manifest file per version.
///
/// When both exist their versions are merged and the highest one is the
/// "latest" manifest.
#[derive(Debug, Clone)]
pub struct DirManifestLoader {
    dir: PathBuf,
}

impl DirManifestLoader {
    /// Creates a loader over `dir`. The directory does not need to exist yet.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Loads every manifest for `identifier`, sorted by ascending version.
    ///
    /// # Errors
    /// Fails on the first manifest that cannot be parsed, or if one declares
    /// a different identifier than the file it was found under.
    pub fn load_all(&self, identifier: &str) -> Result<Vec<Manifest>> {
        if !is_valid_identifier(identifier) {
            return Err(EngineError::ManifestNotFound {
                identifier: identifier.to_string(),
            });
        }
        let mut manifests = Vec::new();
        for path in self.candidate_files(identifier)? {
            let manifest = Manifest::load(&path)?;
            if manifest.identifier != identifier {
                return Err(EngineError::InvalidManifest {
                    identifier: path.display().to_string(),
                    reason: format!(
                        "declares identifier '{}' but is stored under '{identifier}'",
                        manifest.identifier
                    ),
                });
            }
            manifests.push(manifest);
        }
        manifests.sort_by(|a, b| a.ordered_version().cmp(b.ordered_version()));
        manifests.dedup_by(|a, b| a.ordered_version() == b.ordered_version());
        Ok(manifests)
    }

    /// Loads the manifest for an exact version of `identifier`.
    pub fn load_version(&self, identifier: &str, version: &Version) -> Result<Manifest> {
        self.load_all(identifier)?
            .into_iter()
            .find(|m| m.ordered_version() == version)
            .ok_or_else(|| EngineError::ManifestNotFound {
                identifier: format!("{identifier}@{version}"),
            })
    }

    fn candidate_files(&self, identifier: &str) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for ext in EXTENSIONS {
            let single = self.dir.join(format!("{identifier}.{ext}"));
            if single.is_file() {
                files.push(single);
            }
        }
        let versioned = self.dir.join(identifier);
        if versioned.is_dir() {
            let entries = std::fs::read_dir(&versioned).map_err(|e| EngineError::io(&versioned, e))?;
            for entry in entries {
                let path = entry.map_err(|e| EngineError::io(&versioned, e))?.path();
                let known = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| EXTENSIONS.contains(&e));
                if known && path.is_file() {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

impl ManifestLoader for DirManifestLoader {
    fn load(&self, identifier: &str) -> Result<Manifest> {
        self.load_all(identifier)?
            .pop()
            .ok_or_else(|| EngineError::ManifestNotFound {
                identifier: identifier.to_string(),
            })
    }

    fn versions(&self, identifier: &str) -> Result<Vec<Version>> {
        let manifests = self.load_all(identifier)?;
        Ok(sort_versions(manifests.iter().map(|m| m.version.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manifest_toml(version: &str) -> String {
        format!(
            r#"
identifier = "net.pisum.promptpad.app"
version = "{version}"

[variants.arm64]
url = "https://example.com/PromptPad_{{version}}_aarch64.pkg"
checksum = "{}"
"#,
            "0".repeat(64)
        )
    }

    #[test]
    fn picks_latest_from_versioned_dir() {
        let dir = tempdir().unwrap();
        let pkg_dir = dir.path().join("net.pisum.promptpad.app");
        std::fs::create_dir_all(&pkg_dir).unwrap();
        for v in ["1.0.2", "1.1.6", "1.1.1"] {
            std::fs::write(pkg_dir.join(format!("{v}.toml")), manifest_toml(v)).unwrap();
        }
        let loader = DirManifestLoader::new(dir.path());
        assert_eq!(loader.load("net.pisum.promptpad.app").unwrap().version, "1.1.6");
        let versions: Vec<String> = loader
            .versions("net.pisum.promptpad.app")
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(versions, vec!["1.0.2", "1.1.1", "1.1.6"]);
        let exact = loader
            .load_version("net.pisum.promptpad.app", &Version::new(1, 1, 1))
            .unwrap();
        assert_eq!(exact.version, "1.1.1");
    }

    #[test]
    fn reads_single_file_layout() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("net.pisum.promptpad.app.toml"),
            manifest_toml("1.1.6"),
        )
        .unwrap();
        let loader = DirManifestLoader::new(dir.path());
        assert!(loader.load("net.pisum.promptpad.app").is_ok());
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let dir = tempdir().unwrap();
        let loader = DirManifestLoader::new(dir.path());
        assert!(matches!(
            loader.load("com.example.absent"),
            Err(EngineError::ManifestNotFound { .. })
        ));
        assert!(matches!(
            loader.load("../etc"),
            Err(EngineError::ManifestNotFound { .. })
        ));
    }

    #[test]
    fn rejects_mismatched_identifier() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("other.app.toml"), manifest_toml("1.0.0")).unwrap();
        let loader = DirManifestLoader::new(dir.path());
        assert!(matches!(
            loader.load("other.app"),
            Err(EngineError::InvalidManifest { .. })
        ));
    }
}
