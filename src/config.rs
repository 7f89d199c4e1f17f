use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use anyhow::{Context, Result};
use crate::global::utils::{default_app_dir, get_global_cache_dir, get_global_data_dir, get_home_dir};
use crate::util::host_arch;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "CASKET_CONFIG";
/// Default configuration file name inside the global config directory.
pub const CONFIG_FILE: &str = "casket.toml";

/// Represents the contents of a `casket.toml` file.
///
/// Every field is optional; anything left out falls back to the platform
/// directories of the current user.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CasketConfig {
    /// Base directory for manifests, registry, locks, receipts and cache.
    /// Overrides the platform directories when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    /// Where manifests are looked up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_dir: Option<PathBuf>,
    /// Where installed records are kept.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_dir: Option<PathBuf>,
    /// Where per-package lock files live.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_dir: Option<PathBuf>,
    /// Where verified downloads are cached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    /// Where archive receipts are kept.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipts_dir: Option<PathBuf>,
    /// Where applications are installed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_dir: Option<PathBuf>,
    /// Home directory used for `~` in cleanup paths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_dir: Option<PathBuf>,
    /// Host architecture override (`arm64`, `x64`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// Volume `.pkg` installers target.
    pub install_target: String,
    /// Download timeout in seconds.
    pub fetch_timeout_secs: u64,
}

impl Default for CasketConfig {
    fn default() -> Self {
        Self {
            root: None,
            manifest_dir: None,
            registry_dir: None,
            lock_dir: None,
            cache_dir: None,
            receipts_dir: None,
            app_dir: None,
            home_dir: None,
            arch: None,
            install_target: "/".to_string(),
            fetch_timeout_secs: 300,
        }
    }
}

/// Fully resolved settings, every location concrete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub manifest_dir: PathBuf,
    pub registry_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub receipts_dir: PathBuf,
    pub app_dir: PathBuf,
    pub home_dir: PathBuf,
    pub arch: String,
    pub install_target: String,
    pub fetch_timeout: Duration,
}

impl CasketConfig {
    /// Saves the config to the given file path in pretty TOML format.
    ///
    /// # Errors
    /// Returns an error if the file can't be written or serialization fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_str = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    /// Loads a config from a file path.
    ///
    /// # Errors
    /// Returns an error if the file can't be read or deserialized.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<CasketConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Loads the config from `path`, or defaults when the file does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<CasketConfig> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(CasketConfig::default())
        }
    }

    /// Resolves every location, filling gaps from the platform directories.
    ///
    /// A leading `~` in any configured path is expanded to the home directory.
    pub fn resolve(&self) -> Result<Settings> {
        let home_dir = match &self.home_dir {
            Some(home) => home.clone(),
            None => get_home_dir()?,
        };
        let expand = |p: &PathBuf| expand_home(p, &home_dir);

        let root = self.root.as_ref().map(expand);
        let data_dir = match &root {
            Some(root) => root.clone(),
            None => get_global_data_dir()?,
        };
        let pick = |field: &Option<PathBuf>, default: PathBuf| -> PathBuf {
            field.as_ref().map(expand).unwrap_or(default)
        };
        let cache_default = match &root {
            Some(root) => root.join("cache"),
            None => get_global_cache_dir()?,
        };
        let app_default = match &root {
            Some(root) => root.join("Applications"),
            None => default_app_dir()?,
        };

        Ok(Settings {
            manifest_dir: pick(&self.manifest_dir, data_dir.join("manifests")),
            registry_dir: pick(&self.registry_dir, data_dir.join("registry")),
            lock_dir: pick(&self.lock_dir, data_dir.join("locks")),
            cache_dir: pick(&self.cache_dir, cache_default),
            receipts_dir: pick(&self.receipts_dir, data_dir.join("receipts")),
            app_dir: pick(&self.app_dir, app_default),
            arch: self.arch.clone().unwrap_or_else(host_arch),
            install_target: self.install_target.clone(),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            home_dir: home_dir.clone(),
        })
    }
}

fn expand_home(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("casket.toml");
        CasketConfig::default().save(&path).unwrap();
        assert_eq!(CasketConfig::load(&path).unwrap(), CasketConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: CasketConfig = toml::from_str("arch = \"arm64\"\n").unwrap();
        assert_eq!(config.arch.as_deref(), Some("arm64"));
        assert_eq!(config.fetch_timeout_secs, 300);
        assert_eq!(config.install_target, "/");
    }

    #[test]
    fn test_root_places_everything_below_it() {
        let config = CasketConfig {
            root: Some(PathBuf::from("/srv/casket")),
            home_dir: Some(PathBuf::from("/home/u")),
            arch: Some("x64".to_string()),
            ..CasketConfig::default()
        };
        let settings = config.resolve().unwrap();
        assert_eq!(settings.registry_dir, PathBuf::from("/srv/casket/registry"));
        assert_eq!(settings.cache_dir, PathBuf::from("/srv/casket/cache"));
        assert_eq!(settings.app_dir, PathBuf::from("/srv/casket/Applications"));
        assert_eq!(settings.arch, "x64");
    }

    #[test]
    fn test_tilde_expands_to_configured_home() {
        let config = CasketConfig {
            home_dir: Some(PathBuf::from("/home/u")),
            app_dir: Some(PathBuf::from("~/Applications")),
            root: Some(PathBuf::from("~/.casket")),
            ..CasketConfig::default()
        };
        let settings = config.resolve().unwrap();
        assert_eq!(settings.app_dir, PathBuf::from("/home/u/Applications"));
        assert_eq!(settings.lock_dir, PathBuf::from("/home/u/.casket/locks"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = CasketConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, CasketConfig::default());
    }
}
