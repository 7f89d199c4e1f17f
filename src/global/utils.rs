use std::path::PathBuf;
use anyhow::{anyhow, Result};
use directories::{BaseDirs, ProjectDirs};

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("org", "casket", "casket")
        .ok_or_else(|| anyhow!("Could not determine the casket project directories"))
}

/// Directory searched for `casket.toml` when neither `--config` nor `CASKET_CONFIG` is given.
pub fn get_global_config_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

/// Default location of the download cache.
pub fn get_global_cache_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.cache_dir().to_path_buf())
}

/// Default base for manifests, registry, locks and receipts.
pub fn get_global_data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// The current user's home directory; `~` in cleanup paths expands to it.
pub fn get_home_dir() -> Result<PathBuf> {
    BaseDirs::new()
        .map(|base| base.home_dir().to_path_buf())
        .ok_or_else(|| anyhow!("Could not determine home directory"))
}

/// Where applications are installed when the config does not say.
pub fn default_app_dir() -> Result<PathBuf> {
    if cfg!(target_os = "macos") {
        Ok(PathBuf::from("/Applications"))
    } else {
        Ok(get_home_dir()?.join("Applications"))
    }
}
