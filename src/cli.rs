use std::path::PathBuf;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct CLI {
    /// Path to `casket.toml`. Defaults to `$CASKET_CONFIG`, then the platform config directory
    #[clap(long, global = true)]
    pub(crate) config: Option<PathBuf>,
    /// More output (-v info, -vv debug). `CASKET_LOG` overrides this
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,
    #[command(subcommand)]
    pub(crate) command: CasketCommand,
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum CasketCommand {
    /// Installs the latest version of a package
    Install {
        identifier: String,
        /// Upgrade instead of failing when the package is already installed
        #[clap(long)]
        force: bool,
    },
    /// Upgrades an installed package to the latest version
    Upgrade {
        identifier: String,
    },
    /// Uninstalls a package
    Uninstall {
        identifier: String,
        /// Also delete the package's user data
        #[clap(long)]
        zap: bool,
    },
    /// Deletes a package's user data, uninstalling it first if needed
    Zap {
        identifier: String,
        /// Only print what would be deleted
        #[clap(long)]
        dry_run: bool,
    },
    /// Shows whether a package is installed
    Status {
        identifier: String,
    },
    /// Shows the manifest of a package
    Info {
        identifier: String,
    },
    /// Lists the known versions of a package
    Versions {
        identifier: String,
    },
    /// Lists installed packages
    List,
    /// Checks a file against a SHA-256 checksum
    Verify {
        file: PathBuf,
        checksum: String,
    },
    /// Manages the download cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum CacheCommand {
    /// Removes every cached download
    Clean,
    /// Removes cached downloads of a package except the installed version's
    Prune {
        identifier: String,
    },
}
