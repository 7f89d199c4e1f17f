//! # Casket Core Library
//!
//! This crate contains the core logic of `casket`, a declarative installer for
//! prebuilt application packages. A package is described by a manifest (version,
//! per-architecture download URLs with SHA-256 checksums, an uninstall recipe and
//! a list of user-data paths), and `casket` takes it through its lifecycle:
//! install, upgrade, uninstall and zap.
//!
//! The library is built for the `casket` CLI, but [`Engine`] works with any
//! implementation of the collaborator traits in [`collab`], so it can be embedded
//! elsewhere or driven by in-memory fakes.
//!
//! ## Modules Overview
//! - [`manifest`] – Parsing and validation of package manifests
//! - [`arch`] – Choosing the artifact variant for the host architecture
//! - [`verify`] – SHA-256 checksums and artifact verification
//! - [`cleanup`] – Expanding and vetting uninstall and zap path templates
//! - [`installer`] – The lifecycle engine
//! - [`collab`] – Traits for the loader, fetcher, applier, registry and filesystem
//! - [`loader`], [`fetch`], [`applier`], [`registry`], [`fs`] – Default collaborators
//! - [`lock`] – Per-package advisory locks
//! - [`config`] – `casket.toml` and resolved settings
//! - [`global`] – Platform directories and the download cache
//! - [`util`] – Shared helpers (versions, architectures, hashes)
//! - [`error`] – The error taxonomy

pub mod applier;
pub mod arch;
pub mod cleanup;
pub mod collab;
pub mod config;
pub mod error;
pub mod fetch;
pub mod fs;
pub mod global;
pub mod installer;
pub mod loader;
pub mod lock;
pub mod manifest;
pub mod registry;
pub mod util;
pub mod verify;

pub use applier::{ArchiveApplier, NativeApplier, PkgApplier};
pub use arch::ResolvedArtifact;
pub use cleanup::CleanupContext;
pub use collab::*;
pub use config::{CasketConfig, Settings};
pub use error::{EngineError, FsError, Result};
pub use fetch::HttpFetcher;
pub use fs::LocalFilesystem;
pub use global::cache::ArtifactCache;
pub use installer::*;
pub use loader::DirManifestLoader;
pub use lock::PackageLock;
pub use manifest::{Manifest, UninstallSpec, Variant};
pub use registry::{FileRegistry, MemoryRegistry};
pub use verify::Checksum;
