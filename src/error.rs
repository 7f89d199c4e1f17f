//! Error types shared by every stage of the package lifecycle.
//!
//! Each variant carries enough context (identifier, url, path, checksums) to
//! diagnose a failure from the message alone.

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by the engine and its collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No manifest is known for the identifier.
    #[error("no manifest found for '{identifier}'")]
    ManifestNotFound {
        /// The identifier that was looked up.
        identifier: String,
    },

    /// A manifest was found but failed validation.
    #[error("invalid manifest for '{identifier}': {reason}")]
    InvalidManifest {
        /// The identifier (or file name) of the rejected manifest.
        identifier: String,
        /// Which constraint was violated.
        reason: String,
    },

    /// No variant matches the host architecture and none is universal.
    #[error("'{identifier}' has no variant for architecture '{host}' (available: {available})")]
    UnsupportedArchitecture {
        /// Package identifier.
        identifier: String,
        /// Normalized host architecture tag.
        host: String,
        /// Comma-separated list of declared variant tags.
        available: String,
    },

    /// The artifact could not be downloaded.
    #[error("failed to fetch {url}: {reason}")]
    FetchFailed {
        /// The URL that was requested.
        url: String,
        /// Transport-level description of the failure.
        reason: String,
    },

    /// The artifact digest does not match the manifest checksum.
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// The URL the artifact came from.
        url: String,
        /// Checksum declared by the manifest.
        expected: String,
        /// Digest computed over the downloaded bytes.
        actual: String,
    },

    /// The native package applier failed.
    #[error("failed to apply {}: {reason}", artifact.display())]
    ApplyFailed {
        /// The staged artifact that was handed to the applier.
        artifact: PathBuf,
        /// Description reported by the applier.
        reason: String,
    },

    /// The native uninstaller failed.
    #[error("failed to remove package receipt '{registry_id}': {reason}")]
    RemoveFailed {
        /// The registry id handed to the uninstaller.
        registry_id: String,
        /// Description reported by the applier.
        reason: String,
    },

    /// Install was requested but the package is already installed.
    #[error("'{identifier}' {version} is already installed; use upgrade instead")]
    AlreadyInstalled {
        /// Package identifier.
        identifier: String,
        /// Version currently recorded in the registry.
        version: String,
    },

    /// An operation requiring an installed package found none.
    #[error("'{identifier}' is not installed")]
    NotInstalled {
        /// Package identifier.
        identifier: String,
    },

    /// A cleanup template would resolve outside the permitted roots.
    #[error("refusing cleanup path '{template}': {reason}")]
    UnsafeCleanupPath {
        /// The offending template, as written in the manifest.
        template: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Another operation holds the lock for this identifier.
    #[error("another operation on '{identifier}' is in progress")]
    Locked {
        /// Package identifier.
        identifier: String,
    },

    /// The registry backend failed to read or write a record.
    #[error("registry error for '{identifier}': {reason}")]
    Registry {
        /// Package identifier.
        identifier: String,
        /// Underlying failure.
        reason: String,
    },

    /// Local I/O failure outside the categories above.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Wraps an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(identifier: &str, reason: impl Into<String>) -> Self {
        Self::InvalidManifest {
            identifier: identifier.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure of a single filesystem deletion.
///
/// Only permission problems and unexpected I/O errors are represented;
/// an absent target is a success.
#[derive(Debug, Error)]
pub enum FsError {
    /// The process may not delete the path.
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    /// Any other I/O failure.
    #[error("{}: {source}", path.display())]
    Other {
        /// The path being deleted.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}
