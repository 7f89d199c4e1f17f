//! The in-memory manifest model.
//!
//! A [`Manifest`] describes one version of one package: where to download
//! it for each architecture, how to verify it, what the native uninstaller
//! removes and which user data a zap purges. Manifests are validated when
//! they are deserialized and are never mutated afterwards.

use std::collections::BTreeMap;
use std::path::Path;
use semver::Version;
use serde::{Deserialize, Serialize};
use crate::cleanup::{placeholders, PATH_PLACEHOLDERS};
use crate::error::{EngineError, Result};
use crate::util::{is_valid_identifier, normalize_arch, parse_version};
use crate::verify::Checksum;

/// Placeholder names accepted in download URLs.
const URL_PLACEHOLDERS: &[&str] = &["version"];
/// Placeholder names accepted in the artifact file name.
const ARTIFACT_PLACEHOLDERS: &[&str] = &["version", "arch"];

/// An architecture-specific artifact reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    /// Download URL; may contain `{version}`.
    pub url: String,
    /// SHA-256 checksum of the artifact.
    pub checksum: Checksum,
    /// Whether this variant runs on any host architecture.
    #[serde(default)]
    pub universal: bool,
    /// Token substituted for `{arch}` in the artifact name. Defaults to the tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_arch: Option<String>,
}

/// What the native uninstaller removes beyond the package bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UninstallSpec {
    /// Receipt id handed to the package applier's `remove`.
    #[serde(default)]
    pub registry_id: String,
    /// Path templates deleted on uninstall.
    #[serde(default)]
    pub delete_paths: Vec<String>,
}

/// The wire shape of a manifest, before validation.
#[derive(Debug, Clone, Deserialize)]
struct RawManifest {
    identifier: String,
    version: String,
    variants: BTreeMap<String, Variant>,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    homepage: String,
    #[serde(default)]
    caveats: Option<String>,
    #[serde(default)]
    package_artifact_name: Option<String>,
    #[serde(default)]
    uninstall: UninstallSpec,
    #[serde(default)]
    zap_paths: Vec<String>,
}

/// One validated version of one package.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawManifest")]
pub struct Manifest {
    /// Stable package name, the registry and lock key.
    pub identifier: String,
    /// Version exactly as written in the manifest; used for substitution.
    pub version: String,
    /// Variants keyed by normalized architecture tag.
    pub variants: BTreeMap<String, Variant>,
    /// Human readable name.
    pub display_name: String,
    /// One-line description.
    pub description: String,
    /// Project homepage.
    pub homepage: String,
    /// Notes shown to the user after installation.
    pub caveats: Option<String>,
    /// Artifact file name template (`{version}`, `{arch}`).
    pub package_artifact_name: Option<String>,
    /// Native uninstall instructions.
    pub uninstall: UninstallSpec,
    /// User data templates purged by zap.
    pub zap_paths: Vec<String>,
    ordered_version: Version,
}

impl Manifest {
    /// Parses and validates a manifest from TOML.
    pub fn from_toml_str(content: &str) -> Result<Manifest> {
        toml::from_str(content).map_err(|e| EngineError::invalid("<toml>", e.to_string()))
    }

    /// Parses and validates a manifest from JSON.
    pub fn from_json_str(content: &str) -> Result<Manifest> {
        serde_json::from_str(content).map_err(|e| EngineError::invalid("<json>", e.to_string()))
    }

    /// Loads a manifest file, choosing the format from the extension.
    ///
    /// # Errors
    /// Returns an error if the file can't be read or fails validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Manifest> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        };
        parsed.map_err(|e| match e {
            EngineError::InvalidManifest { reason, .. } => EngineError::InvalidManifest {
                identifier: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// The version as an orderable SemVer value.
    pub fn ordered_version(&self) -> &Version {
        &self.ordered_version
    }

    /// Returns the registry id used for native removal, falling back to the identifier.
    pub fn registry_id(&self) -> &str {
        if self.uninstall.registry_id.is_empty() {
            &self.identifier
        } else {
            &self.uninstall.registry_id
        }
    }

    /// Comma-separated list of the declared variant tags.
    pub fn variant_tags(&self) -> String {
        self.variants.keys().cloned().collect::<Vec<_>>().join(", ")
    }
}

impl TryFrom<RawManifest> for Manifest {
    type Error = EngineError;

    fn try_from(raw: RawManifest) -> Result<Self> {
        let id = raw.identifier.trim().to_string();
        if !is_valid_identifier(&id) {
            return Err(EngineError::invalid(&id, "identifier must be a non-empty name without path separators or whitespace"));
        }
        let ordered_version = parse_version(&raw.version)
            .ok_or_else(|| EngineError::invalid(&id, format!("unorderable version '{}'", raw.version)))?;
        if raw.variants.is_empty() {
            return Err(EngineError::invalid(&id, "at least one variant is required"));
        }

        let mut variants = BTreeMap::new();
        for (tag, variant) in raw.variants {
            let tag = normalize_arch(&tag);
            if tag.is_empty() {
                return Err(EngineError::invalid(&id, "empty architecture tag"));
            }
            if variant.url.trim().is_empty() {
                return Err(EngineError::invalid(&id, format!("variant '{tag}' has an empty url")));
            }
            check_placeholders(&id, "url", &variant.url, URL_PLACEHOLDERS)?;
            if variants.insert(tag.clone(), variant).is_some() {
                return Err(EngineError::invalid(&id, format!("duplicate variant for architecture '{tag}'")));
            }
        }

        if let Some(name) = &raw.package_artifact_name {
            check_placeholders(&id, "package_artifact_name", name, ARTIFACT_PLACEHOLDERS)?;
        }
        for template in raw.uninstall.delete_paths.iter().chain(raw.zap_paths.iter()) {
            check_placeholders(&id, "path", template, PATH_PLACEHOLDERS)?;
        }

        Ok(Manifest {
            identifier: id,
            version: raw.version.trim().to_string(),
            variants,
            display_name: raw.display_name,
            description: raw.description,
            homepage: raw.homepage,
            caveats: raw.caveats,
            package_artifact_name: raw.package_artifact_name,
            uninstall: raw.uninstall,
            zap_paths: raw.zap_paths,
            ordered_version,
        })
    }
}

fn check_placeholders(identifier: &str, field: &str, template: &str, allowed: &[&str]) -> Result<()> {
    for name in placeholders(template) {
        if !allowed.contains(&name) {
            return Err(EngineError::invalid(
                identifier,
                format!("{field} '{template}' uses unsupported placeholder '{{{name}}}'"),
            ));
        }
    }
    Ok(())
}
