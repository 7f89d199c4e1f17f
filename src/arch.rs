//! Architecture resolution: choosing the one variant a host can install.

use crate::cleanup::render;
use crate::error::{EngineError, Result};
use crate::manifest::{Manifest, Variant};
use crate::util::{normalize_arch, url_file_name};
use crate::verify::Checksum;

/// A variant resolved for a specific host, with every template expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    /// The variant tag that was selected.
    pub arch: String,
    /// Download URL with `{version}` substituted.
    pub url: String,
    /// Expected SHA-256 checksum.
    pub checksum: Checksum,
    /// File name the artifact is staged under before it is applied.
    pub artifact_name: String,
}

/// Resolves the variant of `manifest` applicable to `host_arch`.
///
/// An exact tag match wins. Otherwise the first variant explicitly marked
/// `universal` is used. A manifest with a single, unmarked variant is *not*
/// treated as universal.
///
/// This is a pure function; it performs no I/O.
///
/// # Errors
///
/// Returns [`EngineError::UnsupportedArchitecture`] if no variant applies and
/// [`EngineError::InvalidManifest`] if a template cannot be expanded.
pub fn resolve(manifest: &Manifest, host_arch: &str) -> Result<ResolvedArtifact> {
    let host = normalize_arch(host_arch);
    let (tag, variant) = select(manifest, &host).ok_or_else(|| {
        EngineError::UnsupportedArchitecture {
            identifier: manifest.identifier.clone(),
            host: host.clone(),
            available: manifest.variant_tags(),
        }
    })?;

    let url = render(&variant.url, &[("version", &manifest.version)])
        .map_err(|reason| EngineError::invalid(&manifest.identifier, format!("url: {reason}")))?;

    let artifact_arch = variant.artifact_arch.as_deref().unwrap_or(tag);
    let artifact_name = match &manifest.package_artifact_name {
        Some(template) => render(
            template,
            &[("version", &manifest.version), ("arch", artifact_arch)],
        )
        .map_err(|reason| {
            EngineError::invalid(&manifest.identifier, format!("package_artifact_name: {reason}"))
        })?,
        None => url_file_name(&url)
            .map(str::to_string)
            .ok_or_else(|| EngineError::invalid(&manifest.identifier, format!("cannot derive a file name from {url}")))?,
    };
    if artifact_name.is_empty()
        || artifact_name.contains(['/', '\\'])
        || artifact_name == "."
        || artifact_name == ".."
    {
        return Err(EngineError::invalid(
            &manifest.identifier,
            format!("artifact name '{artifact_name}' is not a plain file name"),
        ));
    }

    tracing::debug!(
        identifier = %manifest.identifier,
        host = %host,
        variant = %tag,
        "resolved variant"
    );
    Ok(ResolvedArtifact {
        arch: tag.to_string(),
        url,
        checksum: variant.checksum.clone(),
        artifact_name,
    })
}

fn select<'a>(manifest: &'a Manifest, host: &str) -> Option<(&'a str, &'a Variant)> {
    manifest
        .variants
        .get_key_value(host)
        .or_else(|| manifest.variants.iter().find(|(_, v)| v.universal))
        .map(|(tag, variant)| (tag.as_str(), variant))
}
