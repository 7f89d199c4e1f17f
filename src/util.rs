use std::path::Path;
use semver::Version;

/// Strips the `sha256:` prefix from a hash if present.
/// This is useful for formatting hashes uniformly.
pub fn format_hash(hash: &str) -> String {
    let hash = hash.trim();
    if let Some(hash) = hash.strip_prefix("sha256:") {
        hash.to_ascii_lowercase()
    } else {
        hash.to_ascii_lowercase()
    }
}

/// Returns the host CPU architecture as a normalized tag (`arm64`, `x64`, ...).
pub fn host_arch() -> String {
    normalize_arch(std::env::consts::ARCH)
}

/// Normalizes the many spellings of an architecture into the tags manifests use.
///
/// `aarch64`/`arm` become `arm64`; `x86_64`/`amd64`/`intel` become `x64`.
/// Anything else is lower-cased and returned as is.
pub fn normalize_arch(arch: &str) -> String {
    let arch = arch.trim().to_ascii_lowercase();
    match arch.as_str() {
        "arm64" | "aarch64" | "arm" => "arm64".to_string(),
        "x64" | "x86_64" | "amd64" | "intel" => "x64".to_string(),
        _ => arch,
    }
}

/// Parses a version token leniently as SemVer.
///
/// A leading `v` is ignored and missing minor/patch components are padded
/// with zero, so `v1.2` parses as `1.2.0`.
pub fn parse_version(version: &str) -> Option<Version> {
    let version = version.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    if let Ok(parsed) = Version::parse(version) {
        return Some(parsed);
    }
    let (core, rest) = match version.find(['-', '+']) {
        Some(idx) => version.split_at(idx),
        None => (version, ""),
    };
    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(rest);
    Version::parse(&padded).ok()
}

/// Sorts version strings in ascending order, dropping those that do not parse.
pub fn sort_versions<I, S>(versions: I) -> Vec<Version>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parsed: Vec<Version> = versions
        .into_iter()
        .filter_map(|v| parse_version(v.as_ref()))
        .collect();
    parsed.sort();
    parsed.dedup();
    parsed
}

/// Checks that an identifier is usable as a registry key and a file name.
pub fn is_valid_identifier(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier != "."
        && !identifier.contains("..")
        && !identifier
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control())
}

/// Returns the final path segment of a URL, ignoring any query or fragment.
pub fn url_file_name(url: &str) -> Option<&str> {
    let url = url.split(['?', '#']).next().unwrap_or(url);
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && !name.contains(':'))
}

/// Returns true when `path` ends with one of the given (lower-case) extensions.
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    extensions.iter().any(|ext| name.ends_with(ext))
}
