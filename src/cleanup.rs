//! Expansion of cleanup path templates into concrete deletion targets.
//!
//! The template grammar is closed: a leading `~` stands for the home
//! directory and `{version}` for the manifest version. Every expanded path
//! must lie strictly beneath the home directory or the application directory,
//! both as written and after resolving the symlinks of its existing parent
//! directories; anything else fails closed with [`EngineError::UnsafeCleanupPath`].

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use regex::Regex;
use crate::error::{EngineError, Result};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]*)\}").expect("placeholder pattern is valid"));

/// Placeholder names accepted in cleanup path templates.
pub const PATH_PLACEHOLDERS: &[&str] = &["version"];

/// Substitution context for cleanup templates.
#[derive(Debug, Clone, Copy)]
pub struct CleanupContext<'a> {
    /// Home directory of the user the package was installed for.
    pub home_dir: &'a Path,
    /// Directory applications are installed into (e.g. `/Applications`).
    pub app_dir: &'a Path,
    /// Version substituted for `{version}`.
    pub version: &'a str,
}

/// Returns the placeholder names used in `template`, in order of appearance.
pub fn placeholders(template: &str) -> Vec<&str> {
    PLACEHOLDER
        .captures_iter(template)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// Substitutes `{name}` placeholders from `vars`.
///
/// Unknown placeholders and stray braces are rejected; the error names the
/// offending token.
pub fn render(template: &str, vars: &[(&str, &str)]) -> std::result::Result<String, String> {
    for name in placeholders(template) {
        if !vars.iter().any(|(key, _)| *key == name) {
            return Err(format!("unknown placeholder '{{{name}}}'"));
        }
    }
    let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        vars.iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| (*value).to_string())
            .unwrap_or_default()
    });
    if rendered.contains(['{', '}']) {
        return Err("unbalanced brace".to_string());
    }
    Ok(rendered.into_owned())
}

/// Expands every template, preserving input order.
///
/// # Errors
///
/// Fails on the first template that cannot be expanded safely; no partial
/// plan is returned.
pub fn plan<S: AsRef<str>>(templates: &[S], ctx: &CleanupContext<'_>) -> Result<Vec<PathBuf>> {
    let mut targets = Vec::with_capacity(templates.len());
    for template in templates {
        let path = expand(template.as_ref(), ctx)?;
        if !targets.contains(&path) {
            targets.push(path);
        }
    }
    Ok(targets)
}

/// Expands a single template into an absolute path beneath one of the roots.
///
/// # Examples
///
/// ```
/// use std::path::{Path, PathBuf};
/// use casket::cleanup::{expand, CleanupContext};
///
/// let ctx = CleanupContext {
///     home_dir: Path::new("/home/u"),
///     app_dir: Path::new("/Applications"),
///     version: "1.1.6",
/// };
/// assert_eq!(
///     expand("~/.prompt-pad.json", &ctx).unwrap(),
///     PathBuf::from("/home/u/.prompt-pad.json")
/// );
/// ```
pub fn expand(template: &str, ctx: &CleanupContext<'_>) -> Result<PathBuf> {
    let unsafe_path = |reason: &str| EngineError::UnsafeCleanupPath {
        template: template.to_string(),
        reason: reason.to_string(),
    };

    let home = normalize(ctx.home_dir)
        .filter(|p| p.is_absolute())
        .ok_or_else(|| unsafe_path("home directory is not an absolute path"))?;
    let app = normalize(ctx.app_dir)
        .filter(|p| p.is_absolute())
        .ok_or_else(|| unsafe_path("application directory is not an absolute path"))?;

    if template.trim() != template {
        return Err(unsafe_path("leading or trailing whitespace"));
    }
    let rendered = render(template, &[("version", ctx.version)])
        .map_err(|reason| unsafe_path(&reason))?;

    let raw = if let Some(rest) = rendered.strip_prefix('~') {
        if rest.is_empty() {
            home.clone()
        } else if let Some(rest) = rest.strip_prefix('/') {
            home.join(rest)
        } else {
            return Err(unsafe_path("only '~' and '~/' refer to the home directory"));
        }
    } else {
        PathBuf::from(&rendered)
    };

    if !raw.is_absolute() {
        return Err(unsafe_path("path is relative"));
    }
    let resolved = normalize(&raw).ok_or_else(|| unsafe_path("path contains '..'"))?;

    let beneath = |root: &Path| resolved.starts_with(root) && resolved != root;
    // Prefer the deeper root when one contains the other.
    let root = match (beneath(&home), beneath(&app)) {
        (true, true) if app.starts_with(&home) => &app,
        (true, _) => &home,
        (false, true) => &app,
        (false, false) => {
            return Err(unsafe_path(&format!(
                "resolves to {} which is outside {} and {}",
                resolved.display(),
                home.display(),
                app.display()
            )))
        }
    };
    check_real_location(&resolved, root, &[&home, &app]).map_err(|reason| unsafe_path(&reason))?;
    Ok(resolved)
}

/// Follows symlinks in the existing directories between `root` and the
/// parent of `target`, requiring each to stay inside one of `roots`.
///
/// The final component is not followed: deleting a symlink removes the link.
fn check_real_location(target: &Path, root: &Path, roots: &[&Path]) -> std::result::Result<(), String> {
    let allowed: Vec<PathBuf> = roots
        .iter()
        .filter_map(|r| std::fs::canonicalize(r).ok())
        .collect();
    let Some(parent) = target.parent() else {
        return Ok(());
    };
    let Ok(rest) = parent.strip_prefix(root) else {
        return Ok(());
    };

    let mut current = root.to_path_buf();
    let steps = std::iter::once(None).chain(rest.components().map(Some));
    for step in steps {
        if let Some(component) = step {
            current.push(component.as_os_str());
        }
        if std::fs::symlink_metadata(&current).is_err() {
            // nothing below a missing directory can exist
            return Ok(());
        }
        let real = std::fs::canonicalize(&current)
            .map_err(|e| format!("cannot resolve {}: {e}", current.display()))?;
        if !allowed.iter().any(|a| real.starts_with(a)) {
            return Err(format!(
                "{} resolves to {}, outside the home and application directories",
                current.display(),
                real.display()
            ));
        }
    }
    Ok(())
}

/// Lexically normalizes a path, dropping `.` components.
///
/// Returns `None` if the path has any `..` component.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => return None,
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}
