//! Sandbox path confinement. Every user-visible path flows through here.

use std::path::{Component, Path, PathBuf};

use crate::error::OpError;

/// Resolve a user-supplied path against the sandbox root.
///
/// Relative paths join the root; absolute paths are normalized as-is. The
/// result must stay under the root: for existing targets the real path
/// (after symlink expansion) is checked, for not-yet-existing targets the
/// lexically normalized path is. Empty input means the root itself.
pub(crate) fn resolve(root: &Path, input: &str) -> Result<PathBuf, OpError> {
    if input.contains('\0') {
        return Err(OpError::validation("path contains null byte"));
    }

    let joined = if Path::new(input).is_absolute() {
        PathBuf::from(input)
    } else {
        root.join(input)
    };

    let normalized = normalize_lexically(&joined)
        .ok_or_else(|| OpError::path_escape(format!("path '{input}' escapes the sandbox")))?;

    let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());

    // Symlink expansion over the longest existing ancestor catches links
    // inside the sandbox that point outside, even for new files under them.
    let real = expand_existing_prefix(&normalized);
    if real.starts_with(&canonical_root) {
        return Ok(real);
    }
    Err(OpError::path_escape(format!(
        "path '{input}' escapes the sandbox"
    )))
}

/// Resolve a path that must already exist. Missing targets map to NOT_FOUND.
pub(crate) fn resolve_existing(root: &Path, input: &str) -> Result<PathBuf, OpError> {
    let resolved = resolve(root, input)?;
    if !resolved.exists() {
        return Err(OpError::not_found(format!("no such path: '{input}'")));
    }
    Ok(resolved)
}

/// Normalize `..` and `.` without touching the filesystem. Returns `None`
/// when `..` would climb past the filesystem root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => out.push("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
                if out.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::Normal(c) => out.push(c),
            Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Canonicalize the longest existing ancestor of `path` and re-join the
/// remaining (not yet existing) components onto it.
fn expand_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(real) => {
                let mut out = real;
                for part in tail.iter().rev() {
                    out.push(part);
                }
                return out;
            }
            Err(_) => match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    tail.push(name);
                    existing = parent;
                }
                _ => return path.to_path_buf(),
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
