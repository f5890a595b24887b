// src/watch/path_utils.rs

use std::path::Path;

/// `path` relative to `dir`, with forward slashes.
///
/// Falls back to comparing canonical forms when the plain prefix differs,
/// which happens when the watcher reports through a symlinked prefix
/// (`/private/var` vs `/var` on macOS).
pub fn relative_str(dir: &Path, path: &Path) -> Option<String> {
    let to_slash = |rel: &Path| rel.to_string_lossy().replace('\\', "/");

    if let Ok(rel) = path.strip_prefix(dir) {
        return Some(to_slash(rel));
    }

    let dir = dir.canonicalize().ok()?;
    let path = path.canonicalize().ok()?;
    path.strip_prefix(&dir).ok().map(to_slash)
}
