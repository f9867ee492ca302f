// src/filesystem/path.rs

//! Path sanitization for repository-supplied paths
//!
//! Release FileList keys and package `Filename` fields come from the
//! upstream repository and are joined onto the local cache root. Anything
//! that could escape the root is rejected before it reaches the filesystem.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Sanitize a path from an untrusted source
///
/// This function:
/// 1. Rejects paths containing `..` (parent directory) components
/// 2. Skips `.` (current directory) components
/// 3. Strips leading slashes to make the path relative
/// 4. Returns an error for empty paths
///
/// # Examples
///
/// ```
/// use debmirror::filesystem::path::sanitize_path;
/// use std::path::PathBuf;
///
/// assert_eq!(
///     sanitize_path("pool/main/h/hello/hello_2.10-2_amd64.deb").unwrap(),
///     PathBuf::from("pool/main/h/hello/hello_2.10-2_amd64.deb")
/// );
/// assert_eq!(sanitize_path("/pool/x.deb").unwrap(), PathBuf::from("pool/x.deb"));
/// assert!(sanitize_path("../etc/passwd").is_err());
/// assert!(sanitize_path("pool/../../etc/passwd").is_err());
/// ```
pub fn sanitize_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let path_str = path.to_string_lossy();

    let relative = path_str.trim_start_matches('/');

    let mut normalized = PathBuf::new();

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(Error::PathTraversal(path_str.to_string()));
            }
            // Windows prefixes and root markers; leading slashes are already gone
            Component::Prefix(_) | Component::RootDir => {}
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::InvalidPath(
            "Empty path after sanitization".to_string(),
        ));
    }

    Ok(normalized)
}

/// Safely join the cache root with an untrusted relative path
///
/// ```
/// use debmirror::filesystem::path::safe_join;
/// use std::path::{Path, PathBuf};
///
/// let root = Path::new("/srv/mirror");
/// assert_eq!(
///     safe_join(root, "dists/focal/Release").unwrap(),
///     PathBuf::from("/srv/mirror/dists/focal/Release")
/// );
/// assert!(safe_join(root, "../etc/passwd").is_err());
/// ```
pub fn safe_join(root: impl AsRef<Path>, path: impl AsRef<Path>) -> Result<PathBuf> {
    let root = root.as_ref();
    let sanitized = sanitize_path(path.as_ref())?;
    let joined = root.join(&sanitized);

    // Symlinks inside the tree could still point outside of it
    if let (Ok(canonical_root), Ok(canonical_joined)) =
        (root.canonicalize(), joined.canonicalize())
        && !canonical_joined.starts_with(&canonical_root)
    {
        return Err(Error::PathTraversal(format!(
            "Path {} escapes root {}",
            joined.display(),
            root.display()
        )));
    }

    Ok(joined)
}

/// Staging path a download is streamed into before being renamed into place
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}
