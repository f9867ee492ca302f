// src/filesystem/mod.rs

//! Local mirror tree helpers
//!
//! - Path sanitization for repository-supplied relative paths
//! - Crash-safe replacement of files (temp file + rename)

pub mod path;

use crate::error::{Error, Result};
use std::path::Path;

/// Create the parent directory of `path` if it is missing
pub async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::IoError(format!(
                "Failed to create directory {}: {e}",
                parent.display()
            ))
        })?;
    }
    Ok(())
}

/// Replace `dest` with `data` so readers see either the old or the new content
///
/// The bytes are written to a sibling temp file which is then renamed over
/// the destination; a crash in between leaves the previous file intact.
pub async fn write_atomic(dest: &Path, data: &[u8]) -> Result<()> {
    ensure_parent(dest).await?;

    let temp_path = path::partial_path(dest);
    tokio::fs::write(&temp_path, data).await.map_err(|e| {
        Error::IoError(format!("Failed to write {}: {e}", temp_path.display()))
    })?;

    tokio::fs::rename(&temp_path, dest).await.map_err(|e| {
        Error::IoError(format!(
            "Failed to move {} to {}: {e}",
            temp_path.display(),
            dest.display()
        ))
    })
}
