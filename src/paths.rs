//! Confinement of client-supplied paths to the active storage root.
//!
//! Every entry point that accepts a user path goes through [`resolve`]
//! (pure, no I/O) and then [`ensure_no_symlinks`] (walks what exists on
//! disk). Both separators are honoured so `..\` tricks are caught the same
//! way as `../`.

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;

use crate::config::STAGING_DIR_NAME;
use crate::error::StorageError;

/// Splits a client path into its normal segments.
///
/// Rejects absolute paths, drive prefixes, parent traversal, NUL bytes and
/// the reserved staging directory. An empty result denotes the root.
pub fn normalize_relative(raw: &str) -> Result<Vec<&str>, StorageError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    if raw.contains('\0') || raw.starts_with(['/', '\\']) || has_drive_prefix(raw) {
        return Err(StorageError::PathTraversalRejected);
    }

    let mut segments = Vec::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(StorageError::PathTraversalRejected),
            normal => segments.push(normal),
        }
    }

    if segments.first() == Some(&STAGING_DIR_NAME) {
        return Err(StorageError::PathTraversalRejected);
    }
    Ok(segments)
}

/// Maps `raw` onto an absolute path under `root`.
pub fn resolve(raw: Option<&str>, root: &Path) -> Result<PathBuf, StorageError> {
    let segments = match raw {
        Some(value) => normalize_relative(value)?,
        None => Vec::new(),
    };
    let mut target = root.to_path_buf();
    for segment in segments {
        target.push(segment);
    }
    // Component-wise, so `/data/root2` never passes for `/data/root`.
    if !target.starts_with(root) {
        return Err(StorageError::PathTraversalRejected);
    }
    Ok(target)
}

/// Walks `target` below `root` and refuses symlinks at any level.
///
/// With `allow_missing_leaf` the walk stops quietly at the first component
/// that does not exist yet.
pub async fn ensure_no_symlinks(
    root: &Path,
    target: &Path,
    allow_missing_leaf: bool,
) -> Result<(), StorageError> {
    let relative = target
        .strip_prefix(root)
        .map_err(|_| StorageError::PathTraversalRejected)?;
    let mut current = root.to_path_buf();
    let mut components = relative.components().peekable();

    while let Some(component) = components.next() {
        current.push(component.as_os_str());
        match fs::symlink_metadata(&current).await {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(StorageError::PathTraversalRejected);
                }
                if components.peek().is_some() && !metadata.is_dir() {
                    return Err(StorageError::InvalidInput(format!(
                        "{} is not a directory",
                        display_relative(root, &current)
                    )));
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                return Ok(());
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(display_relative(root, target)));
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

/// Reduces a requested file name to a single safe path segment.
///
/// Anything that looks like a path keeps only its last segment, so a
/// rename or upload can never relocate an entry.
pub fn sanitize_name(raw: &str) -> Result<String, StorageError> {
    let name = raw
        .split(['/', '\\'])
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .last()
        .unwrap_or_default();
    if name.is_empty() || name == "." || name == ".." || name.contains('\0') {
        return Err(StorageError::InvalidInput("a valid name is required".into()));
    }
    if name == STAGING_DIR_NAME {
        return Err(StorageError::InvalidInput(format!("{name} is reserved")));
    }
    Ok(name.to_string())
}

/// Relative, `/`-separated form of `path` for responses and logs.
pub fn display_relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(|relative| {
            relative
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/")
        })
        .unwrap_or_default()
}

fn has_drive_prefix(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
