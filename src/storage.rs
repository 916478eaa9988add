use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::ErrorKind;

use crate::config::STAGING_DIR_NAME;
use crate::error::StorageError;
use crate::paths::{display_relative, ensure_no_symlinks, resolve, sanitize_name};
use crate::root::StorageRoot;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
/// Length of the `yyyyMMddHHmmssSSS` prefix on uploaded file names.
pub const STORED_PREFIX_LEN: usize = 17;

/// File operations bound to one root snapshot.
///
/// A handler builds one `Storage` per request, so a concurrent root switch
/// never redirects the rest of that request.
#[derive(Clone, Debug)]
pub struct Storage {
    root: Arc<StorageRoot>,
}

impl Storage {
    pub fn new(root: Arc<StorageRoot>) -> Self {
        Self { root }
    }

    pub fn root_path(&self) -> &Path {
        &self.root.path
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.path.join(STAGING_DIR_NAME)
    }

    pub async fn resolve_path_checked(
        &self,
        relative: Option<&str>,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let target = resolve(relative, self.root_path())?;
        ensure_no_symlinks(self.root_path(), &target, allow_missing_leaf).await?;
        Ok(target)
    }

    pub fn relative_of(&self, path: &Path) -> String {
        display_relative(self.root_path(), path)
    }

    /// 列出目录内容；目录不存在时返回空列表。
    pub async fn list_dir(&self, relative: Option<&str>) -> Result<Vec<FileEntry>, StorageError> {
        let target = self.resolve_path_checked(relative, true).await?;
        let mut dir = match fs::read_dir(&target).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) if err.kind() == ErrorKind::NotADirectory => {
                return Err(StorageError::InvalidInput(format!(
                    "{} is not a directory",
                    self.relative_of(&target)
                )));
            }
            Err(err) => return Err(err.into()),
        };
        let hide_staging = target == self.root_path();
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if hide_staging && name == STAGING_DIR_NAME {
                continue;
            }
            // Entries removed between enumeration and stat are skipped.
            let metadata = match fs::symlink_metadata(entry.path()).await {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            entries.push(FileEntry::from_metadata(
                self.root_path(),
                &entry.path(),
                name,
                &metadata,
            ));
        }

        entries.sort_by(|a, b| match (a.is_dir(), b.is_dir()) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.cmp(&b.name),
        });

        Ok(entries)
    }

    /// 创建目录（含缺失的父级），目标已存在时报错。
    pub async fn create_dir(&self, relative: &str) -> Result<String, StorageError> {
        let target = self.resolve_path_checked(Some(relative), true).await?;
        if target == self.root_path() {
            return Err(StorageError::InvalidInput("folder name is required".into()));
        }
        let display = self.relative_of(&target);
        if fs::symlink_metadata(&target).await.is_ok() {
            return Err(StorageError::AlreadyExists(display));
        }
        fs::create_dir_all(&target).await?;
        Ok(display)
    }

    /// 删除文件或目录（目录递归删除）。
    pub async fn delete_path(&self, relative: &str) -> Result<(), StorageError> {
        let target = self.resolve_path_checked(Some(relative), true).await?;
        if target == self.root_path() {
            return Err(StorageError::InvalidInput(
                "the storage root cannot be deleted".into(),
            ));
        }
        let metadata = self.entry_metadata(&target).await?;
        if metadata.is_dir() {
            fs::remove_dir_all(target).await?;
        } else {
            fs::remove_file(target).await?;
        }
        Ok(())
    }

    /// 在同一目录内重命名，返回新的相对路径。
    pub async fn rename_entry(&self, relative: &str, new_name: &str) -> Result<String, StorageError> {
        let source = self.resolve_path_checked(Some(relative), true).await?;
        if source == self.root_path() {
            return Err(StorageError::InvalidInput(
                "the storage root cannot be renamed".into(),
            ));
        }
        self.entry_metadata(&source).await?;

        let name = sanitize_name(new_name)?;
        let parent = source
            .parent()
            .ok_or(StorageError::PathTraversalRejected)?;
        let destination = parent.join(&name);
        if !destination.starts_with(self.root_path()) {
            return Err(StorageError::PathTraversalRejected);
        }
        if fs::symlink_metadata(&destination).await.is_ok() {
            return Err(StorageError::AlreadyExists(self.relative_of(&destination)));
        }

        fs::rename(&source, &destination).await?;
        Ok(self.relative_of(&destination))
    }

    /// 读取条目元数据；仅“不存在”映射为 `NotFound`，其余错误照常分类。
    async fn entry_metadata(&self, target: &Path) -> Result<Metadata, StorageError> {
        match fs::symlink_metadata(target).await {
            Ok(metadata) => Ok(metadata),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(self.relative_of(target)))
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn format_timestamp(time: std::time::SystemTime) -> Option<String> {
    time.duration_since(UNIX_EPOCH).ok()?;
    let datetime: DateTime<Utc> = time.into();
    Some(datetime.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Recovers the client's name from an upload-decorated stored name.
pub fn original_name(stored: &str) -> Option<&str> {
    let (prefix, rest) = stored.split_at_checked(STORED_PREFIX_LEN)?;
    if !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.strip_prefix('_').filter(|name| !name.is_empty())
}

/// 二进制 MB，保留两位小数。
pub fn size_in_mb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub parent: String,
    pub kind: EntryKind,
    pub size_bytes: Option<u64>,
    pub size_mb: Option<f64>,
    pub extension: Option<String>,
    pub modified: Option<String>,
    pub original_name: Option<String>,
}

impl FileEntry {
    fn from_metadata(root: &Path, path: &Path, name: String, metadata: &std::fs::Metadata) -> Self {
        let relative = display_relative(root, path);
        let parent = path
            .parent()
            .map(|parent| display_relative(root, parent))
            .unwrap_or_default();
        let modified = metadata.modified().ok().and_then(format_timestamp);

        if metadata.is_dir() {
            return FileEntry {
                name,
                path: relative,
                parent,
                kind: EntryKind::Directory,
                size_bytes: None,
                size_mb: None,
                extension: None,
                modified,
                original_name: None,
            };
        }

        let extension = Path::new(&name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase());
        let original = original_name(&name).map(str::to_string);
        FileEntry {
            path: relative,
            parent,
            kind: EntryKind::File,
            size_bytes: Some(metadata.len()),
            size_mb: Some(size_in_mb(metadata.len())),
            extension,
            modified,
            original_name: original,
            name,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}
