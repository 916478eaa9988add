//! Active storage root: snapshot reads, validated switches, persisted record.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::fs;
use tokio::io::ErrorKind;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::atomic::write_atomic;
use crate::config::ROOT_DIR_NAME;
use crate::error::StorageError;
use crate::storage::Storage;

/// The confinement boundary for every file operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRoot {
    pub path: PathBuf,
    pub writable: bool,
}

/// On-disk record of the active root and the roots used before it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RootRecord {
    active_root: Option<PathBuf>,
    #[serde(default)]
    previous_roots: Vec<PathBuf>,
    updated_at: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownRoots {
    pub active: StorageRoot,
    pub previous: Vec<PathBuf>,
}

/// Owns the active root. Readers take an `Arc` snapshot; a switch replaces
/// the whole `Arc` in one assignment.
#[derive(Debug)]
pub struct RootRegistry {
    active: RwLock<Arc<StorageRoot>>,
    record_path: PathBuf,
    record: Mutex<RootRecord>,
}

impl RootRegistry {
    /// 启动时加载持久化记录，无效时回退到默认目录。
    pub async fn load(record_path: PathBuf, default_root: PathBuf) -> Result<Self, StorageError> {
        let mut record = read_record(&record_path).await;

        let recorded = match record.active_root.clone() {
            Some(path) => match fs::metadata(&path).await {
                Ok(metadata) if metadata.is_dir() => Some(path),
                _ => {
                    warn!(path = ?path, "recorded storage root unavailable, using default");
                    None
                }
            },
            None => None,
        };

        let root_path = match recorded {
            Some(path) => path,
            None => {
                fs::create_dir_all(&default_root).await?;
                let path = fs::canonicalize(&default_root).await?;
                if let Some(previous) = record.active_root.take() {
                    remember_previous(&mut record.previous_roots, previous, &path);
                }
                record.active_root = Some(path.clone());
                path
            }
        };

        let writable = check_writable(&root_path).await.is_ok();
        if !writable {
            warn!(path = ?root_path, "storage root is not writable");
        }
        info!(path = ?root_path, writable, "storage root active");

        Ok(Self {
            active: RwLock::new(Arc::new(StorageRoot {
                path: root_path,
                writable,
            })),
            record_path,
            record: Mutex::new(record),
        })
    }

    /// 当前活动根目录的不可变快照。
    pub fn active(&self) -> Arc<StorageRoot> {
        match self.active.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 以当前根目录快照构造一次请求使用的存储视图。
    pub fn storage(&self) -> Storage {
        Storage::new(self.active())
    }

    pub async fn known_roots(&self) -> KnownRoots {
        let record = self.record.lock().await;
        KnownRoots {
            active: self.active().as_ref().clone(),
            previous: record.previous_roots.clone(),
        }
    }

    /// 切换活动根目录：校验、创建专用子目录、持久化，最后原子替换。
    ///
    /// Any failure before the final assignment leaves the current root in
    /// effect.
    pub async fn set_active(&self, candidate: &str) -> Result<Arc<StorageRoot>, StorageError> {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return Err(StorageError::InvalidInput("storage path is required".into()));
        }
        let candidate = Path::new(candidate);
        if !candidate.is_absolute() {
            return Err(StorageError::InvalidInput(
                "storage path must be absolute".into(),
            ));
        }

        let metadata = match fs::metadata(candidate).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(candidate.display().to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        if !metadata.is_dir() {
            return Err(StorageError::InvalidInput(format!(
                "{} is not a directory",
                candidate.display()
            )));
        }
        check_writable(candidate).await.map_err(|err| {
            StorageError::PermissionDenied(format!("{} is not writable: {err}", candidate.display()))
        })?;

        let managed = if candidate.file_name() == Some(OsStr::new(ROOT_DIR_NAME)) {
            candidate.to_path_buf()
        } else {
            candidate.join(ROOT_DIR_NAME)
        };

        // Held across persist + swap so the record and the live value agree.
        let mut record = self.record.lock().await;

        fs::create_dir_all(&managed).await?;
        let managed = fs::canonicalize(&managed).await?;
        check_writable(&managed).await.map_err(|err| {
            StorageError::PermissionDenied(format!("{} is not writable: {err}", managed.display()))
        })?;

        let current = self.active();
        let mut next = record.clone();
        if current.path != managed {
            remember_previous(&mut next.previous_roots, current.path.clone(), &managed);
        }
        next.active_root = Some(managed.clone());
        next.updated_at = Some(Utc::now().to_rfc3339());

        let encoded = serde_json::to_vec_pretty(&next)
            .map_err(|err| StorageError::InvalidInput(err.to_string()))?;
        write_atomic(&self.record_path, &encoded).await?;
        *record = next;

        let root = Arc::new(StorageRoot {
            path: managed,
            writable: true,
        });
        match self.active.write() {
            Ok(mut guard) => *guard = root.clone(),
            Err(poisoned) => *poisoned.into_inner() = root.clone(),
        }
        info!(previous = ?current.path, active = ?root.path, "storage root switched");
        Ok(root)
    }
}

async fn read_record(path: &Path) -> RootRecord {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            warn!(path = ?path, error = %err, "ignoring unreadable storage record");
            RootRecord::default()
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => RootRecord::default(),
        Err(err) => {
            warn!(path = ?path, error = %err, "failed to read storage record");
            RootRecord::default()
        }
    }
}

fn remember_previous(previous: &mut Vec<PathBuf>, old: PathBuf, new_active: &Path) {
    previous.retain(|path| path != &old && path != new_active);
    if old != new_active {
        previous.insert(0, old);
    }
}

async fn check_writable(dir: &Path) -> std::io::Result<()> {
    let marker = dir.join(format!(".hazi-write-check-{}", Uuid::new_v4()));
    fs::File::options()
        .write(true)
        .create_new(true)
        .open(&marker)
        .await?;
    fs::remove_file(&marker).await
}
