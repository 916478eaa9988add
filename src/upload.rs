//! 上传暂存、提交与暂存目录清理。

use axum::body::Bytes;
use axum::extract::{Extension, Multipart};
use axum::response::Json as JsonResponse;
use chrono::Utc;
use futures_util::stream::{Stream, StreamExt};
use serde::Serialize;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::atomic::{AtomicFile, SealedFile};
use crate::error::{ApiError, ErrorBody, StorageError};
use crate::paths::{ensure_no_symlinks, sanitize_name};
use crate::root::RootRegistry;
use crate::storage::Storage;

#[derive(Debug)]
pub struct UploadConfig {
    pub max_total_size: u64,
    pub max_files: u64,
    pub staging_ttl: Duration,
}

struct StagedUpload {
    original_name: String,
    stored_name: String,
    size: u64,
    sealed: SealedFile,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedFile {
    pub original_name: String,
    pub stored_name: String,
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedFile {
    pub original_name: String,
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReport {
    pub committed: usize,
    pub destination: String,
    pub files: Vec<CommittedFile>,
    pub failed: Vec<FailedFile>,
}

/// One upload request: streams are staged first and become visible only
/// on [`UploadBatch::commit`].
///
/// The batch is bound to the root snapshot it was started with; the
/// destination is resolved once, at commit, against that same snapshot.
pub struct UploadBatch {
    storage: Storage,
    staging_dir: PathBuf,
    staged: Vec<StagedUpload>,
    total_bytes: u64,
    max_total_size: u64,
    max_files: u64,
}

impl UploadBatch {
    pub fn begin(storage: Storage, config: &UploadConfig) -> Self {
        let staging_dir = storage.staging_root().join(Uuid::new_v4().to_string());
        Self {
            storage,
            staging_dir,
            staged: Vec::new(),
            total_bytes: 0,
            max_total_size: config.max_total_size,
            max_files: config.max_files,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// 将一个上传流完整写入暂存目录并同步落盘。
    pub async fn stage<S, E>(&mut self, original_name: &str, stream: S) -> Result<u64, StorageError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        if self.max_files > 0 && self.staged.len() as u64 >= self.max_files {
            return Err(StorageError::InvalidInput(format!(
                "at most {} files per upload",
                self.max_files
            )));
        }
        let name = sanitize_name(original_name)?;

        let mut atomic = AtomicFile::staged_in(&self.staging_dir).await?;
        let mut stream = std::pin::pin!(stream);
        let mut written: u64 = 0;
        let write_result: Result<(), StorageError> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|err| {
                    StorageError::InvalidInput(format!("upload stream failed: {err}"))
                })?;
                if chunk.is_empty() {
                    continue;
                }
                written += chunk.len() as u64;
                if self.max_total_size > 0 && self.total_bytes + written > self.max_total_size {
                    return Err(StorageError::InvalidInput(
                        "upload size exceeds limit".into(),
                    ));
                }
                atomic.file_mut().write_all(&chunk).await?;
            }
            Ok(())
        }
        .await;
        if let Err(err) = write_result {
            atomic.cleanup().await;
            return Err(err);
        }
        let sealed = atomic.seal().await?;

        self.total_bytes += written;
        let stored_name = format!("{}_{}", Utc::now().format("%Y%m%d%H%M%S%3f"), name);
        debug!(
            original = name,
            stored = stored_name,
            bytes = written,
            "upload staged"
        );
        self.staged.push(StagedUpload {
            original_name: name,
            stored_name,
            size: written,
            sealed,
        });
        Ok(written)
    }

    /// 解析目标目录并将暂存文件移动进去；目标无效时丢弃全部暂存文件。
    ///
    /// Best-effort: files moved before a failure stay committed.
    pub async fn commit(self, target: Option<&str>) -> Result<UploadReport, StorageError> {
        if self.staged.is_empty() {
            self.abort().await;
            return Err(StorageError::InvalidInput("no files were uploaded".into()));
        }

        let destination = match self.prepare_destination(target).await {
            Ok(destination) => destination,
            Err(err) => {
                self.abort().await;
                return Err(err);
            }
        };
        let destination_display = self.storage.relative_of(&destination);

        let mut files = Vec::new();
        let mut failed = Vec::new();
        for staged in self.staged {
            match staged
                .sealed
                .move_into_unique(&destination, &staged.stored_name)
                .await
            {
                Ok(stored_name) => files.push(CommittedFile {
                    path: self.storage.relative_of(&destination.join(&stored_name)),
                    original_name: staged.original_name,
                    stored_name,
                    size_bytes: staged.size,
                }),
                Err(err) => {
                    warn!(
                        original = staged.original_name,
                        error = %err,
                        "upload commit failed"
                    );
                    failed.push(FailedFile {
                        original_name: staged.original_name,
                        error: StorageError::from(err).to_body(),
                    });
                }
            }
        }
        let _ = fs::remove_dir_all(&self.staging_dir).await;

        Ok(UploadReport {
            committed: files.len(),
            destination: destination_display,
            files,
            failed,
        })
    }

    async fn prepare_destination(&self, target: Option<&str>) -> Result<PathBuf, StorageError> {
        let destination = self.storage.resolve_path_checked(target, true).await?;
        if let Ok(metadata) = fs::symlink_metadata(&destination).await
            && !metadata.is_dir()
        {
            return Err(StorageError::InvalidInput(format!(
                "{} is not a directory",
                self.storage.relative_of(&destination)
            )));
        }
        fs::create_dir_all(&destination).await?;
        ensure_no_symlinks(self.storage.root_path(), &destination, false).await?;
        Ok(destination)
    }

    /// 放弃全部暂存文件。
    pub async fn abort(self) {
        for staged in self.staged {
            staged.sealed.discard().await;
        }
        let _ = fs::remove_dir_all(&self.staging_dir).await;
    }
}

/// 接收 multipart 上传：`path` 字段可出现在文件字段之前或之后。
pub async fn upload_files(
    Extension(registry): Extension<Arc<RootRegistry>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    mut multipart: Multipart,
) -> Result<JsonResponse<UploadReport>, ApiError> {
    let mut batch = UploadBatch::begin(registry.storage(), &upload);
    let mut target: Option<String> = None;

    let received: Result<(), ApiError> = async {
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| ApiError::BadRequest(err.to_string()))?
        {
            let field_name = field.name().map(str::to_string);
            match field_name.as_deref() {
                Some("path") => {
                    if target.is_some() {
                        return Err(ApiError::BadRequest("path given more than once".into()));
                    }
                    let value = field
                        .text()
                        .await
                        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
                    target = Some(value);
                }
                Some("file") | Some("files") => {
                    let name = field
                        .file_name()
                        .map(str::to_string)
                        .ok_or_else(|| ApiError::BadRequest("file name is required".into()))?;
                    batch.stage(&name, field).await?;
                }
                _ => continue,
            }
        }
        Ok(())
    }
    .await;

    if let Err(err) = received {
        batch.abort().await;
        return Err(err);
    }
    if batch.is_empty() {
        batch.abort().await;
        return Err(ApiError::BadRequest("no files were uploaded".into()));
    }

    let report = batch.commit(target.as_deref()).await?;
    info!(
        path = report.destination,
        committed = report.committed,
        failed = report.failed.len(),
        "upload complete"
    );
    Ok(JsonResponse(report))
}

/// 清理过期的暂存批次目录。
pub async fn cleanup_staging(storage: &Storage, ttl: Duration) -> Result<(), std::io::Error> {
    if ttl.is_zero() {
        return Ok(());
    }

    let staging_root = storage.staging_root();
    if fs::metadata(&staging_root).await.is_err() {
        return Ok(());
    }

    let now = SystemTime::now();
    let mut dir = fs::read_dir(&staging_root).await?;
    while let Some(entry) = dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_dir() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let Ok(age) = now.duration_since(modified) else {
            continue;
        };
        if age >= ttl {
            let path = entry.path();
            if let Err(err) = fs::remove_dir_all(&path).await {
                warn!(path = ?path, error = %err, "failed to remove stale staging batch");
            } else {
                info!(path = ?path, "removed stale staging batch");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::FromRequest;
    use axum::http::{Request, header};
    use futures_util::stream;
    use std::io;
    use tempfile::tempdir;

    use crate::config::{DEFAULT_STAGING_TTL_SECS, DEFAULT_UPLOAD_MAX_FILES};
    use crate::storage::tests::make_storage;

    fn make_upload_config(max_total_size: u64) -> UploadConfig {
        UploadConfig {
            max_total_size,
            max_files: DEFAULT_UPLOAD_MAX_FILES,
            staging_ttl: Duration::from_secs(DEFAULT_STAGING_TTL_SECS),
        }
    }

    fn body(parts: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes, io::Error>> + use<> {
        let chunks: Vec<Result<Bytes, io::Error>> = parts
            .iter()
            .map(|part| Ok(Bytes::from_static(part)))
            .collect();
        stream::iter(chunks)
    }

    #[tokio::test]
    async fn batch_commits_into_destination_with_decorated_names() {
        let (_temp, storage) = make_storage();
        let config = make_upload_config(0);
        let mut batch = UploadBatch::begin(storage.clone(), &config);
        batch.stage("report.pdf", body(&[b"ab", b"c"])).await.expect("stage");
        batch.stage("report.pdf", body(&[b"xyz"])).await.expect("stage");

        let report = batch.commit(Some("docs/inbox")).await.expect("commit");
        assert_eq!(report.committed, 2);
        assert!(report.failed.is_empty());
        assert_eq!(report.destination, "docs/inbox");
        assert_ne!(report.files[0].stored_name, report.files[1].stored_name);

        let entries = storage.list_dir(Some("docs/inbox")).await.expect("list");
        assert_eq!(entries.len(), 2);
        assert!(
            entries
                .iter()
                .all(|entry| entry.original_name.as_deref() == Some("report.pdf"))
        );
        let leftovers = std::fs::read_dir(storage.staging_root())
            .map(|dir| dir.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn traversal_destination_is_rejected() {
        let (_temp, storage) = make_storage();
        let config = make_upload_config(0);
        let mut batch = UploadBatch::begin(storage.clone(), &config);
        batch.stage("a.txt", body(&[b"x"])).await.expect("stage");
        let staging_dir = batch.staging_dir.clone();

        let result = batch.commit(Some("../elsewhere")).await;
        assert!(matches!(result, Err(StorageError::PathTraversalRejected)));
        assert!(!staging_dir.exists());
        assert!(storage.list_dir(None).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn file_destination_is_rejected() {
        let (_temp, storage) = make_storage();
        std::fs::write(storage.root_path().join("plain.txt"), b"x").expect("write");
        let config = make_upload_config(0);
        let mut batch = UploadBatch::begin(storage, &config);
        batch.stage("a.txt", body(&[b"x"])).await.expect("stage");
        let result = batch.commit(Some("plain.txt")).await;
        assert!(matches!(result, Err(StorageError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn names_with_paths_are_confined_to_destination() {
        let (_temp, storage) = make_storage();
        let config = make_upload_config(0);
        let mut batch = UploadBatch::begin(storage.clone(), &config);
        batch
            .stage("../../etc/passwd", body(&[b"x"]))
            .await
            .expect("stage");
        let report = batch.commit(None).await.expect("commit");

        assert_eq!(report.files[0].original_name, "passwd");
        assert!(storage.root_path().join(&report.files[0].stored_name).is_file());
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected_and_cleaned() {
        let (_temp, storage) = make_storage();
        let config = make_upload_config(4);
        let mut batch = UploadBatch::begin(storage.clone(), &config);
        let result = batch.stage("big.bin", body(&[b"abc", b"def"])).await;
        assert!(matches!(result, Err(StorageError::InvalidInput(_))));
        assert!(batch.is_empty());

        let staged = std::fs::read_dir(&batch.staging_dir)
            .map(|dir| dir.count())
            .unwrap_or(0);
        assert_eq!(staged, 0);
        batch.abort().await;
        assert!(storage.list_dir(None).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn failed_stream_leaves_nothing_visible() {
        let (_temp, storage) = make_storage();
        let config = make_upload_config(0);
        let mut batch = UploadBatch::begin(storage.clone(), &config);
        let broken = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("connection reset")),
        ]);
        assert!(batch.stage("a.txt", broken).await.is_err());
        assert!(matches!(
            batch.commit(None).await,
            Err(StorageError::InvalidInput(_))
        ));
        assert!(storage.list_dir(None).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn commit_is_best_effort_across_files() {
        let (_temp, storage) = make_storage();
        let config = make_upload_config(0);
        let mut batch = UploadBatch::begin(storage.clone(), &config);
        batch.stage("one.txt", body(&[b"1"])).await.expect("stage");
        batch.stage("two.txt", body(&[b"2"])).await.expect("stage");

        let victim = std::fs::read_dir(&batch.staging_dir)
            .expect("staging dir")
            .next()
            .expect("one staged file")
            .expect("entry")
            .path();
        std::fs::remove_file(victim).expect("remove staged file");

        let report = batch.commit(Some("inbox")).await.expect("commit");
        assert_eq!(report.committed, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].error.kind, "NotFound");
        let entries = storage.list_dir(Some("inbox")).await.expect("list");
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn in_flight_upload_lands_under_original_root() {
        let temp = tempdir().expect("tempdir");
        let volume_b = temp.path().join("volume-b");
        std::fs::create_dir_all(&volume_b).expect("volume b");
        let registry = RootRegistry::load(
            temp.path().join("config.json"),
            temp.path().join("volume-a"),
        )
        .await
        .expect("registry");
        let config = make_upload_config(0);

        let storage = registry.storage();
        let root_a = storage.root_path().to_path_buf();
        let mut batch = UploadBatch::begin(storage, &config);
        batch.stage("late.txt", body(&[b"data"])).await.expect("stage");

        let root_b = registry
            .set_active(volume_b.to_str().expect("utf8"))
            .await
            .expect("switch");
        let report = batch.commit(Some("incoming")).await.expect("commit");

        let landed = root_a.join("incoming").join(&report.files[0].stored_name);
        assert_eq!(std::fs::read(landed).expect("read"), b"data");
        assert!(!root_b.path.join("incoming").exists());
    }

    const BOUNDARY: &str = "hazivault-test-boundary";

    async fn multipart_request(fields: &[(&str, Option<&str>, &str)]) -> Multipart {
        let mut payload = String::new();
        for (name, file_name, value) in fields {
            payload.push_str(&format!("--{BOUNDARY}\r\n"));
            match file_name {
                Some(file_name) => payload.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )),
                None => payload.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                )),
            }
            payload.push_str(value);
            payload.push_str("\r\n");
        }
        payload.push_str(&format!("--{BOUNDARY}--\r\n"));

        let request = Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(axum::body::Body::from(payload))
            .expect("request");
        Multipart::from_request(request, &()).await.expect("multipart")
    }

    async fn make_registry(temp: &tempfile::TempDir) -> Arc<RootRegistry> {
        Arc::new(
            RootRegistry::load(temp.path().join("config.json"), temp.path().join("root"))
                .await
                .expect("registry"),
        )
    }

    #[tokio::test]
    async fn path_field_after_files_sets_destination() {
        let temp = tempdir().expect("tempdir");
        let registry = make_registry(&temp).await;
        let multipart = multipart_request(&[
            ("file", Some("a.txt"), "alpha"),
            ("files", Some("b.txt"), "beta"),
            ("path", None, "docs"),
        ])
        .await;

        let JsonResponse(report) = upload_files(
            Extension(registry.clone()),
            Extension(Arc::new(make_upload_config(0))),
            multipart,
        )
        .await
        .expect("upload");

        assert_eq!(report.destination, "docs");
        assert_eq!(report.committed, 2);
        let entries = registry
            .storage()
            .list_dir(Some("docs"))
            .await
            .expect("list");
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn path_field_before_files_still_works() {
        let temp = tempdir().expect("tempdir");
        let registry = make_registry(&temp).await;
        let multipart =
            multipart_request(&[("path", None, "inbox"), ("file", Some("a.txt"), "alpha")]).await;

        let JsonResponse(report) = upload_files(
            Extension(registry),
            Extension(Arc::new(make_upload_config(0))),
            multipart,
        )
        .await
        .expect("upload");
        assert_eq!(report.destination, "inbox");
        assert_eq!(report.files[0].original_name, "a.txt");
    }

    #[tokio::test]
    async fn late_traversal_path_discards_staged_files() {
        let temp = tempdir().expect("tempdir");
        let registry = make_registry(&temp).await;
        let multipart =
            multipart_request(&[("file", Some("a.txt"), "alpha"), ("path", None, "../out")]).await;

        let result = upload_files(
            Extension(registry.clone()),
            Extension(Arc::new(make_upload_config(0))),
            multipart,
        )
        .await;

        assert!(matches!(
            result,
            Err(ApiError::Storage(StorageError::PathTraversalRejected))
        ));
        let storage = registry.storage();
        assert!(storage.list_dir(None).await.expect("list").is_empty());
        let staged = std::fs::read_dir(storage.staging_root())
            .map(|dir| dir.count())
            .unwrap_or(0);
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn cleanup_removes_only_stale_batches() {
        let (_temp, storage) = make_storage();
        let batch_dir = storage.staging_root().join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&batch_dir).expect("batch dir");

        cleanup_staging(&storage, Duration::from_secs(3600))
            .await
            .expect("cleanup");
        assert!(batch_dir.exists());

        tokio::time::sleep(Duration::from_millis(20)).await;
        cleanup_staging(&storage, Duration::from_millis(10))
            .await
            .expect("cleanup");
        assert!(!batch_dir.exists());
    }
}
