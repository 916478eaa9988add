//! 文件列表、下载、目录创建、重命名与删除处理器。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::bulk::{BulkReport, delete_many};
use crate::error::{ApiError, ApiJson, ApiQuery, StorageError};
use crate::root::{KnownRoots, RootRegistry, StorageRoot};
use crate::storage::FileEntry;

#[derive(Deserialize)]
pub(crate) struct OptionalPathQuery {
    path: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct RequiredPathQuery {
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct FolderCreateBody {
    path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RenameBody {
    path: String,
    new_name: String,
}

#[derive(Deserialize)]
pub(crate) struct BulkDeleteBody {
    paths: Vec<String>,
}

#[derive(Deserialize)]
pub(crate) struct RootSwitchBody {
    path: String,
}

#[derive(Serialize)]
pub(crate) struct PathResponse {
    path: String,
}

/// 列出目录内容。
pub async fn list_files(
    ApiQuery(query): ApiQuery<OptionalPathQuery>,
    Extension(registry): Extension<Arc<RootRegistry>>,
) -> Result<JsonResponse<Vec<FileEntry>>, ApiError> {
    let storage = registry.storage();
    let entries = storage.list_dir(query.path.as_deref()).await?;
    info!(
        path = query.path.as_deref().unwrap_or(""),
        count = entries.len(),
        "list files"
    );
    Ok(JsonResponse(entries))
}

/// 下载文件。
pub async fn download_file(
    ApiQuery(RequiredPathQuery { path }): ApiQuery<RequiredPathQuery>,
    Extension(registry): Extension<Arc<RootRegistry>>,
) -> Result<Response, ApiError> {
    let storage = registry.storage();
    let target = storage.resolve_path_checked(Some(&path), false).await?;
    let metadata = fs::metadata(&target).await.map_err(StorageError::from)?;
    if metadata.is_dir() {
        return Err(StorageError::InvalidInput("path is not a file".into()).into());
    }
    let file = File::open(&target).await.map_err(StorageError::from)?;

    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".into());
    let mime = mime_guess::from_path(&target).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("无效的 MIME 类型".into()))?,
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(metadata.len()),
    );
    if let Ok(modified) = metadata.modified()
        && let Ok(value) = HeaderValue::from_str(&fmt_http_date(modified))
    {
        headers.insert(header::LAST_MODIFIED, value);
    }
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&file_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    info!(path, size = metadata.len(), "download file");
    Ok((
        StatusCode::OK,
        headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// 创建目录（含父级）。
pub async fn create_folder(
    Extension(registry): Extension<Arc<RootRegistry>>,
    ApiJson(FolderCreateBody { path }): ApiJson<FolderCreateBody>,
) -> Result<(StatusCode, JsonResponse<PathResponse>), ApiError> {
    if path.trim().is_empty() {
        return Err(StorageError::InvalidInput("folder name is required".into()).into());
    }
    let created = registry.storage().create_dir(&path).await?;
    info!(path = created, "create folder");
    Ok((StatusCode::CREATED, JsonResponse(PathResponse { path: created })))
}

/// 删除单个文件或目录。
pub async fn delete_entry(
    ApiQuery(RequiredPathQuery { path }): ApiQuery<RequiredPathQuery>,
    Extension(registry): Extension<Arc<RootRegistry>>,
) -> Result<StatusCode, ApiError> {
    if path.trim().is_empty() {
        return Err(StorageError::InvalidInput("path is required".into()).into());
    }
    registry.storage().delete_path(&path).await?;
    info!(path, "delete entry");
    Ok(StatusCode::NO_CONTENT)
}

/// 批量删除，返回成功数与逐项结果。
pub async fn delete_entries(
    Extension(registry): Extension<Arc<RootRegistry>>,
    ApiJson(BulkDeleteBody { paths }): ApiJson<BulkDeleteBody>,
) -> Result<JsonResponse<BulkReport>, ApiError> {
    let report = delete_many(&registry.storage(), &paths).await;
    info!(
        requested = report.requested,
        deleted = report.deleted,
        "bulk delete"
    );
    Ok(JsonResponse(report))
}

/// 重命名（仅限同一目录内）。
pub async fn rename_entry(
    Extension(registry): Extension<Arc<RootRegistry>>,
    ApiJson(RenameBody { path, new_name }): ApiJson<RenameBody>,
) -> Result<JsonResponse<PathResponse>, ApiError> {
    if path.trim().is_empty() {
        return Err(StorageError::InvalidInput("path is required".into()).into());
    }
    let renamed = registry.storage().rename_entry(&path, &new_name).await?;
    info!(from = path, to = renamed, "rename entry");
    Ok(JsonResponse(PathResponse { path: renamed }))
}

/// 当前存储根目录及历史记录。
pub async fn get_storage_root(
    Extension(registry): Extension<Arc<RootRegistry>>,
) -> JsonResponse<KnownRoots> {
    JsonResponse(registry.known_roots().await)
}

/// 切换存储根目录；失败时保持原根目录不变。
pub async fn set_storage_root(
    Extension(registry): Extension<Arc<RootRegistry>>,
    ApiJson(RootSwitchBody { path }): ApiJson<RootSwitchBody>,
) -> Result<JsonResponse<StorageRoot>, ApiError> {
    let root = registry.set_active(&path).await?;
    Ok(JsonResponse(root.as_ref().clone()))
}

fn content_disposition(file_name: &str) -> String {
    let ascii: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() && c != '"' && c != '\\' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let encoded: String = file_name
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
                (b as char).to_string()
            } else {
                format!("%{b:02X}")
            }
        })
        .collect();
    format!("attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
}
