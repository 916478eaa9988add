//! 统一的存储错误分类与 API 错误响应。

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::Serialize;
use std::io::{self, ErrorKind};
use thiserror::Error;

/// Failure taxonomy shared by every storage operation.
///
/// Raw `io::Error`s never leave the storage layer; they are classified
/// into one of these kinds by [`StorageError::from`].
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path escapes the storage root")]
    PathTraversalRejected,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StorageError {
    /// Stable identifier used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::PathTraversalRejected => "PathTraversalRejected",
            StorageError::NotFound(_) => "NotFound",
            StorageError::AlreadyExists(_) => "AlreadyExists",
            StorageError::PermissionDenied(_) => "PermissionDenied",
            StorageError::InvalidInput(_) => "InvalidInput",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => StorageError::NotFound("entry".into()),
            ErrorKind::AlreadyExists => StorageError::AlreadyExists("entry".into()),
            ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => {
                StorageError::PermissionDenied(err.to_string())
            }
            ErrorKind::InvalidInput
            | ErrorKind::InvalidData
            | ErrorKind::NotADirectory
            | ErrorKind::IsADirectory
            | ErrorKind::DirectoryNotEmpty => StorageError::InvalidInput(err.to_string()),
            _ => StorageError::PermissionDenied(err.to_string()),
        }
    }
}

/// Structured failure body: `{ "kind": ..., "message": ... }`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Storage(StorageError),
    BadRequest(String),
    Internal(String),
    Unauthorized(HeaderMap),
    Forbidden(String),
    TooManyRequests(u64),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, ErrorBody) {
        match self {
            ApiError::Storage(err) => {
                let status = match err {
                    StorageError::PathTraversalRejected => StatusCode::FORBIDDEN,
                    StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                    StorageError::AlreadyExists(_) => StatusCode::CONFLICT,
                    StorageError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                    StorageError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                };
                (status, err.to_body())
            }
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    kind: "InvalidInput",
                    message: msg.clone(),
                },
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    kind: "Internal",
                    message: msg.clone(),
                },
            ),
            ApiError::Unauthorized(_) => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    kind: "Unauthorized",
                    message: "unauthorized".into(),
                },
            ),
            ApiError::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                ErrorBody {
                    kind: "Forbidden",
                    message: msg.clone(),
                },
            ),
            ApiError::TooManyRequests(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorBody {
                    kind: "TooManyRequests",
                    message: "too many requests".into(),
                },
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.parts();
        let headers = match self {
            ApiError::Unauthorized(headers) => headers,
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                headers
            }
            _ => HeaderMap::new(),
        };
        (status, headers, JsonResponse(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        ApiError::Storage(error)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// JSON 请求体；解析失败同样返回 `{kind,message}`。
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// 查询参数；缺失或非法字段返回 `InvalidInput`。
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);
