//! 统一的 API 错误类型与转换。

use axum::Json;
use axum::extract::multipart::MultipartError;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::io::{self, ErrorKind};
use tracing::{error, warn};

use crate::paths::PathTraversal;
use crate::tenant_lock::LockTimeout;
use crate::workspace::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    /// 携带被拒绝的输入，只写入日志。
    PathTraversal(String),
    NotFound(String),
    Conflict(String),
    LockTimeout,
    /// 携带完整错误细节，只写入日志。
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::PathTraversal(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::LockTimeout => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::PathTraversal(_) => "PATH_TRAVERSAL",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::LockTimeout => "LOCK_TIMEOUT",
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    /// 返回给调用方的消息，不包含任何服务端路径。
    pub fn public_message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) | ApiError::Conflict(msg) => msg,
            ApiError::Unauthorized => "unauthorized",
            ApiError::PathTraversal(_) => "path escapes workspace",
            ApiError::LockTimeout => "workspace is busy, retry later",
            ApiError::Internal(_) => "internal error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::PathTraversal(path) => warn!(path, "path traversal rejected"),
            ApiError::Internal(detail) => error!(detail, "internal storage failure"),
            ApiError::LockTimeout => warn!("tenant lock wait timed out"),
            _ => {}
        }
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.public_message(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::BadRequest("path contains a NUL byte".into()),
            StorageError::Traversal(err) => err.into(),
            StorageError::Io(err) => err.into(),
        }
    }
}

impl From<io::Error> for ApiError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => ApiError::NotFound("file or directory not found".into()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<PathTraversal> for ApiError {
    fn from(err: PathTraversal) -> Self {
        ApiError::PathTraversal(err.path)
    }
}

impl From<LockTimeout> for ApiError {
    fn from(_: LockTimeout) -> Self {
        ApiError::LockTimeout
    }
}

impl From<JsonRejection> for ApiError {
    fn from(_: JsonRejection) -> Self {
        ApiError::BadRequest("invalid request body".into())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(_: QueryRejection) -> Self {
        ApiError::BadRequest("invalid query parameters".into())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(_: MultipartRejection) -> Self {
        ApiError::BadRequest("expected a multipart/form-data body".into())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::BadRequest(err.body_text())
    }
}
