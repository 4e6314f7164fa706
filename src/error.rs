//! 统一的请求错误类型及其 HTTP 映射。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt::Display;
use std::io::ErrorKind;
use tracing::warn;

use crate::credential::CredentialError;
use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    MethodNotAllowed,
    Internal(String),
}

impl ApiError {
    /// 记录内部错误详情，客户端只收到固定文本。
    pub fn internal(context: &str, err: impl Display) -> Self {
        warn!(error = %err, "{context}");
        ApiError::Internal("Internal Server Error".into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg).into_response(),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::MethodNotAllowed => {
                (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response()
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Forbidden(_) => ApiError::Forbidden("Forbidden".into()),
            StorageError::NotFound => ApiError::NotFound("404 Not Found".into()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound("404 Not Found".into()),
                _ => ApiError::internal("storage I/O failed", err),
            },
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(error: CredentialError) -> Self {
        match error {
            CredentialError::AlreadyInitialized => {
                ApiError::Forbidden("TOTP is already configured".into())
            }
            CredentialError::Io(err) => ApiError::internal("credential I/O failed", err),
        }
    }
}
