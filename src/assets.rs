//! 静态资源输出与 404 回退。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path as UrlPath, rejection::PathRejection};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use httpdate::fmt_http_date;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::config::ASSET_CACHE_CONTROL;
use crate::error::ApiError;
use crate::etag::{etag_from_metadata, is_not_modified};
use crate::storage::{AssetStore, StorageError};

/// 所有 404 响应附带的可选页面。
#[derive(Debug)]
pub struct NotFoundPage {
    path: PathBuf,
}

impl NotFoundPage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// 不得作为普通资源输出的文件名。
    pub fn reserved_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// 以 404 状态返回该页面，页面不存在时返回固定文本。
    pub async fn response(&self) -> Result<Response, ApiError> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok((StatusCode::NOT_FOUND, "404 Not Found").into_response());
            }
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to read not-found page"
                );
                return Err(ApiError::Internal("Internal Server Error".into()));
            }
        };
        let content_type = mime_guess::from_path(&self.path)
            .first_raw()
            .unwrap_or("text/html");
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        Ok((StatusCode::NOT_FOUND, headers, AxumBody::from(data)).into_response())
    }
}

/// 路径守卫通过后，从资源根目录输出 `/<name>`。
pub async fn serve_asset(
    path: Result<UrlPath<String>, PathRejection>,
    request_headers: HeaderMap,
    Extension(assets): Extension<Arc<AssetStore>>,
    Extension(not_found): Extension<Arc<NotFoundPage>>,
) -> Result<Response, ApiError> {
    let UrlPath(path) = path.map_err(|_| ApiError::BadRequest("invalid path".into()))?;
    let target = match assets.resolve_checked(&path).await {
        Ok(target) => target,
        Err(StorageError::NotFound) => return not_found.response().await,
        Err(StorageError::Forbidden(reason)) => {
            warn!(path, reason, "asset request rejected");
            return Err(ApiError::Forbidden("Forbidden".into()));
        }
        Err(err) => return Err(err.into()),
    };

    match open_asset(&target, &request_headers).await {
        Err(ApiError::NotFound(_)) => not_found.response().await,
        other => other,
    }
}

async fn open_asset(target: &Path, request_headers: &HeaderMap) -> Result<Response, ApiError> {
    let file = File::open(target).await.map_err(|err| match err.kind() {
        ErrorKind::NotFound => ApiError::NotFound("404 Not Found".into()),
        _ => ApiError::internal("failed to open asset", err),
    })?;
    let metadata = file
        .metadata()
        .await
        .map_err(|err| ApiError::internal("failed to stat asset", err))?;
    if metadata.is_dir() {
        return Err(ApiError::Forbidden("Forbidden".into()));
    }

    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let etag = etag_from_metadata(&metadata);
    let mime = mime_guess::from_path(target).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::ETAG,
        HeaderValue::from_str(&etag).map_err(|_| ApiError::Internal("invalid header".into()))?,
    );
    if let Some(modified) = modified {
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("invalid header".into()))?,
        );
    }
    response_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(ASSET_CACHE_CONTROL),
    );

    if is_not_modified(request_headers, &etag, modified) {
        debug!(path = %target.display(), "asset not modified");
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid MIME type".into()))?,
    );
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let range = match parse_range(request_headers.get(header::RANGE), file_size) {
        Ok(range) => range,
        Err(RangeError::Unsatisfiable) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{file_size}")) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            return Ok((StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response());
        }
        Err(RangeError::Invalid) => None,
    };

    if let Some((start, end)) = range {
        let length = end - start + 1;
        let mut file = file;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| ApiError::internal("failed to seek asset", err))?;
        response_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{end}/{file_size}"))
                .map_err(|_| ApiError::Internal("invalid header".into()))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        let stream = ReaderStream::new(file.take(length));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
    let stream = ReaderStream::new(file);
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

#[derive(Debug, PartialEq, Eq)]
enum RangeError {
    /// 格式错误或多段范围，按完整响应处理。
    Invalid,
    Unsatisfiable,
}

/// 解析单段 `bytes=` 范围，返回闭区间偏移。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, RangeError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| RangeError::Invalid)?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(RangeError::Invalid);
    };
    if range.contains(',') {
        return Err(RangeError::Invalid);
    }
    if file_size == 0 {
        return Err(RangeError::Unsatisfiable);
    }

    let (start_part, end_part) = range.split_once('-').ok_or(RangeError::Invalid)?;
    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part.parse().map_err(|_| RangeError::Invalid)?;
        if suffix == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start: u64 = start_part.parse().map_err(|_| RangeError::Invalid)?;
        let end: u64 = if end_part.is_empty() {
            file_size - 1
        } else {
            end_part.parse().map_err(|_| RangeError::Invalid)?
        };
        (start, end.min(file_size - 1))
    };

    if start > end || start >= file_size {
        return Err(RangeError::Unsatisfiable);
    }
    Ok(Some((start, end)))
}
