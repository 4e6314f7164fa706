//! ETag 计算与条件 GET 校验。

use axum::http::{HeaderMap, header};
use httpdate::parse_http_date;
use std::fs::Metadata;
use std::time::{SystemTime, UNIX_EPOCH};

/// 根据文件大小与修改时间生成弱 ETag。
pub fn etag_from_metadata(metadata: &Metadata) -> String {
    let size = metadata.len();
    let modified = metadata.modified().ok();
    if let Some(modified) = modified
        && let Ok(duration) = modified.duration_since(UNIX_EPOCH)
    {
        return format!(
            "W/\"{}-{}-{}\"",
            size,
            duration.as_secs(),
            duration.subsec_nanos()
        );
    }
    format!("W/\"{}\"", size)
}

/// 客户端缓存仍有效时返回 true。
///
/// `If-None-Match` 优先；缺少时才参考 `If-Modified-Since`。
pub fn is_not_modified(headers: &HeaderMap, etag: &str, modified: Option<SystemTime>) -> bool {
    if let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        return value.trim() == "*" || etag_matches(value, etag);
    }

    let Some(since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_http_date(v).ok())
    else {
        return false;
    };
    let Some(modified) = modified else {
        return false;
    };
    // HTTP 日期只精确到秒。
    let modified_secs = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let since_secs = since
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    modified_secs <= since_secs
}

fn etag_matches(header_value: &str, current: &str) -> bool {
    let current = current.trim_start_matches("W/");
    header_value
        .split(',')
        .map(|item| item.trim().trim_start_matches("W/"))
        .any(|item| item == current)
}
