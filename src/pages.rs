//! 嵌入式 HTML 页面：上传表单与 TOTP 设置页。

use axum::response::Html;
use rust_embed::RustEmbed;

use crate::config::CODE_FIELD_NAME;
use crate::error::ApiError;

#[derive(RustEmbed)]
#[folder = "templates"]
/// 编译进二进制的页面模板。
pub struct Templates;

/// `GET /` 页面相关设置。
#[derive(Debug)]
pub struct PageConfig {
    pub upload_page: bool,
    pub accept: String,
}

pub fn render_upload(accept: &str, totp_enabled: bool) -> Result<Html<String>, ApiError> {
    let totp_field = if totp_enabled {
        format!(
            r#"<input type="text" id="{CODE_FIELD_NAME}" name="{CODE_FIELD_NAME}" placeholder="Enter TOTP code" autocomplete="one-time-code" inputmode="numeric">"#
        )
    } else {
        String::new()
    };
    let page = load_template("upload.html")?
        .replace("{{accept}}", &escape_html(accept))
        .replace("{{totp_field}}", &totp_field);
    Ok(Html(page))
}

pub fn render_setup(secret: &str, otpauth_url: &str) -> Result<Html<String>, ApiError> {
    let page = load_template("setup.html")?
        .replace("{{secret}}", &escape_html(secret))
        .replace("{{otpauth_url}}", &escape_html(otpauth_url));
    Ok(Html(page))
}

fn load_template(name: &str) -> Result<String, ApiError> {
    let asset =
        Templates::get(name).ok_or_else(|| ApiError::Internal(format!("missing template {name}")))?;
    String::from_utf8(asset.data.into_owned())
        .map_err(|_| ApiError::Internal(format!("template {name} is not UTF-8")))
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
