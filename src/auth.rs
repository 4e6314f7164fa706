//! 上传的一次性密码校验与首次运行的设置流程。

use axum::extract::{Extension, Form, rejection::FormRejection};
use axum::response::{IntoResponse, Redirect, Response};
use serde::Deserialize;
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{info, warn};

use crate::credential::{CredentialState, CredentialStore};
use crate::error::ApiError;
use crate::pages;

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP_SECS: u64 = 30;

#[derive(Debug)]
pub struct AuthConfig {
    pub enabled: bool,
    pub issuer: String,
    pub account: String,
    pub credentials: CredentialStore,
}

impl AuthConfig {
    /// 上传是否需要先转到设置流程。
    pub async fn needs_setup(&self) -> bool {
        self.enabled && self.credentials.state().await == CredentialState::Uninitialized
    }

    fn build_totp(&self, secret: &str) -> Option<TOTP> {
        let bytes = Secret::Encoded(normalize_secret(secret)).to_bytes().ok()?;
        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP_SECS,
            bytes,
            Some(self.issuer.clone()),
            self.account.clone(),
        )
        .ok()
    }

    /// 校验 `code`，前后各容忍一个时间步长。
    pub fn verify_code(&self, secret: &str, code: &str) -> bool {
        let Some(totp) = self.build_totp(secret) else {
            return false;
        };
        totp.check_current(code.trim()).unwrap_or(false)
    }

    /// 使用已保存的密钥校验上传验证码。
    pub async fn authorize_upload(&self, code: Option<&str>) -> Result<(), ApiError> {
        let code = code.map(str::trim).unwrap_or_default();
        if code.is_empty() {
            return Err(ApiError::BadRequest("TOTP code is required".into()));
        }
        let secret = self.credentials.read().await.map_err(|err| {
            warn!(error = ?err, "failed to read TOTP secret");
            ApiError::Internal("Internal Server Error".into())
        })?;
        if self.build_totp(&secret).is_none() {
            return Err(ApiError::Internal("stored TOTP secret is invalid".into()));
        }
        if !self.verify_code(&secret, code) {
            warn!("rejected upload with invalid TOTP code");
            return Err(ApiError::Unauthorized("Invalid TOTP code".into()));
        }
        Ok(())
    }

    /// 生成新密钥及其 `otpauth://` 配置链接。
    pub fn generate_secret(&self) -> Result<(String, String), ApiError> {
        let secret = Secret::generate_secret().to_encoded().to_string();
        let totp = self
            .build_totp(&secret)
            .ok_or_else(|| ApiError::Internal("unable to build TOTP parameters".into()))?;
        Ok((secret, totp.get_url()))
    }

    #[cfg(test)]
    pub fn current_code(&self, secret: &str) -> String {
        self.build_totp(secret)
            .expect("valid secret")
            .generate_current()
            .expect("system time")
    }
}

/// 转为大写并去除空白与 `=` 填充，使粘贴的密钥仍可解码。
fn normalize_secret(secret: &str) -> String {
    secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SetupForm {
    #[serde(default)]
    totp_key: String,
    #[serde(default)]
    totp_code: String,
}

/// 尚无凭据时展示新生成的密钥。
pub async fn setup_page(Extension(auth): Extension<Arc<AuthConfig>>) -> Result<Response, ApiError> {
    if !auth.needs_setup().await {
        return Err(ApiError::Forbidden("TOTP is already configured".into()));
    }
    let (secret, url) = auth.generate_secret()?;
    Ok(pages::render_setup(&secret, &url)?.into_response())
}

/// 验证码匹配后保存提交的密钥。
pub async fn complete_setup(
    Extension(auth): Extension<Arc<AuthConfig>>,
    form: Result<Form<SetupForm>, FormRejection>,
) -> Result<Response, ApiError> {
    if !auth.needs_setup().await {
        return Err(ApiError::Forbidden("TOTP is already configured".into()));
    }
    let Form(SetupForm {
        totp_key,
        totp_code,
    }) = form.map_err(|_| ApiError::BadRequest("Unable to parse form".into()))?;
    let secret = normalize_secret(&totp_key);
    if secret.is_empty() || totp_code.trim().is_empty() {
        return Err(ApiError::BadRequest("TOTP key and code are required".into()));
    }
    if !auth.verify_code(&secret, &totp_code) {
        warn!("rejected TOTP setup with invalid code");
        return Err(ApiError::Unauthorized("Invalid TOTP code".into()));
    }

    auth.credentials.initialize(&secret).await?;
    info!(path = %auth.credentials.path().display(), "TOTP secret stored");
    Ok(Redirect::to("/").into_response())
}
