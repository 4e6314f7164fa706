//! 多部分表单图片上传：校验、命名与落盘。

use axum::extract::{Extension, Multipart, multipart::Field, multipart::MultipartRejection};
use axum::response::{IntoResponse, Redirect, Response};
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::atomic::AtomicFile;
use crate::auth::AuthConfig;
use crate::config::{
    CODE_FIELD_NAME, FILE_FIELD_NAMES, MAX_CODE_FIELD_LEN, NamingScheme, SETUP_PATH,
};
use crate::error::ApiError;
use crate::extensions::extension_of;
use crate::storage::AssetStore;

#[derive(Debug)]
pub struct UploadConfig {
    pub naming: NamingScheme,
    pub memory_threshold: usize,
}

/// 单个上传文件的缓冲：阈值以内保存在内存，超出后写入隐藏临时文件。
///
/// 请求流只读取一次，摘要与缓冲使用同一批数据块，最终文件也由缓冲生成。
/// 缓冲被丢弃时临时文件随之删除。
pub struct UploadBuffer {
    staging_dir: PathBuf,
    threshold: usize,
    memory: Vec<u8>,
    spill: Option<AtomicFile>,
    digest: Option<md5::Context>,
    len: u64,
}

impl UploadBuffer {
    pub fn new(staging_dir: PathBuf, threshold: usize, hash: bool) -> Self {
        Self {
            staging_dir,
            threshold,
            memory: Vec::new(),
            spill: None,
            digest: hash.then(md5::Context::new),
            len: 0,
        }
    }

    pub async fn push(&mut self, chunk: &[u8]) -> io::Result<()> {
        if let Some(digest) = self.digest.as_mut() {
            digest.consume(chunk);
        }
        self.len += chunk.len() as u64;

        if let Some(spill) = self.spill.as_mut() {
            return spill.file_mut().write_all(chunk).await;
        }
        if self.memory.len() + chunk.len() <= self.threshold {
            self.memory.extend_from_slice(chunk);
            return Ok(());
        }

        let mut spill = AtomicFile::create_in(&self.staging_dir).await?;
        let memory = std::mem::take(&mut self.memory);
        let written = match spill.file_mut().write_all(&memory).await {
            Ok(()) => spill.file_mut().write_all(chunk).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            spill.cleanup().await;
            return Err(err);
        }
        self.spill = Some(spill);
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    /// 已写入内容的小写十六进制 MD5（仅在启用哈希时）。
    pub fn hex_digest(&self) -> Option<String> {
        self.digest
            .clone()
            .map(|digest| format!("{:x}", digest.compute()))
    }

    /// 将缓冲内容移动到 `target`，覆盖已有文件。
    pub async fn persist(self, target: &Path) -> io::Result<()> {
        let file = match self.spill {
            Some(file) => file,
            None => {
                let mut file = AtomicFile::create_in(&self.staging_dir).await?;
                if let Err(err) = file.file_mut().write_all(&self.memory).await {
                    file.cleanup().await;
                    return Err(err);
                }
                file
            }
        };
        file.finalize(target).await
    }

    pub async fn discard(self) {
        if let Some(spill) = self.spill {
            spill.cleanup().await;
        }
    }
}

/// 上传文件的存储名；内容哈希命名缺少摘要时返回 `None`。
pub fn stored_name(
    scheme: NamingScheme,
    digest: Option<&str>,
    extension: &str,
    now: DateTime<Utc>,
) -> Option<String> {
    match (scheme, digest) {
        (NamingScheme::ContentHash, Some(digest)) => Some(format!("{digest}{extension}")),
        (NamingScheme::ContentHash, None) => None,
        (NamingScheme::Timestamp, _) => Some(format!("{}{extension}", now.timestamp_millis())),
    }
}

struct ReceivedFile {
    extension: String,
    buffer: UploadBuffer,
}

#[derive(Default)]
struct UploadForm {
    file: Option<ReceivedFile>,
    code: Option<String>,
}

impl UploadForm {
    async fn discard(self) {
        if let Some(file) = self.file {
            file.buffer.discard().await;
        }
    }
}

/// `POST /`：保存一张图片并重定向到其公开路径。
pub async fn upload_image(
    Extension(assets): Extension<Arc<AssetStore>>,
    Extension(auth): Extension<Arc<AuthConfig>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    if auth.needs_setup().await {
        return Ok(Redirect::to(SETUP_PATH).into_response());
    }
    let mut multipart =
        multipart.map_err(|_| ApiError::BadRequest("Unable to parse form".into()))?;

    let UploadForm { file, code } = receive_form(&mut multipart, &assets, &upload).await?;
    let Some(ReceivedFile { extension, buffer }) = file else {
        return Err(ApiError::BadRequest("Error retrieving the file".into()));
    };

    if auth.enabled
        && let Err(err) = auth.authorize_upload(code.as_deref()).await
    {
        buffer.discard().await;
        return Err(err);
    }

    let Some(name) = stored_name(
        upload.naming,
        buffer.hex_digest().as_deref(),
        &extension,
        Utc::now(),
    ) else {
        warn!(naming = ?upload.naming, "upload digest missing");
        buffer.discard().await;
        return Err(ApiError::Internal("Internal Server Error".into()));
    };
    let target = assets.asset_path(&name);
    let size = buffer.size();
    let spilled = buffer.is_spilled();
    buffer.persist(&target).await.map_err(|err| {
        warn!(file = name, error = %err, "failed to store upload");
        ApiError::Internal("Unable to save file".into())
    })?;

    info!(file = name, size, spilled, "image stored");
    Ok(Redirect::to(&format!("/{name}")).into_response())
}

async fn receive_form(
    multipart: &mut Multipart,
    assets: &AssetStore,
    upload: &UploadConfig,
) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Ok(form),
            Err(_) => {
                form.discard().await;
                return Err(ApiError::BadRequest("Unable to parse form".into()));
            }
        };
        let name = field.name().unwrap_or_default().to_string();

        if FILE_FIELD_NAMES.contains(&name.as_str()) {
            let file_name = field.file_name().unwrap_or_default().to_string();
            if file_name.is_empty() {
                continue;
            }
            if form.file.is_some() {
                form.discard().await;
                return Err(ApiError::BadRequest("Only one file may be uploaded".into()));
            }
            let extension = extension_of(&file_name);
            if !assets.extensions().is_allowed(&extension) {
                form.discard().await;
                return Err(ApiError::BadRequest("Invalid file type".into()));
            }
            let buffer = UploadBuffer::new(
                assets.root_path().to_path_buf(),
                upload.memory_threshold,
                upload.naming == NamingScheme::ContentHash,
            );
            match receive_file(field, buffer).await {
                Ok(buffer) => form.file = Some(ReceivedFile { extension, buffer }),
                Err(err) => {
                    form.discard().await;
                    return Err(err);
                }
            }
        } else if name == CODE_FIELD_NAME {
            match receive_code(field).await {
                Ok(code) => form.code = Some(code),
                Err(err) => {
                    form.discard().await;
                    return Err(err);
                }
            }
        }
    }
}

/// 分块读取验证码字段，超过 [`MAX_CODE_FIELD_LEN`] 立即拒绝。
async fn receive_code(mut field: Field<'_>) -> Result<String, ApiError> {
    let mut data = Vec::new();
    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                if data.len() + chunk.len() > MAX_CODE_FIELD_LEN {
                    return Err(ApiError::BadRequest("Verification code too long".into()));
                }
                data.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(_) => return Err(ApiError::BadRequest("Unable to parse form".into())),
        }
    }
    String::from_utf8(data).map_err(|_| ApiError::BadRequest("Unable to parse form".into()))
}

async fn receive_file(
    mut field: Field<'_>,
    mut buffer: UploadBuffer,
) -> Result<UploadBuffer, ApiError> {
    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                if let Err(err) = buffer.push(&chunk).await {
                    warn!(error = %err, "failed to buffer upload");
                    buffer.discard().await;
                    return Err(ApiError::Internal("Unable to buffer upload".into()));
                }
            }
            Ok(None) => return Ok(buffer),
            Err(_) => {
                buffer.discard().await;
                return Err(ApiError::BadRequest("Unable to parse form".into()));
            }
        }
    }
}
