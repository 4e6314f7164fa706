//! 唯一共享 TOTP 密钥的持久化。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::atomic::AtomicFile;

/// 密钥是否已完成初始化。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialState {
    Uninitialized,
    Active,
}

#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    bootstrap: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            bootstrap: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 仅当凭据文件存在且为普通文件时返回 true。
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|metadata| metadata.is_file())
            .unwrap_or(false)
    }

    pub async fn state(&self) -> CredentialState {
        if self.exists().await {
            CredentialState::Active
        } else {
            CredentialState::Uninitialized
        }
    }

    /// 读取已保存的密钥并去除首尾空白。
    pub async fn read(&self) -> Result<String, CredentialError> {
        let contents = fs::read_to_string(&self.path).await?;
        Ok(contents.trim().to_string())
    }

    /// 保存 `secret`，覆盖已有文件。
    pub async fn write(&self, secret: &str) -> Result<(), CredentialError> {
        let mut atomic = AtomicFile::create_in(parent_dir(&self.path)).await?;
        if let Err(err) = atomic.file_mut().write_all(secret.as_bytes()).await {
            atomic.cleanup().await;
            return Err(CredentialError::Io(err));
        }
        atomic.finalize(&self.path).await?;
        Ok(())
    }

    /// 单写者初始化：仅在凭据不存在时保存 `secret`。
    pub async fn initialize(&self, secret: &str) -> Result<(), CredentialError> {
        let _guard = self.bootstrap.lock().await;
        if self.exists().await {
            return Err(CredentialError::AlreadyInitialized);
        }
        self.write(secret).await
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[derive(Debug)]
pub enum CredentialError {
    AlreadyInitialized,
    Io(io::Error),
}

impl From<io::Error> for CredentialError {
    fn from(err: io::Error) -> Self {
        CredentialError::Io(err)
    }
}
