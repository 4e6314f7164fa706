//! 资源根目录与请求路径守卫。

use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;
use tracing::info;

use crate::atomic::sweep_stale_temp;
use crate::extensions::{AllowedExtensions, extension_of};

/// 资源根目录，以及判断请求路径能否被访问所需的全部信息。
#[derive(Clone, Debug)]
pub struct AssetStore {
    root: PathBuf,
    extensions: AllowedExtensions,
    reserved_name: String,
}

impl AssetStore {
    pub fn new(root: PathBuf, extensions: AllowedExtensions, reserved_name: String) -> Self {
        Self {
            root,
            extensions,
            reserved_name,
        }
    }

    /// 创建根目录，并清理上次运行中断的上传遗留的临时文件。
    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        let removed = sweep_stale_temp(&self.root).await?;
        if removed > 0 {
            info!(removed, "cleaned stale upload temp files");
        }
        Ok(())
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn extensions(&self) -> &AllowedExtensions {
        &self.extensions
    }

    /// 根目录下名为 `file_name` 的资源路径。
    pub fn asset_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    /// 将请求路径映射为根目录下存在且允许访问的文件。
    pub async fn resolve_checked(&self, request_path: &str) -> Result<PathBuf, StorageError> {
        let target = self.resolve(request_path)?;
        let metadata = match fs::symlink_metadata(&target).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(StorageError::NotFound),
            Err(err) => return Err(StorageError::Io(err)),
        };
        if metadata.file_type().is_symlink() {
            return Err(StorageError::Forbidden("symbolic link"));
        }
        if metadata.is_dir() {
            return Err(StorageError::Forbidden("directory"));
        }
        let name = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        if !self.extensions.is_allowed(&extension_of(&name)) {
            return Err(StorageError::Forbidden("extension not allowed"));
        }
        Ok(target)
    }

    /// 纯词法校验，不访问文件系统。
    fn resolve(&self, request_path: &str) -> Result<PathBuf, StorageError> {
        let mut segments = Vec::new();
        for segment in request_path.split(['/', '\\']) {
            match segment {
                "" | "." => continue,
                ".." => return Err(StorageError::Forbidden("parent traversal")),
                other => segments.push(other),
            }
        }

        let name = match segments.as_slice() {
            [] => return Err(StorageError::Forbidden("directory")),
            [name] => *name,
            _ => return Err(StorageError::Forbidden("subdirectory")),
        };

        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(StorageError::Forbidden("invalid path")),
        }

        let target = self.root.join(name);
        if !target.starts_with(&self.root) {
            return Err(StorageError::Forbidden("outside asset root"));
        }
        if name == self.reserved_name {
            return Err(StorageError::Forbidden("reserved resource"));
        }
        Ok(target)
    }
}

#[derive(Debug)]
pub enum StorageError {
    Forbidden(&'static str),
    NotFound,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}
