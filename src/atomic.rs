//! 临时文件写入与原子重命名。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

const TEMP_PREFIX: &str = ".picbin-";
const TEMP_SUFFIX: &str = ".part";

/// 隐藏的临时文件，只有 [`AtomicFile::finalize`] 成功后才会出现在目标名下。
///
/// 未完成就被丢弃（例如请求 future 被取消）时，临时文件会被同步删除。
#[derive(Debug)]
pub struct AtomicFile {
    // 字段按声明顺序析构：句柄先关闭，再删除文件。
    file: File,
    guard: TempGuard,
}

#[derive(Debug)]
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl AtomicFile {
    /// 在 `dir` 中创建临时文件，`dir` 必须与目标位于同一文件系统。
    pub async fn create_in(dir: &Path) -> io::Result<Self> {
        let path = dir.join(format!("{TEMP_PREFIX}{}{TEMP_SUFFIX}", Uuid::new_v4()));
        let file = File::create(&path).await?;
        Ok(Self {
            file,
            guard: TempGuard { path, armed: true },
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    #[cfg(test)]
    pub fn temp_path(&self) -> &Path {
        &self.guard.path
    }

    /// 放弃并删除临时文件。
    pub async fn cleanup(self) {
        let Self { file, mut guard } = self;
        drop(file);
        let _ = fs::remove_file(&guard.path).await;
        guard.disarm();
    }

    /// 同步内容并重命名覆盖 `target`，已有文件会被替换。
    pub async fn finalize(self, target: &Path) -> io::Result<()> {
        let Self { mut file, mut guard } = self;
        let synced = match file.flush().await {
            Ok(()) => file.sync_all().await,
            Err(err) => Err(err),
        };
        drop(file);
        // 失败路径交给 guard 删除临时文件。
        synced?;

        if let Err(err) = fs::rename(&guard.path, target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(target).await.is_ok()
                    && fs::rename(&guard.path, target).await.is_ok()
                {
                    guard.disarm();
                    return Ok(());
                }
            }
            return Err(err);
        }
        guard.disarm();

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(())
    }
}

/// 判断文件名是否为本模块生成的临时文件。
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

/// 删除 `dir` 中上次运行遗留的临时文件。
pub async fn sweep_stale_temp(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !is_temp_name(&name.to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        match fs::symlink_metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => continue,
        }
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = ?path, "removed stale upload temp file");
                removed += 1;
            }
            Err(err) => {
                warn!(path = ?path, error = %err, "failed to remove stale upload temp file");
            }
        }
    }
    Ok(removed)
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
