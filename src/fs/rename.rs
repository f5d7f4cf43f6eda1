//! 删除与重命名。
//!
//! 后端没有原子重命名，`rename` 是先复制后删除。两步之间若进程中断（或 future 被丢弃），
//! 新旧两个键会同时存在且内容相同；调用方需要自行清理。

use tracing::{debug, warn};

use super::ObjectFs;
use crate::error::{FsError, Result};
use crate::key::{self, SEPARATOR};
use crate::storage::StorageError;

impl ObjectFs {
    pub async fn unlink(&self, path: &str) -> Result<()> {
        let file_key = key::to_key(path);
        if file_key.is_empty() || file_key.ends_with(SEPARATOR) {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        match self.store.delete(&file_key).await {
            Ok(()) => {}
            Err(StorageError::NotFound(_)) => {
                if self.is_dir_prefix(path).await? {
                    return Err(FsError::IsADirectory(path.to_string()));
                }
                return Err(FsError::NoSuchEntry(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        debug!("unlink: {}", path);
        Ok(())
    }

    /// 复制 `old` 到 `new` 后删除 `old`。
    ///
    /// - 源不存在：`NoSuchEntry`，无副作用。
    /// - 复制失败：`Io`，源保持不变，不执行删除。
    /// - 删除失败：`Io`，此时新旧两个键都存在。
    ///
    /// 源是目录时，前缀下的每个键都被复制到新前缀，全部复制成功后才开始删除旧键。
    /// 任一路径以 `/` 结尾时按目录处理。
    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        if key::is_root(old) || key::is_root(new) {
            return Err(FsError::InvalidArgument(format!("{} -> {}", old, new)));
        }
        if key::to_dir_key(old) == key::to_dir_key(new) {
            return Ok(());
        }
        if old.ends_with(SEPARATOR) || new.ends_with(SEPARATOR) {
            return self.rename_dir(old, new).await;
        }
        let old_key = key::to_key(old);
        let new_key = key::to_key(new);

        match self.store.copy(&old_key, &new_key).await {
            Ok(()) => {}
            Err(StorageError::NotFound(_)) => return self.rename_dir(old, new).await,
            Err(e) => return Err(e.into()),
        }
        self.remove_source(&old_key, &new_key).await?;
        debug!("rename: {} -> {}", old, new);
        Ok(())
    }

    async fn rename_dir(&self, old: &str, new: &str) -> Result<()> {
        let old_prefix = key::to_dir_key(old);
        let new_prefix = key::to_dir_key(new);

        let listing = self.store.list(&old_prefix, None, None).await?;
        if listing.objects.is_empty() {
            return Err(FsError::NoSuchEntry(old.to_string()));
        }
        if new_prefix.starts_with(&old_prefix) {
            return Err(FsError::InvalidArgument(format!("{} -> {}", old, new)));
        }

        let moves: Vec<(String, String)> = listing
            .objects
            .into_iter()
            .map(|o| {
                let dst = format!("{}{}", new_prefix, &o.key[old_prefix.len()..]);
                (o.key, dst)
            })
            .collect();

        for (src, dst) in &moves {
            if let Err(e) = self.store.copy(src, dst).await {
                warn!("rename: copy {} -> {} failed, sources left intact", src, dst);
                return Err(e.into());
            }
        }
        for (src, dst) in &moves {
            self.remove_source(src, dst).await?;
        }
        debug!("rename: directory {} -> {} ({} objects)", old, new, moves.len());
        Ok(())
    }

    async fn remove_source(&self, src: &str, dst: &str) -> Result<()> {
        match self.store.delete(src).await {
            // 源已被并发删除，结果与预期一致
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => {
                warn!("rename: copied to {} but deleting {} failed; both keys exist", dst, src);
                Err(FsError::Io(e.to_string()))
            }
        }
    }
}
