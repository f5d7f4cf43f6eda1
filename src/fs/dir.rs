use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use super::ObjectFs;
use crate::config::RmdirPolicy;
use crate::error::{FsError, Result};
use crate::key::{self, SEPARATOR};
use crate::posix::NodeKind;
use crate::storage::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

/// 目录列举结果：`.` 和 `..` 在前，其后是去重的直接子项。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryListing {
    pub entries: Vec<DirEntry>,
}

impl DirectoryListing {
    fn new() -> Self {
        let dot = |name: &str| DirEntry {
            name: name.to_string(),
            kind: NodeKind::Directory,
        };
        Self {
            entries: vec![dot("."), dot("..")],
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }
}

impl ObjectFs {
    /// 校验目录存在。目录句柄不携带状态，总是 0。
    pub async fn opendir(&self, path: &str) -> Result<u64> {
        if key::is_root(path) {
            return Ok(0);
        }
        let dir_key = key::to_dir_key(path);
        let listing = self.store.list(&dir_key, Some(SEPARATOR), Some(1)).await?;
        if listing.is_empty() {
            return Err(FsError::NoSuchEntry(path.to_string()));
        }
        Ok(0)
    }

    pub async fn readdir(&self, path: &str) -> Result<DirectoryListing> {
        let prefix = key::to_dir_key(path);
        let listing = self.store.list(&prefix, Some(SEPARATOR), None).await?;

        let mut result = DirectoryListing::new();
        let mut seen = HashSet::new();
        let files = listing
            .objects
            .iter()
            .filter_map(|o| key::child_name(&prefix, &o.key))
            .map(|name| (name, NodeKind::RegularFile));
        let dirs = listing
            .common_prefixes
            .iter()
            .filter_map(|p| key::child_name(&prefix, p))
            .map(|name| (name, NodeKind::Directory));

        for (name, kind) in files.chain(dirs) {
            if seen.insert(name) {
                result.entries.push(DirEntry {
                    name: name.to_string(),
                    kind,
                });
            }
        }
        debug!("readdir: {} -> {} entries", path, result.entries.len());
        Ok(result)
    }

    /// 写入目录标记。目录已存在时幂等成功；同名文件存在时返回 `AlreadyExists`。
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        if key::is_root(path) {
            return Ok(());
        }

        match self.store.head(&key::to_key(path.trim_end_matches(SEPARATOR))).await {
            Ok(_) => return Err(FsError::AlreadyExists(path.to_string())),
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let dir_key = key::to_dir_key(path);
        match self.store.head(&dir_key).await {
            Ok(_) => {
                debug!("mkdir: marker {} already exists", dir_key);
                return Ok(());
            }
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.store.put(&dir_key, Vec::new(), HashMap::new()).await?;
        debug!("mkdir: created marker {}", dir_key);
        Ok(())
    }

    /// 删除空目录的标记对象。
    ///
    /// 目录下还有其他对象时按 `rmdir_policy` 处理：默认返回 `DirectoryNotEmpty`，
    /// 配置为 `recursive` 时先删除所有子对象。
    pub async fn rmdir(&self, path: &str) -> Result<()> {
        if key::is_root(path) {
            return Err(FsError::InvalidArgument(path.to_string()));
        }
        let dir_key = key::to_dir_key(path);

        // 标记之外只要再多一个对象就足以判定非空
        let listing = self.store.list(&dir_key, None, Some(2)).await?;
        if listing.is_empty() {
            return Err(FsError::NoSuchEntry(path.to_string()));
        }
        let has_marker = listing.objects.iter().any(|o| o.key == dir_key);
        let has_children = listing.objects.iter().any(|o| o.key != dir_key);

        if has_children {
            match self.config.rmdir_policy {
                RmdirPolicy::Strict => return Err(FsError::DirectoryNotEmpty(path.to_string())),
                RmdirPolicy::Recursive => self.remove_children(path, &dir_key).await?,
            }
        }

        if has_marker {
            self.store.delete(&dir_key).await?;
        }
        debug!("rmdir: removed {}", path);
        Ok(())
    }

    async fn remove_children(&self, path: &str, dir_key: &str) -> Result<()> {
        let listing = self.store.list(dir_key, None, None).await?;
        let mut removed = 0;
        for object in listing.objects.iter().filter(|o| o.key != dir_key) {
            match self.store.delete(&object.key).await {
                Ok(()) => removed += 1,
                Err(StorageError::NotFound(_)) => {}
                Err(e) => {
                    warn!("rmdir: recursive delete of {} stopped at {}", path, object.key);
                    return Err(e.into());
                }
            }
        }
        info!("rmdir: recursively deleted {} objects under {}", removed, path);
        Ok(())
    }
}
