//! 层次文件系统语义到扁平对象存储的翻译层。
//!
//! 每个操作都即时查询后端，不缓存目录树；后端错误在这里统一转换为 `FsError`。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::config::MountConfig;
use crate::error::{FsError, Result};
use crate::handles::HandleTable;
use crate::key::{self, SEPARATOR};
use crate::lock::PathLocks;
use crate::posix::{Attributes, Ownership, PathNode};
use crate::storage::{ObjectMeta, ObjectStore, StorageError};

mod data;
mod dir;
mod rename;

pub use dir::{DirEntry, DirectoryListing};

pub struct ObjectFs {
    store: Arc<dyn ObjectStore>,
    config: MountConfig,
    owner: Ownership,
    handles: HandleTable,
    locks: PathLocks,
    mounted_at: SystemTime,
}

impl std::fmt::Debug for ObjectFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectFs")
            .field("store", &self.store)
            .field("open_handles", &self.handles.len())
            .field("rmdir_policy", &self.config.rmdir_policy)
            .finish()
    }
}

impl ObjectFs {
    pub fn new(store: Arc<dyn ObjectStore>, config: MountConfig) -> Self {
        let mut owner = Ownership::current_process(config.file_mode, config.dir_mode);
        if let Some(uid) = config.uid {
            owner.uid = uid;
        }
        if let Some(gid) = config.gid {
            owner.gid = gid;
        }
        Self {
            store,
            config,
            owner,
            handles: HandleTable::new(),
            locks: PathLocks::new(),
            mounted_at: SystemTime::now(),
        }
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// 卸载时调用：清空句柄表。
    pub fn shutdown(&self) -> usize {
        self.handles.clear()
    }

    /// 启用写串行化时获取 `key` 的写锁。
    async fn write_guard(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        if self.config.serialize_writes {
            Some(self.locks.lock(key).await)
        } else {
            None
        }
    }

    /// 判断路径是根、目录、普通文件还是不存在。
    ///
    /// 先查精确的文件键，再退回前缀查询，避免把同时是别的键前缀的文件误判为目录。
    pub async fn resolve(&self, path: &str) -> Result<PathNode> {
        if key::is_root(path) {
            return Ok(PathNode::Root);
        }

        if !path.ends_with(SEPARATOR) {
            match self.store.head(&key::to_key(path)).await {
                Ok(meta) => return Ok(PathNode::RegularFile(meta)),
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let dir_key = key::to_dir_key(path);
        let listing = self.store.list(&dir_key, None, Some(1)).await?;
        match listing.objects.into_iter().next() {
            // 标记对象的键最短，若存在一定排在第一位
            Some(first) if first.key == dir_key => Ok(PathNode::Directory {
                marker: Some(first),
            }),
            Some(_) => Ok(PathNode::Directory { marker: None }),
            None => Err(FsError::NoSuchEntry(path.to_string())),
        }
    }

    /// `path` 作为目录前缀时下面是否有任何键（包括标记）。
    async fn is_dir_prefix(&self, path: &str) -> Result<bool> {
        let listing = self
            .store
            .list(&key::to_dir_key(path), None, Some(1))
            .await?;
        Ok(!listing.is_empty())
    }

    pub async fn getattr(&self, path: &str) -> Result<Attributes> {
        let node = self.resolve(path).await?;
        debug!("getattr: {} -> {:?}", path, node.kind());
        Ok(Attributes::from_node(&node, &self.owner, self.mounted_at))
    }

    /// 扩展属性所在的对象：文件本身或目录标记。根目录和无标记目录没有。
    async fn xattr_object(&self, path: &str) -> Result<Option<ObjectMeta>> {
        match self.resolve(path).await? {
            PathNode::Root => Ok(None),
            PathNode::Directory { marker } => Ok(marker),
            PathNode::RegularFile(meta) => Ok(Some(meta)),
        }
    }

    pub async fn listxattr(&self, path: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .xattr_object(path)
            .await?
            .map(|meta| meta.metadata.into_keys().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    pub async fn getxattr(&self, path: &str, name: &str) -> Result<String> {
        if key::is_root(path) {
            return Err(FsError::NoData(name.to_string()));
        }
        self.xattr_object(path)
            .await?
            .and_then(|mut meta| meta.metadata.remove(name))
            .ok_or_else(|| FsError::NoData(name.to_string()))
    }

    pub async fn setxattr(&self, path: &str, name: &str, value: &str) -> Result<()> {
        if name.is_empty() {
            return Err(FsError::InvalidArgument(path.to_string()));
        }
        self.update_metadata(path, |metadata| {
            metadata.insert(name.to_string(), value.to_string());
            Ok(())
        })
        .await
    }

    pub async fn removexattr(&self, path: &str, name: &str) -> Result<()> {
        self.update_metadata(path, |metadata| {
            metadata
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| FsError::NoData(name.to_string()))
        })
        .await
    }

    /// 修改对象元数据需要整体重写对象（内容不变）。
    /// 无标记的目录会因此生成一个标记对象。
    async fn update_metadata<F>(&self, path: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<String, String>) -> Result<()>,
    {
        let target = match self.resolve(path).await? {
            PathNode::Root => return Err(FsError::InvalidArgument(path.to_string())),
            PathNode::Directory { .. } => key::to_dir_key(path),
            PathNode::RegularFile(meta) => meta.key,
        };

        let _guard = self.write_guard(&target).await;
        let (content, mut metadata) = match self.store.get(&target).await {
            Ok(obj) => (obj.content, obj.meta.metadata),
            Err(StorageError::NotFound(_)) if target.ends_with(SEPARATOR) => {
                (Vec::new(), HashMap::new())
            }
            Err(e) => return Err(e.into()),
        };
        edit(&mut metadata)?;
        self.store.put(&target, content, metadata).await?;
        debug!("metadata updated: key={}", target);
        Ok(())
    }
}
