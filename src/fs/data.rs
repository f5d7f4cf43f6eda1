//! 文件的打开、创建与读写。
//!
//! 后端没有局部更新，每次写都下载整个对象、在内存中拼接、再整体上传，
//! 带宽开销与对象大小成正比。

use std::collections::HashMap;

use tracing::debug;

use super::ObjectFs;
use crate::error::{FsError, Result};
use crate::key::{self, SEPARATOR};
use crate::posix::Attributes;
use crate::storage::StorageError;

impl ObjectFs {
    /// 登记句柄，不检查文件是否存在（留给 read/write）。
    pub fn open(&self, path: &str, flags: i32) -> u64 {
        self.handles.open(path, flags)
    }

    /// 释放句柄，重复释放同样成功。
    pub fn release(&self, fh: u64) {
        self.handles.release(fh)
    }

    /// 创建空文件并登记一个写句柄。`mode` 被忽略，权限位是固定的。
    pub async fn create(&self, path: &str, mode: u32) -> Result<(u64, Attributes)> {
        let file_key = key::to_key(path);
        if file_key.is_empty() {
            return Err(FsError::InvalidArgument(path.to_string()));
        }

        match self.store.head(&file_key).await {
            Ok(_) => return Err(FsError::AlreadyExists(path.to_string())),
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        if file_key.ends_with(SEPARATOR) {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        if self.is_dir_prefix(path).await? {
            return Err(FsError::IsADirectory(path.to_string()));
        }

        let meta = self.store.put(&file_key, Vec::new(), HashMap::new()).await?;
        let fh = self.handles.open(path, libc::O_WRONLY);
        debug!("create: {} (mode={:o}) fh={}", path, mode, fh);
        Ok((fh, Attributes::file(&self.owner, &meta)))
    }

    /// 读取 `[offset, offset+size)`，超出末尾的部分被截掉，不补零也不报错。
    pub async fn read(&self, path: &str, size: usize, offset: u64) -> Result<Vec<u8>> {
        let file_key = key::to_key(path);
        let object = self.store.get(&file_key).await?;
        let content = object.content;

        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(content.len());
        let end = start.saturating_add(size).min(content.len());
        debug!("read: {} offset={} size={} -> {} bytes", path, offset, size, end - start);
        Ok(content[start..end].to_vec())
    }

    /// 把 `data` 拼接进对象的 `offset` 处并整体重新上传，返回写入的字节数。
    ///
    /// 对象不存在时视为空，但路径是已有目录时返回 `IsADirectory`。`offset` 超过当前长度时数据直接追加在末尾，不会留下空洞。
    /// 启用 `serialize_writes` 时同一对象的读-改-写在本进程内串行执行；
    /// 否则并发写者可能互相覆盖（后写者胜出）。
    pub async fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<usize> {
        let file_key = key::to_key(path);
        if file_key.is_empty() || file_key.ends_with(SEPARATOR) {
            return Err(FsError::IsADirectory(path.to_string()));
        }

        let _guard = self.write_guard(&file_key).await;
        let (content, metadata) = match self.store.get(&file_key).await {
            Ok(obj) => (obj.content, obj.meta.metadata),
            Err(StorageError::NotFound(_)) => {
                if self.is_dir_prefix(path).await? {
                    return Err(FsError::IsADirectory(path.to_string()));
                }
                (Vec::new(), HashMap::new())
            }
            Err(e) => return Err(e.into()),
        };

        let updated = splice(content, data, offset);
        let size = updated.len();
        self.store.put(&file_key, updated, metadata).await?;
        debug!("write: {} offset={} len={} -> size {}", path, offset, data.len(), size);
        Ok(data.len())
    }

    /// 截断或以零扩展到 `size`，同样整体重写对象。
    pub async fn truncate(&self, path: &str, size: u64) -> Result<Attributes> {
        let file_key = key::to_key(path);
        if file_key.is_empty() || file_key.ends_with(SEPARATOR) {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        let new_len = usize::try_from(size).map_err(|_| FsError::InvalidArgument(path.to_string()))?;

        let _guard = self.write_guard(&file_key).await;
        let object = match self.store.get(&file_key).await {
            Ok(object) => object,
            Err(StorageError::NotFound(_)) => {
                if self.is_dir_prefix(path).await? {
                    return Err(FsError::IsADirectory(path.to_string()));
                }
                return Err(FsError::NoSuchEntry(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut content = object.content;
        content.resize(new_len, 0);
        let meta = self
            .store
            .put(&file_key, content, object.meta.metadata)
            .await?;
        debug!("truncate: {} -> {}", path, size);
        Ok(Attributes::file(&self.owner, &meta))
    }
}

/// `content[..offset] + data + content[offset + data.len()..]`，offset 被限制在当前长度内。
fn splice(mut content: Vec<u8>, data: &[u8], offset: u64) -> Vec<u8> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(content.len());
    let end = start.saturating_add(data.len()).min(content.len());
    content.splice(start..end, data.iter().copied());
    content
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::config::MountConfig;
    use crate::fs::tests::{new_fs, new_fs_with};
    use crate::posix::NodeKind;
    use crate::storage::{
        Listing, MemoryStorage, ObjectMeta, ObjectStore, StorageObject, StorageResult,
    };

    #[test]
    fn test_splice() {
        assert_eq!(splice(b"hello".to_vec(), b"HE", 0), b"HEllo");
        assert_eq!(splice(b"hello".to_vec(), b"LO!", 3), b"helLO!");
        assert_eq!(splice(b"hello".to_vec(), b"!", 5), b"hello!");
        assert_eq!(splice(b"hi".to_vec(), b"there", 10), b"hithere");
        assert_eq!(splice(Vec::new(), b"new", 0), b"new");
        assert_eq!(splice(b"abcdef".to_vec(), b"XY", 2), b"abXYef");
    }

    #[tokio::test]
    async fn test_create_then_getattr() {
        let (_, fs) = new_fs();
        let (fh, attr) = fs.create("/a.txt", 0o644).await.unwrap();
        assert_eq!(attr.size, 0);
        assert_eq!(fs.handles().get(fh).unwrap().flags, libc::O_WRONLY);

        let attr = fs.getattr("/a.txt").await.unwrap();
        assert_eq!(attr.kind, NodeKind::RegularFile);
        assert_eq!(attr.size, 0);
    }

    #[tokio::test]
    async fn test_create_errors() {
        let (store, fs) = new_fs();
        assert!(matches!(fs.create("/", 0o644).await, Err(FsError::InvalidArgument(_))));
        assert!(matches!(fs.create("", 0o644).await, Err(FsError::InvalidArgument(_))));

        fs.create("/a.txt", 0o644).await.unwrap();
        assert!(matches!(fs.create("/a.txt", 0o644).await, Err(FsError::AlreadyExists(_))));

        assert!(matches!(fs.create("/newdir/", 0o644).await, Err(FsError::IsADirectory(_))));

        store.put("d/child", Vec::new(), HashMap::new()).await.unwrap();
        assert!(matches!(fs.create("/d", 0o644).await, Err(FsError::IsADirectory(_))));
        // 失败的 create 不登记句柄
        assert_eq!(fs.handles().len(), 1);
    }

    #[tokio::test]
    async fn test_read_clamps() {
        let (store, fs) = new_fs();
        store.put("f", b"hello".to_vec(), HashMap::new()).await.unwrap();

        assert_eq!(fs.read("/f", 3, 1).await.unwrap(), b"ell");
        assert_eq!(fs.read("/f", 100, 2).await.unwrap(), b"llo");
        assert!(fs.read("/f", 10, 5).await.unwrap().is_empty());
        assert!(fs.read("/f", 10, 500).await.unwrap().is_empty());
        assert!(matches!(fs.read("/missing", 1, 0).await, Err(FsError::NoSuchEntry(_))));
    }

    #[tokio::test]
    async fn test_write_splices_and_keeps_metadata() {
        let (store, fs) = new_fs();
        let mut metadata = HashMap::new();
        metadata.insert("user.k".to_string(), "v".to_string());
        store.put("f", b"hello world".to_vec(), metadata).await.unwrap();

        assert_eq!(fs.write("/f", b"WORLD", 6).await.unwrap(), 5);
        let obj = store.get("f").await.unwrap();
        assert_eq!(obj.content, b"hello WORLD");
        assert_eq!(obj.meta.metadata.get("user.k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn test_write_creates_missing_object() {
        let (store, fs) = new_fs();
        assert_eq!(fs.write("/new.txt", b"abc", 0).await.unwrap(), 3);
        assert_eq!(store.get("new.txt").await.unwrap().content, b"abc");
        assert!(matches!(fs.write("/", b"x", 0).await, Err(FsError::IsADirectory(_))));
    }

    #[tokio::test]
    async fn test_truncate() {
        let (store, fs) = new_fs();
        store.put("f", b"hello".to_vec(), HashMap::new()).await.unwrap();

        assert_eq!(fs.truncate("/f", 2).await.unwrap().size, 2);
        assert_eq!(store.get("f").await.unwrap().content, b"he");

        fs.truncate("/f", 4).await.unwrap();
        assert_eq!(store.get("f").await.unwrap().content, b"he\0\0");

        assert!(matches!(fs.truncate("/missing", 0).await, Err(FsError::NoSuchEntry(_))));
    }

    #[tokio::test]
    async fn test_open_release() {
        let (_, fs) = new_fs();
        let fh = fs.open("/whatever", libc::O_RDONLY);
        assert_eq!(fs.handles().get(fh).unwrap().path, "/whatever");
        fs.release(fh);
        fs.release(fh);
        assert!(fs.handles().is_empty());
    }

    /// 读完对象后让出一次执行权，使并发写者的读-改-写交错。
    #[derive(Debug, Default)]
    struct YieldingStorage {
        inner: MemoryStorage,
    }

    #[async_trait]
    impl ObjectStore for YieldingStorage {
        async fn get(&self, key: &str) -> StorageResult<StorageObject> {
            let object = self.inner.get(key).await;
            tokio::task::yield_now().await;
            object
        }

        async fn put(
            &self,
            key: &str,
            content: Vec<u8>,
            metadata: HashMap<String, String>,
        ) -> StorageResult<ObjectMeta> {
            self.inner.put(key, content, metadata).await
        }

        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }

        async fn list(
            &self,
            prefix: &str,
            delimiter: Option<char>,
            limit: Option<usize>,
        ) -> StorageResult<Listing> {
            self.inner.list(prefix, delimiter, limit).await
        }

        async fn copy(&self, src: &str, dst: &str) -> StorageResult<()> {
            self.inner.copy(src, dst).await
        }
    }

    /// 8 个写者各改一个字节，返回最终内容。
    async fn concurrent_byte_writes(config: MountConfig) -> Vec<u8> {
        let store = Arc::new(YieldingStorage::default());
        let fs = ObjectFs::new(store.clone(), config);
        store.put("f", vec![b'.'; 8], HashMap::new()).await.unwrap();

        let writes = (0..8u8).map(|i| {
            let fs = &fs;
            async move { fs.write("/f", &[b'0' + i], i as u64).await }
        });
        for result in futures::future::join_all(writes).await {
            assert_eq!(result.unwrap(), 1);
        }
        store.get("f").await.unwrap().content
    }

    #[tokio::test]
    async fn test_concurrent_writes_serialized() {
        let content = concurrent_byte_writes(MountConfig::new()).await;
        assert_eq!(content, b"01234567");
    }

    #[tokio::test]
    async fn test_unserialized_writes_lose_updates() {
        let content =
            concurrent_byte_writes(MountConfig::new().with_serialize_writes(false)).await;
        // 所有写者读到的都是同一份旧内容，最后一次上传覆盖其余修改
        assert_ne!(content, b"01234567");
        assert_eq!(content.iter().filter(|b| **b != b'.').count(), 1);
    }

    #[tokio::test]
    async fn test_write_to_directory_rejected() {
        let (store, fs) = new_fs();
        fs.mkdir("/d").await.unwrap();
        store.put("d/child", Vec::new(), HashMap::new()).await.unwrap();

        assert!(matches!(fs.write("/d", b"oops", 0).await, Err(FsError::IsADirectory(_))));
        assert!(matches!(fs.truncate("/d", 0).await, Err(FsError::IsADirectory(_))));
        assert!(matches!(store.head("d").await, Err(StorageError::NotFound(_))));
        assert_eq!(fs.getattr("/d").await.unwrap().kind, NodeKind::Directory);

        // 只有前缀、没有标记的目录同样拒绝
        store.put("implied/x", Vec::new(), HashMap::new()).await.unwrap();
        assert!(matches!(fs.write("/implied", b"x", 0).await, Err(FsError::IsADirectory(_))));
    }

    #[tokio::test]
    async fn test_unserialized_writes_still_succeed() {
        let (_, fs) = new_fs_with(MountConfig::new().with_serialize_writes(false));
        fs.create("/f", 0o644).await.unwrap();
        assert_eq!(fs.write("/f", b"abc", 0).await.unwrap(), 3);
        assert_eq!(fs.read("/f", 3, 0).await.unwrap(), b"abc");
    }
}
