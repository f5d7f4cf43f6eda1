use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{split_keys, Listing, ObjectMeta, ObjectStore, StorageError, StorageObject, StorageResult};

const OBJECTS_DIR: &str = "objects";
const META_DIR: &str = "meta";
const TMP_DIR: &str = "tmp";

/// 基于本地目录的对象存储。
///
/// 文件名取键的 SHA-256：`objects/ab/cdef...` 存内容，`meta/ab/cdef....json` 存描述，
/// 因此文件名长度固定，与键的长度和字符无关。键本身记录在描述文件里。
/// 描述文件存在即代表对象存在：写入时先内容后描述，删除时先描述后内容。
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

/// 键在 `root` 下的分片路径。
fn digest_path(root: PathBuf, key: &str, suffix: &str) -> PathBuf {
    let hash = hex::encode(Sha256::digest(key.as_bytes()));
    let mut path = root;
    path.push(&hash[..2]);
    path.push(format!("{}{}", &hash[2..], suffix));
    path
}

impl LocalStorage {
    pub async fn open(base_path: PathBuf) -> StorageResult<Self> {
        for dir in [OBJECTS_DIR, META_DIR, TMP_DIR] {
            tokio::fs::create_dir_all(base_path.join(dir)).await?;
        }
        debug!("opened local object store at {:?}", base_path);
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn object_path(&self, key: &str) -> PathBuf {
        digest_path(self.base_path.join(OBJECTS_DIR), key, "")
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        digest_path(self.base_path.join(META_DIR), key, ".json")
    }

    /// 先写临时文件再 rename，保证读者看不到半写的文件。
    async fn write_atomic(&self, target: &Path, data: &[u8]) -> StorageResult<()> {
        if let Some(shard) = target.parent() {
            tokio::fs::create_dir_all(shard).await?;
        }
        let tmp = self.base_path.join(TMP_DIR).join(Uuid::new_v4().to_string());
        tokio::fs::write(&tmp, data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, target).await {
            error!("local store: rename {:?} -> {:?} failed: {:?}", tmp, target, e);
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_record(path: &Path, key: &str) -> StorageResult<ObjectMeta> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw).map_err(|e| StorageError::Corrupt(format!("{:?}: {}", path, e)))
    }

    /// 描述文件里的大小可能过期，以内容文件的实际长度为准。
    async fn with_content_size(&self, mut meta: ObjectMeta) -> StorageResult<ObjectMeta> {
        meta.size = match tokio::fs::metadata(self.object_path(&meta.key)).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::Corrupt(format!("{}: content file missing", meta.key)))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(meta)
    }

    async fn read_meta(&self, key: &str) -> StorageResult<ObjectMeta> {
        let meta = Self::read_record(&self.meta_path(key), key).await?;
        if meta.key != key {
            return Err(StorageError::Corrupt(format!(
                "{}: record belongs to {}",
                key, meta.key
            )));
        }
        self.with_content_size(meta).await
    }

    /// 读出 `meta/` 下所有键以 `prefix` 开头的描述记录，按键排序。
    async fn scan_records(&self, prefix: &str) -> StorageResult<BTreeMap<String, ObjectMeta>> {
        let mut records = BTreeMap::new();
        let mut shards = tokio::fs::read_dir(self.base_path.join(META_DIR)).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = match tokio::fs::read_dir(shard.path()).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                match Self::read_record(&path, "").await {
                    Ok(meta) if meta.key.starts_with(prefix) => {
                        records.insert(meta.key.clone(), meta);
                    }
                    Ok(_) => {}
                    // 列举与删除并发时记录可能已经消失
                    Err(StorageError::NotFound(_)) => {}
                    Err(StorageError::Corrupt(msg)) => {
                        warn!("local store: skipping unreadable record {}", msg)
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(records)
    }

    async fn write_object(
        &self,
        key: &str,
        content: &[u8],
        metadata: HashMap<String, String>,
    ) -> StorageResult<ObjectMeta> {
        if key.is_empty() {
            return Err(StorageError::Backend("empty object key".to_string()));
        }
        let now = Utc::now();
        let created_at = match self.read_meta(key).await {
            Ok(existing) => existing.created_at,
            Err(StorageError::NotFound(_)) | Err(StorageError::Corrupt(_)) => now,
            Err(e) => return Err(e),
        };
        let meta = ObjectMeta {
            key: key.to_string(),
            size: content.len() as u64,
            created_at,
            modified_at: now,
            metadata,
        };
        let record = serde_json::to_vec_pretty(&meta)
            .map_err(|e| StorageError::Corrupt(format!("{}: {}", key, e)))?;

        self.write_atomic(&self.object_path(key), content).await?;
        self.write_atomic(&self.meta_path(key), &record).await?;
        Ok(meta)
    }
}

#[async_trait]
impl ObjectStore for LocalStorage {
    async fn get(&self, key: &str) -> StorageResult<StorageObject> {
        let meta = self.read_meta(key).await?;
        let content = match tokio::fs::read(self.object_path(key)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let meta = ObjectMeta {
            size: content.len() as u64,
            ..meta
        };
        Ok(StorageObject { meta, content })
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.read_meta(key).await
    }

    async fn put(
        &self,
        key: &str,
        content: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> StorageResult<ObjectMeta> {
        debug!("local put: key={}, size={}", key, content.len());
        self.write_object(key, &content, metadata).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        match tokio::fs::remove_file(self.meta_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        match tokio::fs::remove_file(self.object_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<char>,
        limit: Option<usize>,
    ) -> StorageResult<Listing> {
        let mut records = self.scan_records(prefix).await?;
        let (object_keys, common_prefixes) =
            split_keys(records.keys().map(String::as_str), prefix, delimiter, limit);

        let mut objects = Vec::with_capacity(object_keys.len());
        for key in object_keys {
            let Some(meta) = records.remove(&key) else {
                continue;
            };
            match self.with_content_size(meta).await {
                Ok(meta) => objects.push(meta),
                Err(StorageError::Corrupt(msg)) => {
                    warn!("local store: skipping {}", msg)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Listing {
            objects,
            common_prefixes,
        })
    }

    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()> {
        let source = self.get(src).await?;
        self.write_object(dst, &source.content, source.meta.metadata)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_digest_path_is_fixed_length() {
        let short = digest_path(PathBuf::from("/s"), "a", ".json");
        let long_key = format!("{}/f.txt", ["segment"; 80].join("/"));
        let long = digest_path(PathBuf::from("/s"), &long_key, ".json");
        assert_eq!(short.as_os_str().len(), long.as_os_str().len());
        assert_ne!(short, long);
        assert_eq!(short.parent().unwrap().file_name().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_local_put_get_list() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStorage::open(temp_dir.path().to_path_buf()).await.unwrap();

        store.put("x/", Vec::new(), HashMap::new()).await.unwrap();
        store.put("x/y.txt", b"hello".to_vec(), HashMap::new()).await.unwrap();
        store.put("x/z/w.txt", b"deep".to_vec(), HashMap::new()).await.unwrap();

        let obj = store.get("x/y.txt").await.unwrap();
        assert_eq!(obj.content, b"hello");
        assert_eq!(store.head("x/y.txt").await.unwrap().size, 5);

        let listing = store.list("x/", Some('/'), None).await.unwrap();
        let keys: Vec<_> = listing.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["x/", "x/y.txt"]);
        assert_eq!(listing.common_prefixes, vec!["x/z/"]);
    }

    #[tokio::test]
    async fn test_local_delete_and_copy() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStorage::open(temp_dir.path().to_path_buf()).await.unwrap();

        let mut metadata = HashMap::new();
        metadata.insert("k".to_string(), "v".to_string());
        store.put("a", b"abc".to_vec(), metadata).await.unwrap();
        store.copy("a", "b").await.unwrap();

        let copied = store.get("b").await.unwrap();
        assert_eq!(copied.content, b"abc");
        assert_eq!(copied.meta.metadata.get("k").map(String::as_str), Some("v"));

        store.delete("a").await.unwrap();
        assert!(matches!(store.head("a").await, Err(StorageError::NotFound(_))));
        assert!(matches!(store.delete("a").await, Err(StorageError::NotFound(_))));

        // 重新打开后数据仍在
        let reopened = LocalStorage::open(temp_dir.path().to_path_buf()).await.unwrap();
        assert_eq!(reopened.get("b").await.unwrap().content, b"abc");
    }

    #[tokio::test]
    async fn test_local_long_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStorage::open(temp_dir.path().to_path_buf()).await.unwrap();

        let dir = vec!["a".repeat(60); 5].join("/");
        let key = format!("{}/f.txt", dir);
        assert!(key.len() > 300);
        store.put(&key, b"deep".to_vec(), HashMap::new()).await.unwrap();

        assert_eq!(store.get(&key).await.unwrap().content, b"deep");
        let listing = store.list(&format!("{}/", dir), Some('/'), None).await.unwrap();
        assert_eq!(listing.objects.len(), 1);
        assert_eq!(listing.objects[0].key, key);
        assert_eq!(listing.objects[0].size, 4);
    }

    #[tokio::test]
    async fn test_local_keys_with_odd_characters() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStorage::open(temp_dir.path().to_path_buf()).await.unwrap();

        for key in [".hidden", "100%/x", "a/../b", "sp ace/\u{e9}t\u{e9}"] {
            store.put(key, key.as_bytes().to_vec(), HashMap::new()).await.unwrap();
        }
        let listing = store.list("", None, None).await.unwrap();
        let keys: Vec<_> = listing.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec![".hidden", "100%/x", "a/../b", "sp ace/\u{e9}t\u{e9}"]);
    }
}
