use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::{split_keys, Listing, ObjectMeta, ObjectStore, StorageError, StorageObject, StorageResult};

/// 进程内对象存储，键按字典序保存以便前缀列举。
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, StorageObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: &str, content: Vec<u8>, metadata: HashMap<String, String>) -> ObjectMeta {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let created_at = objects.get(key).map(|o| o.meta.created_at).unwrap_or(now);
        let meta = ObjectMeta {
            key: key.to_string(),
            size: content.len() as u64,
            created_at,
            modified_at: now,
            metadata,
        };
        objects.insert(
            key.to_string(),
            StorageObject {
                meta: meta.clone(),
                content,
            },
        );
        meta
    }
}

#[async_trait]
impl ObjectStore for MemoryStorage {
    async fn get(&self, key: &str) -> StorageResult<StorageObject> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects
            .get(key)
            .map(|o| o.meta.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(
        &self,
        key: &str,
        content: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> StorageResult<ObjectMeta> {
        debug!("memory put: key={}, size={}", key, content.len());
        Ok(self.insert(key, content, metadata))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        match objects.remove(key) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(key.to_string())),
        }
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<char>,
        limit: Option<usize>,
    ) -> StorageResult<Listing> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let keys = objects
            .range(prefix.to_string()..)
            .map(|(k, _)| k.as_str())
            .take_while(|k| k.starts_with(prefix));
        let (object_keys, common_prefixes) = split_keys(keys, prefix, delimiter, limit);
        let objects = object_keys
            .iter()
            .filter_map(|k| objects.get(k).map(|o| o.meta.clone()))
            .collect();
        Ok(Listing {
            objects,
            common_prefixes,
        })
    }

    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()> {
        let source = self.get(src).await?;
        self.insert(dst, source.content, source.meta.metadata);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStorage::new();
        store.put("a.txt", b"hello".to_vec(), HashMap::new()).await.unwrap();

        let obj = store.get("a.txt").await.unwrap();
        assert_eq!(obj.content, b"hello");
        assert_eq!(obj.meta.size, 5);

        store.delete("a.txt").await.unwrap();
        assert!(matches!(store.get("a.txt").await, Err(StorageError::NotFound(_))));
        assert!(matches!(store.delete("a.txt").await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_overwrite_keeps_created_at() {
        let store = MemoryStorage::new();
        let first = store.put("a", b"1".to_vec(), HashMap::new()).await.unwrap();
        let second = store.put("a", b"22".to_vec(), HashMap::new()).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.size, 2);
    }

    #[tokio::test]
    async fn test_list_with_delimiter() {
        let store = MemoryStorage::new();
        for key in ["x/", "x/y.txt", "x/z/", "x/z/w.txt", "xy.txt"] {
            store.put(key, Vec::new(), HashMap::new()).await.unwrap();
        }

        let listing = store.list("x/", Some('/'), None).await.unwrap();
        let keys: Vec<_> = listing.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["x/", "x/y.txt"]);
        assert_eq!(listing.common_prefixes, vec!["x/z/"]);
    }

    #[tokio::test]
    async fn test_copy_carries_metadata() {
        let store = MemoryStorage::new();
        let mut metadata = HashMap::new();
        metadata.insert("owner".to_string(), "alice".to_string());
        store.put("src", b"data".to_vec(), metadata).await.unwrap();

        store.copy("src", "dst").await.unwrap();
        let dst = store.get("dst").await.unwrap();
        assert_eq!(dst.content, b"data");
        assert_eq!(dst.meta.metadata.get("owner").map(String::as_str), Some("alice"));
        assert!(store.get("src").await.is_ok());

        assert!(matches!(store.copy("missing", "x").await, Err(StorageError::NotFound(_))));
    }
}
