//! 对象存储后端接口。
//!
//! 后端只提供按键寻址的 get/put/delete/list/copy，不提供目录、局部写或原子重命名。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod local;
mod memory;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt object record: {0}")]
    Corrupt(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// 对象的描述信息（不含内容）。`metadata` 即扩展属性。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct StorageObject {
    pub meta: ObjectMeta,
    pub content: Vec<u8>,
}

/// 一次前缀列举的结果。
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub objects: Vec<ObjectMeta>,
    pub common_prefixes: Vec<String>,
}

impl Listing {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.common_prefixes.is_empty()
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> StorageResult<StorageObject>;

    /// 只取描述信息。默认实现会下载内容，后端应当覆盖它。
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        Ok(self.get(key).await?.meta)
    }

    /// 整体替换对象内容。覆盖已有对象时保留其创建时间。
    async fn put(
        &self,
        key: &str,
        content: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> StorageResult<ObjectMeta>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// 按前缀列举。给定 `delimiter` 时，前缀之后还含有分隔符的键被折叠为公共前缀。
    /// `limit` 同时限制对象和公共前缀的总数。
    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<char>,
        limit: Option<usize>,
    ) -> StorageResult<Listing>;

    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()>;
}

/// 把按字典序排好的键拆分为直接对象和公共前缀，两个内置后端共用。
pub(crate) fn split_keys<'a, I>(
    sorted_keys: I,
    prefix: &str,
    delimiter: Option<char>,
    limit: Option<usize>,
) -> (Vec<String>, Vec<String>)
where
    I: IntoIterator<Item = &'a str>,
{
    let mut objects = Vec::new();
    let mut prefixes: Vec<String> = Vec::new();
    let limit = limit.unwrap_or(usize::MAX);

    for key in sorted_keys {
        if objects.len() + prefixes.len() >= limit {
            break;
        }
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        match delimiter.and_then(|d| rest.find(d).map(|idx| idx + d.len_utf8())) {
            Some(end) => {
                let common = &key[..prefix.len() + end];
                if prefixes.last().map(String::as_str) != Some(common) {
                    prefixes.push(common.to_string());
                }
            }
            None => objects.push(key.to_string()),
        }
    }

    (objects, prefixes)
}
