use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};

/// `rmdir` 遇到非空目录时的行为。递归删除必须显式配置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RmdirPolicy {
    #[default]
    Strict,
    Recursive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub file_mode: u16,
    pub dir_mode: u16,
    pub attr_ttl_secs: u64,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub rmdir_policy: RmdirPolicy,
    /// 同一进程内对同一对象的读-改-写串行化
    pub serialize_writes: bool,
    pub allow_other: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            file_mode: 0o644,
            dir_mode: 0o755,
            attr_ttl_secs: 1,
            uid: None,
            gid: None,
            rmdir_policy: RmdirPolicy::Strict,
            serialize_writes: true,
            allow_other: false,
        }
    }
}

impl MountConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .map_err(|e| FsError::Io(format!("reading config {:?}: {}", path, e)))?;
        serde_json::from_slice(&raw)
            .map_err(|e| FsError::InvalidArgument(format!("config {:?}: {}", path, e)))
    }

    pub fn with_rmdir_policy(mut self, policy: RmdirPolicy) -> Self {
        self.rmdir_policy = policy;
        self
    }

    pub fn with_serialize_writes(mut self, enabled: bool) -> Self {
        self.serialize_writes = enabled;
        self
    }

    pub fn attr_ttl(&self) -> Duration {
        Duration::from_secs(self.attr_ttl_secs)
    }
}
