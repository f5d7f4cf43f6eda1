//! 合成的 POSIX 属性。
//!
//! 对象存储里没有 inode，属性在每次查询时由对象描述信息即时生成。

use std::time::SystemTime;

use crate::storage::ObjectMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    RegularFile,
}

/// 路径解析的结果。目录不是实体，只是键前缀的涌现属性。
#[derive(Debug, Clone, PartialEq)]
pub enum PathNode {
    Root,
    /// `marker` 为目录标记对象；仅由子对象隐含的目录没有标记。
    Directory { marker: Option<ObjectMeta> },
    RegularFile(ObjectMeta),
}

impl PathNode {
    pub fn kind(&self) -> NodeKind {
        match self {
            PathNode::Root | PathNode::Directory { .. } => NodeKind::Directory,
            PathNode::RegularFile(_) => NodeKind::RegularFile,
        }
    }
}

/// 固定的权限位和所有者，来自挂载配置。
#[derive(Debug, Clone, Copy)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
    pub file_mode: u16,
    pub dir_mode: u16,
}

impl Ownership {
    pub fn current_process(file_mode: u16, dir_mode: u16) -> Self {
        Self {
            uid: rustix::process::getuid().as_raw(),
            gid: rustix::process::getgid().as_raw(),
            file_mode,
            dir_mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attributes {
    pub kind: NodeKind,
    pub perm: u16,
    pub nlink: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
}

impl Attributes {
    /// 目录属性：链接数 2，大小 0。目录没有自己的时间戳，使用给定时间（挂载时间）。
    pub fn directory(owner: &Ownership, time: SystemTime) -> Self {
        Self {
            kind: NodeKind::Directory,
            perm: owner.dir_mode,
            nlink: 2,
            size: 0,
            uid: owner.uid,
            gid: owner.gid,
            created: time,
            modified: time,
            accessed: time,
        }
    }

    pub fn file(owner: &Ownership, meta: &ObjectMeta) -> Self {
        let modified = SystemTime::from(meta.modified_at);
        Self {
            kind: NodeKind::RegularFile,
            perm: owner.file_mode,
            nlink: 1,
            size: meta.size,
            uid: owner.uid,
            gid: owner.gid,
            created: SystemTime::from(meta.created_at),
            modified,
            accessed: modified,
        }
    }

    /// 有标记对象的目录使用标记的时间戳，其余目录使用 `dir_time`。
    pub fn from_node(node: &PathNode, owner: &Ownership, dir_time: SystemTime) -> Self {
        match node {
            PathNode::RegularFile(meta) => Self::file(owner, meta),
            PathNode::Directory { marker: Some(meta) } => {
                let mut attr = Self::directory(owner, SystemTime::from(meta.modified_at));
                attr.created = SystemTime::from(meta.created_at);
                attr
            }
            PathNode::Root | PathNode::Directory { marker: None } => {
                Self::directory(owner, dir_time)
            }
        }
    }

    /// 完整的 `st_mode`，包含类型位。
    pub fn mode(&self) -> u32 {
        let type_bits = match self.kind {
            NodeKind::Directory => libc::S_IFDIR,
            NodeKind::RegularFile => libc::S_IFREG,
        };
        type_bits as u32 | self.perm as u32
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn owner() -> Ownership {
        Ownership {
            uid: 1000,
            gid: 1000,
            file_mode: 0o644,
            dir_mode: 0o755,
        }
    }

    #[test]
    fn test_file_attributes() {
        let meta = ObjectMeta {
            key: "a.txt".to_string(),
            size: 42,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            modified_at: Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
            metadata: HashMap::new(),
        };
        let attr = Attributes::file(&owner(), &meta);
        assert_eq!(attr.kind, NodeKind::RegularFile);
        assert_eq!(attr.size, 42);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.mode(), libc::S_IFREG as u32 | 0o644);
        assert_eq!(
            attr.modified
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap()
                .as_secs(),
            1_700_000_100
        );
    }

    #[test]
    fn test_directory_attributes() {
        let attr = Attributes::from_node(&PathNode::Root, &owner(), SystemTime::UNIX_EPOCH);
        assert!(attr.is_dir());
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.size, 0);
        assert_eq!(attr.mode(), libc::S_IFDIR as u32 | 0o755);
    }
}
