use std::collections::HashMap;
use std::ffi::OsStr;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request,
    TimeOrNow, FUSE_ROOT_ID,
};
use libc::{c_int, EINVAL, ENOENT, ERANGE};
use tokio::runtime::Handle;
use tracing::{debug, error, info};

use crate::error::FsError;
use crate::fs::ObjectFs;
use crate::key;
use crate::posix::{Attributes, NodeKind};

#[derive(Debug)]
struct Inode {
    path: String,
    /// 内核持有的引用数：每次 entry/created 应答加一，forget 时减去
    lookups: u64,
}

/// inode 号与路径的双向映射。inode 号只增不减。
///
/// 只记录内核持有引用的路径，引用数归零时移除，表的大小随内核缓存而不是桶的大小增长。
#[derive(Debug)]
struct InodeTable {
    path_to_ino: HashMap<String, u64>,
    inodes: HashMap<u64, Inode>,
    next_ino: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            path_to_ino: HashMap::new(),
            inodes: HashMap::new(),
            next_ino: FUSE_ROOT_ID + 1,
        };
        table.path_to_ino.insert("/".to_string(), FUSE_ROOT_ID);
        table.inodes.insert(
            FUSE_ROOT_ID,
            Inode {
                path: "/".to_string(),
                lookups: 1,
            },
        );
        table
    }

    fn path(&self, ino: u64) -> Option<&str> {
        self.inodes
            .get(&ino)
            .map(|inode| inode.path.as_str())
            .filter(|path| !path.is_empty())
    }

    fn ino(&self, path: &str) -> Option<u64> {
        self.path_to_ino.get(path).copied()
    }

    /// 为即将在 entry/created 应答中返回的路径取 inode 号，并记一次引用。
    fn lookup(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.ino(path) {
            if let Some(inode) = self.inodes.get_mut(&ino) {
                inode.lookups += 1;
            }
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.path_to_ino.insert(path.to_string(), ino);
        self.inodes.insert(
            ino,
            Inode {
                path: path.to_string(),
                lookups: 1,
            },
        );
        debug!("allocate_ino: new ino={} for path={}", ino, path);
        ino
    }

    /// readdir 用的 inode 号：已知路径沿用原号，否则给一个不登记的新号。
    fn peek(&mut self, path: &str) -> u64 {
        self.ino(path).unwrap_or_else(|| {
            let ino = self.next_ino;
            self.next_ino += 1;
            ino
        })
    }

    /// 内核释放 `nlookup` 个引用，归零时移除。根目录永不移除。
    fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        let Some(inode) = self.inodes.get_mut(&ino) else {
            return;
        };
        inode.lookups = inode.lookups.saturating_sub(nlookup);
        if inode.lookups == 0 {
            if let Some(inode) = self.inodes.remove(&ino) {
                if self.path_to_ino.get(&inode.path) == Some(&ino) {
                    self.path_to_ino.remove(&inode.path);
                }
                debug!("forget: ino={} path={}", ino, inode.path);
            }
        }
    }

    /// 路径已被删除：解除路径映射。inode 条目保留到内核 forget，之后的请求返回 ENOENT。
    fn unlink(&mut self, path: &str) {
        if let Some(ino) = self.path_to_ino.remove(path) {
            if let Some(inode) = self.inodes.get_mut(&ino) {
                inode.path.clear();
            }
        }
    }

    /// 重命名后更新 `old` 及其下所有已知路径，inode 号保持不变。
    fn rename(&mut self, old: &str, new: &str) {
        self.unlink(new);
        let old_dir = format!("{}/", old);
        let moved: Vec<(String, u64)> = self
            .path_to_ino
            .iter()
            .filter(|(p, _)| p.as_str() == old || p.starts_with(&old_dir))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (path, ino) in moved {
            let renamed = format!("{}{}", new, &path[old.len()..]);
            self.path_to_ino.remove(&path);
            self.path_to_ino.insert(renamed.clone(), ino);
            if let Some(inode) = self.inodes.get_mut(&ino) {
                inode.path = renamed;
            }
        }
    }
}

fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::RegularFile => FileType::RegularFile,
    }
}

fn reply_errno(op: &str, path: &str, err: &FsError) -> c_int {
    match err {
        FsError::NoSuchEntry(_) | FsError::NoData(_) => debug!("{}: {}: {}", op, path, err),
        _ => error!("{} error for path={}: {}", op, path, err),
    }
    err.errno()
}

/// 内核 FUSE 请求到 `ObjectFs` 的分派。
///
/// fuser 在自己的线程里同步回调，这里借用 tokio 运行时的 handle 阻塞等待异步操作。
pub struct FuseAdapter {
    fs: Arc<ObjectFs>,
    runtime: Handle,
    inodes: InodeTable,
    ttl: Duration,
}

impl FuseAdapter {
    pub fn new(fs: Arc<ObjectFs>, runtime: Handle) -> Self {
        let ttl = fs.config().attr_ttl();
        Self {
            fs,
            runtime,
            inodes: InodeTable::new(),
            ttl,
        }
    }

    pub fn mount_options(&self, fs_name: &str) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(fs_name.to_string()),
            MountOption::DefaultPermissions,
        ];
        if self.fs.config().allow_other {
            options.push(MountOption::AllowOther);
        }
        options
    }

    /// 后台挂载，返回的 session 被 drop 时自动卸载。
    pub fn spawn_mount(
        self,
        mount_point: &Path,
        fs_name: &str,
    ) -> std::io::Result<fuser::BackgroundSession> {
        let options = self.mount_options(fs_name);
        info!("Mounting FUSE filesystem at {:?}", mount_point);
        fuser::spawn_mount2(self, mount_point, &options)
    }

    fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.runtime.block_on(f)
    }

    fn path_of(&self, ino: u64) -> Result<String, c_int> {
        self.inodes.path(ino).map(str::to_string).ok_or_else(|| {
            error!("failed to get path for ino={}", ino);
            ENOENT
        })
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let name = name.to_str().ok_or(EINVAL)?;
        let parent = self.path_of(parent)?;
        Ok(key::join(&parent, name))
    }

    fn make_file_attr(&self, ino: u64, attr: &Attributes) -> FileAttr {
        FileAttr {
            ino,
            size: attr.size,
            blocks: (attr.size + 511) / 512,
            atime: attr.accessed,
            mtime: attr.modified,
            ctime: attr.modified,
            crtime: attr.created,
            kind: file_type(attr.kind),
            perm: attr.perm,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: 0,
            flags: 0,
            blksize: 512,
        }
    }

    fn reply_xattr(data: &[u8], size: u32, reply: ReplyXattr) {
        if size == 0 {
            reply.size(data.len() as u32);
        } else if data.len() > size as usize {
            reply.error(ERANGE);
        } else {
            reply.data(data);
        }
    }
}

impl Filesystem for FuseAdapter {
    fn destroy(&mut self) {
        let leaked = self.fs.shutdown();
        info!("filesystem destroyed, {} handles were still open", leaked);
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.block_on(self.fs.getattr(&path)) {
            Ok(attr) => {
                let ino = self.inodes.lookup(&path);
                reply.entry(&self.ttl, &self.make_file_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(reply_errno("lookup", &path, &e)),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.block_on(self.fs.getattr(&path)) {
            Ok(attr) => reply.attr(&self.ttl, &self.make_file_attr(ino, &attr)),
            Err(e) => reply.error(reply_errno("getattr", &path, &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        // 只支持改变大小；权限、所有者、时间戳是固定的
        let result = match size {
            Some(size) => self.block_on(self.fs.truncate(&path, size)),
            None => self.block_on(self.fs.getattr(&path)),
        };
        match result {
            Ok(attr) => reply.attr(&self.ttl, &self.make_file_attr(ino, &attr)),
            Err(e) => reply.error(reply_errno("setattr", &path, &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        debug!("mkdir: {}, mode={:o}", path, mode);
        let result = self.block_on(async {
            self.fs.mkdir(&path).await?;
            self.fs.getattr(&path).await
        });
        match result {
            Ok(attr) => {
                let ino = self.inodes.lookup(&path);
                reply.entry(&self.ttl, &self.make_file_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(reply_errno("mkdir", &path, &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.block_on(self.fs.rmdir(&path)) {
            Ok(()) => {
                self.inodes.unlink(&path);
                reply.ok();
            }
            Err(e) => reply.error(reply_errno("rmdir", &path, &e)),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.block_on(self.fs.opendir(&path)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(reply_errno("opendir", &path, &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let listing = match self.block_on(self.fs.readdir(&path)) {
            Ok(listing) => listing,
            Err(e) => return reply.error(reply_errno("readdir", &path, &e)),
        };

        let parent_ino = self.inodes.ino(parent_path(&path)).unwrap_or(FUSE_ROOT_ID);
        for (i, entry) in listing.entries.iter().enumerate().skip(offset as usize) {
            let entry_ino = match entry.name.as_str() {
                "." => ino,
                ".." => parent_ino,
                name => self.inodes.peek(&key::join(&path, name)),
            };
            if reply.add(entry_ino, (i + 1) as i64, file_type(entry.kind), &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let fh = self.fs.open(&path, flags);
        reply.opened(fh, 0);
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.block_on(self.fs.create(&path, mode)) {
            Ok((fh, attr)) => {
                let ino = self.inodes.lookup(&path);
                reply.created(&self.ttl, &self.make_file_attr(ino, &attr), 0, fh, flags as u32);
            }
            Err(e) => reply.error(reply_errno("create", &path, &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(EINVAL);
        };
        match self.block_on(self.fs.read(&path, size as usize, offset)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(reply_errno("read", &path, &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(EINVAL);
        };
        match self.block_on(self.fs.write(&path, data, offset)) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(reply_errno("write", &path, &e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.fs.release(fh);
        reply.ok();
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.block_on(self.fs.unlink(&path)) {
            Ok(()) => {
                self.inodes.unlink(&path);
                reply.ok();
            }
            Err(e) => reply.error(reply_errno("unlink", &path, &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (old, new) = match (self.child_path(parent, name), self.child_path(newparent, newname)) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(e), _) | (_, Err(e)) => return reply.error(e),
        };
        match self.block_on(self.fs.rename(&old, &new)) {
            Ok(()) => {
                self.inodes.rename(&old, &new);
                reply.ok();
            }
            Err(e) => reply.error(reply_errno("rename", &old, &e)),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let Some(name) = name.to_str() else {
            return reply.error(EINVAL);
        };
        match self.block_on(self.fs.getxattr(&path, name)) {
            Ok(value) => Self::reply_xattr(value.as_bytes(), size, reply),
            Err(e) => reply.error(reply_errno("getxattr", &path, &e)),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.block_on(self.fs.listxattr(&path)) {
            Ok(names) => {
                let mut data = Vec::new();
                for name in names {
                    data.extend_from_slice(name.as_bytes());
                    data.push(0);
                }
                Self::reply_xattr(&data, size, reply);
            }
            Err(e) => reply.error(reply_errno("listxattr", &path, &e)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        // 对象元数据只能保存字符串
        let (Some(name), Ok(value)) = (name.to_str(), std::str::from_utf8(value)) else {
            return reply.error(EINVAL);
        };
        match self.block_on(self.fs.setxattr(&path, name, value)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_errno("setxattr", &path, &e)),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let Some(name) = name.to_str() else {
            return reply.error(EINVAL);
        };
        match self.block_on(self.fs.removexattr(&path, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_errno("removexattr", &path, &e)),
        }
    }
}
