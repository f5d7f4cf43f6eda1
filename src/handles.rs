use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, info};

/// 打开文件的状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    pub path: String,
    pub flags: i32,
}

/// 文件句柄表
///
/// 由 `ObjectFs` 持有，挂载开始时创建，`shutdown` 时清空。
/// 所有修改都在同一把锁内完成，且锁从不跨越 await。
#[derive(Debug)]
pub struct HandleTable {
    handles: RwLock<HashMap<u64, OpenFile>>,
    /// 句柄号单调递增，进程内不复用
    next_id: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 分配新句柄并登记，不检查路径是否存在。
    pub fn open(&self, path: &str, flags: i32) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        handles.insert(
            id,
            OpenFile {
                path: path.to_string(),
                flags,
            },
        );
        debug!("handle opened: fh={}, path={}, flags={:#o}", id, path, flags);
        id
    }

    /// 释放句柄。重复释放不报错。
    pub fn release(&self, id: u64) {
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        match handles.remove(&id) {
            Some(file) => debug!("handle released: fh={}, path={}", id, file.path),
            None => debug!("handle release ignored, fh={} not open", id),
        }
    }

    pub fn get(&self, id: u64) -> Option<OpenFile> {
        let handles = self.handles.read().unwrap_or_else(PoisonError::into_inner);
        handles.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空句柄表，返回清理前仍打开的句柄数。
    pub fn clear(&self) -> usize {
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        let count = handles.len();
        handles.clear();
        info!("handle table cleared: {} handles still open", count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_open_release() {
        let table = HandleTable::new();
        let fh = table.open("/a.txt", libc::O_RDONLY);
        assert_eq!(
            table.get(fh),
            Some(OpenFile {
                path: "/a.txt".to_string(),
                flags: libc::O_RDONLY
            })
        );

        table.release(fh);
        assert_eq!(table.get(fh), None);

        // 重复释放
        table.release(fh);
        assert!(table.is_empty());
    }

    #[test]
    fn test_ids_not_reused() {
        let table = HandleTable::new();
        let first = table.open("/a", 0);
        table.release(first);
        let second = table.open("/a", 0);
        assert!(second > first);
    }

    #[test]
    fn test_concurrent_open() {
        let table = Arc::new(HandleTable::new());
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    (0..100)
                        .map(|_| table.open(&format!("/f{}", i), 0))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u64> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 800);
        assert_eq!(table.len(), 800);
        assert_eq!(table.clear(), 800);
    }
}
