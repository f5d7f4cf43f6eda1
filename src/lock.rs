use std::collections::HashMap;
use std::sync::{Arc, PoisonError, Weak};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// 按对象键的写锁
///
/// 对同一对象的读-改-写在持有锁期间串行执行，避免同进程内的丢失更新。
/// 注册表本身的锁只在查找/插入条目时短暂持有，不跨越任何后端调用。
/// 跨进程的写者仍然是后写者胜出。
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: std::sync::Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = locks.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        // 顺便清理已无人持有的条目
        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(Mutex::new(()));
        locks.insert(key.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// 获取 `key` 的写锁，guard 释放时解锁。
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.entry(key);
        let guard = lock.lock_owned().await;
        debug!("write lock acquired: key={}", key);
        guard
    }

    /// 当前仍被引用的锁条目数
    pub fn active(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.values().filter(|weak| weak.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serialized() {
        let locks = Arc::new(PathLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks = (0..4).map(|_| {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            async move {
                let _guard = locks.lock("a.txt").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }
        });
        futures::future::join_all(tasks).await;

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_independent() {
        let locks = PathLocks::new();
        let _a = locks.lock("a").await;
        // 持有 a 的同时可以拿到 b
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.lock("b"))
            .await
            .unwrap();
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn test_entries_dropped_after_release() {
        let locks = PathLocks::new();
        {
            let _guard = locks.lock("a").await;
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }
}
