//! 租户读写锁注册表：同一租户的写操作互斥，不同租户互不阻塞。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time;
use tracing::debug;

/// 共享锁守卫，drop 时释放。
pub type TenantReadGuard = OwnedRwLockReadGuard<()>;
/// 独占锁守卫，drop 时释放。
pub type TenantWriteGuard = OwnedRwLockWriteGuard<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timed out waiting for tenant lock")]
pub struct LockTimeout;

/// Hands out one reader/writer lock per tenant id, created on first use.
///
/// The map itself sits behind a single coarse mutex that is only held for
/// the lookup-or-insert; it is released before the caller waits on the
/// tenant lock. Entries are never evicted, so memory grows with the number
/// of distinct tenants seen by the process.
///
/// Acquisition returns an owned guard. Releasing is dropping the guard, so
/// the same mode that was acquired is the one released, on every exit path.
#[derive(Debug, Default)]
pub struct TenantLocks {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, tenant: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        if let Some(lock) = locks.get(tenant) {
            return lock.clone();
        }
        let lock = Arc::new(RwLock::new(()));
        locks.insert(tenant.to_owned(), lock.clone());
        debug!(tenant, tenants = locks.len(), "registered tenant lock");
        lock
    }

    /// 获取共享锁，等待期间只会被同一租户的写者阻塞。
    pub async fn read(&self, tenant: &str) -> TenantReadGuard {
        self.lock_for(tenant).await.read_owned().await
    }

    /// 获取独占锁，等待同一租户的所有读者与写者离开。
    pub async fn write(&self, tenant: &str) -> TenantWriteGuard {
        self.lock_for(tenant).await.write_owned().await
    }

    /// 在超时时间内获取共享锁，超时返回 `LockTimeout` 且不持有任何锁。
    pub async fn read_with_timeout(
        &self,
        tenant: &str,
        timeout: Duration,
    ) -> Result<TenantReadGuard, LockTimeout> {
        time::timeout(timeout, self.read(tenant))
            .await
            .map_err(|_| LockTimeout)
    }

    /// 在超时时间内获取独占锁。
    pub async fn write_with_timeout(
        &self,
        tenant: &str,
        timeout: Duration,
    ) -> Result<TenantWriteGuard, LockTimeout> {
        time::timeout(timeout, self.write(tenant))
            .await
            .map_err(|_| LockTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    const PROMPT: Duration = Duration::from_secs(2);

    /// 读后让出再写回：只有在互斥下才能保证不丢失更新。
    async fn racy_increment(locks: &TenantLocks, tenant: &str, counter: &AtomicUsize) {
        let _guard = locks.write(tenant).await;
        let current = counter.load(Ordering::SeqCst);
        tokio::task::yield_now().await;
        counter.store(current + 1, Ordering::SeqCst);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn other_tenant_is_not_blocked_by_writer() {
        let locks = Arc::new(TenantLocks::new());
        let _held = locks.write("user1").await;

        let other = locks.clone();
        let acquired = tokio::spawn(async move {
            let writer = other.write_with_timeout("user2", PROMPT).await?;
            drop(writer);
            other.read_with_timeout("user2", PROMPT).await.map(drop)
        })
        .await
        .expect("join");
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn same_tenant_writer_blocks_until_release() {
        let locks = TenantLocks::new();
        let held = locks.write("user1").await;
        assert_eq!(
            locks
                .write_with_timeout("user1", Duration::from_millis(50))
                .await
                .err(),
            Some(LockTimeout)
        );
        assert!(
            locks
                .read_with_timeout("user1", Duration::from_millis(50))
                .await
                .is_err()
        );
        drop(held);
        assert!(locks.write_with_timeout("user1", PROMPT).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_are_mutually_exclusive() {
        let locks = Arc::new(TenantLocks::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let tasks = (0..100).map(|_| {
            let locks = locks.clone();
            let counter = counter.clone();
            tokio::spawn(async move { racy_increment(&locks, "user1", &counter).await })
        });
        for result in join_all(tasks).await {
            result.expect("join");
        }

        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_hold_the_lock_simultaneously() {
        let locks = Arc::new(TenantLocks::new());
        let barrier = Arc::new(Barrier::new(10));

        let tasks = (0..10).map(|_| {
            let locks = locks.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                let _guard = locks.read("user1").await;
                // 只有十个读者同时持锁，屏障才会放行
                barrier.wait().await;
            })
        });
        let all = time::timeout(PROMPT, join_all(tasks)).await;
        assert!(all.is_ok(), "readers were serialized");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_access_shares_one_lock() {
        let locks = Arc::new(TenantLocks::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let tasks = (0..50).map(|_| {
            let locks = locks.clone();
            let counter = counter.clone();
            tokio::spawn(async move { racy_increment(&locks, "fresh-tenant", &counter).await })
        });
        for result in join_all(tasks).await {
            result.expect("join");
        }

        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert_eq!(locks.locks.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn lookup_returns_the_same_instance() {
        let locks = TenantLocks::new();
        let first = locks.lock_for("user1").await;
        let second = locks.lock_for("user1").await;
        let other = locks.lock_for("user2").await;
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn timed_out_acquire_leaves_nothing_held() {
        let locks = TenantLocks::new();
        let reader = locks.read("user1").await;
        assert!(
            locks
                .write_with_timeout("user1", Duration::from_millis(20))
                .await
                .is_err()
        );
        drop(reader);
        assert!(locks.write_with_timeout("user1", PROMPT).await.is_ok());
    }
}
