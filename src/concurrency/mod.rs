//! 并发控制模块
//! 按键（租户 / 集成）串行化关键区，并限制批量任务的扇出

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// 键被占用时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyStrategy {
    /// 立即返回错误，不等待
    Reject,
    /// 等待指定时间后超时返回错误
    #[default]
    Wait,
}

/// 并发错误
#[derive(Debug, thiserror::Error)]
pub enum ConcurrencyError {
    #[error("Acquire timeout for resource: {resource}")]
    AcquireTimeout { resource: String },

    #[error("Semaphore closed")]
    Closed,

    /// 拒绝策略：该键已有持有者
    #[error("Request rejected, {scope_type} {scope_value} is busy")]
    Rejected {
        scope_type: String,
        scope_value: String,
    },
}

impl ConcurrencyError {
    /// 转换为 HTTP 状态码
    pub fn http_status_code(&self) -> u16 {
        match self {
            ConcurrencyError::Rejected { .. } => 429,
            ConcurrencyError::AcquireTimeout { .. } => 504,
            ConcurrencyError::Closed => 503,
        }
    }
}

/// 键级许可，drop 时释放；最后一个持有者离开后键从锁表移除
pub struct KeyedPermit {
    key: String,
    permit: Option<OwnedSemaphorePermit>,
    locks: Arc<DashMap<String, Arc<Semaphore>>>,
}

impl KeyedPermit {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedPermit {
    fn drop(&mut self) {
        self.permit.take();
        prune(&self.locks, &self.key);
    }
}

/// 没有持有者也没有等待者时移除键
fn prune(locks: &DashMap<String, Arc<Semaphore>>, key: &str) {
    locks.remove_if(key, |_, semaphore| {
        Arc::strong_count(semaphore) == 1 && semaphore.available_permits() == 1
    });
}

/// 按键互斥锁
///
/// 每个键一个容量为 1 的信号量，锁表本身用 DashMap 免全局锁
#[derive(Clone)]
pub struct KeyedLocks {
    scope: &'static str,
    locks: Arc<DashMap<String, Arc<Semaphore>>>,
    strategy: ConcurrencyStrategy,
    acquire_timeout: Duration,
}

impl KeyedLocks {
    pub fn new(scope: &'static str, strategy: ConcurrencyStrategy, acquire_timeout: Duration) -> Self {
        Self {
            scope,
            locks: Arc::new(DashMap::new()),
            strategy,
            acquire_timeout,
        }
    }

    fn semaphore(&self, key: &str) -> Arc<Semaphore> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    fn permit(&self, key: &str, permit: OwnedSemaphorePermit) -> KeyedPermit {
        KeyedPermit {
            key: key.to_string(),
            permit: Some(permit),
            locks: self.locks.clone(),
        }
    }

    /// 按配置策略获取键级许可
    pub async fn acquire(&self, key: &str) -> Result<KeyedPermit, ConcurrencyError> {
        match self.strategy {
            ConcurrencyStrategy::Reject => self.try_acquire(key),
            ConcurrencyStrategy::Wait => self.acquire_with_timeout(key).await,
        }
    }

    /// 非阻塞获取，被占用时立即拒绝
    pub fn try_acquire(&self, key: &str) -> Result<KeyedPermit, ConcurrencyError> {
        let semaphore = self.semaphore(key);
        match semaphore.try_acquire_owned() {
            Ok(permit) => {
                debug!(scope = self.scope, key = %key, "Acquired keyed permit");
                Ok(self.permit(key, permit))
            }
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                prune(&self.locks, key);
                warn!(scope = self.scope, key = %key, "Keyed permit busy, rejecting");
                Err(ConcurrencyError::Rejected {
                    scope_type: self.scope.to_string(),
                    scope_value: key.to_string(),
                })
            }
            Err(tokio::sync::TryAcquireError::Closed) => Err(ConcurrencyError::Closed),
        }
    }

    async fn acquire_with_timeout(&self, key: &str) -> Result<KeyedPermit, ConcurrencyError> {
        let semaphore = self.semaphore(key);
        // 先落地结果，超时后等待中的 future 已释放信号量引用
        let result = tokio::time::timeout(self.acquire_timeout, semaphore.acquire_owned()).await;
        match result {
            Ok(Ok(permit)) => Ok(self.permit(key, permit)),
            Ok(Err(_)) => Err(ConcurrencyError::Closed),
            Err(_) => {
                prune(&self.locks, key);
                warn!(scope = self.scope, key = %key, "Timeout acquiring keyed permit");
                Err(ConcurrencyError::AcquireTimeout {
                    resource: format!("{}:{}", self.scope, key),
                })
            }
        }
    }

    /// 当前登记的键数量
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// 有界扇出：批量任务的全局并发上限
#[derive(Clone)]
pub struct FanOutLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl FanOutLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, ConcurrencyError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ConcurrencyError::Closed)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reject_strategy_refuses_second_holder() {
        let locks = KeyedLocks::new("tenant", ConcurrencyStrategy::Reject, Duration::from_secs(1));

        let first = locks.acquire("t1").await.unwrap();
        let second = locks.acquire("t1").await;
        assert!(matches!(second, Err(ConcurrencyError::Rejected { .. })));

        // 其他键不受影响
        assert!(locks.acquire("t2").await.is_ok());

        drop(first);
        assert!(locks.acquire("t1").await.is_ok());
    }

    #[tokio::test]
    async fn test_released_keys_leave_the_table() {
        let locks = KeyedLocks::new("audit_log_entry", ConcurrencyStrategy::Wait, Duration::from_millis(50));

        for i in 0..20 {
            let permit = locks.acquire(&format!("entry-{}", i)).await.unwrap();
            assert_eq!(locks.len(), 1);
            drop(permit);
        }
        assert!(locks.is_empty());

        // 超时的等待者同样不留下键
        let held = locks.acquire("busy").await.unwrap();
        assert!(locks.acquire("busy").await.is_err());
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.len(), 0);

        // 被拒绝的调用方不影响持有者离开后的清理
        let reject = KeyedLocks::new("tenant", ConcurrencyStrategy::Reject, Duration::ZERO);
        let held = reject.acquire("t1").await.unwrap();
        assert!(reject.acquire("t1").await.is_err());
        drop(held);
        assert!(reject.is_empty());
    }

    #[tokio::test]
    async fn test_wait_strategy_times_out() {
        let locks = KeyedLocks::new("integration", ConcurrencyStrategy::Wait, Duration::from_millis(50));

        let _held = locks.acquire("i1").await.unwrap();
        let result = locks.acquire("i1").await;
        assert!(matches!(result, Err(ConcurrencyError::AcquireTimeout { .. })));
    }

    #[tokio::test]
    async fn test_wait_strategy_proceeds_after_release() {
        let locks = KeyedLocks::new("integration", ConcurrencyStrategy::Wait, Duration::from_secs(2));

        let held = locks.acquire("i1").await.unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("i1").await.map(|p| p.key().to_string()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), "i1");
    }

    #[tokio::test]
    async fn test_fan_out_limiter() {
        let limiter = FanOutLimiter::new(2);
        let a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available(), 0);
        drop(a);
        assert_eq!(limiter.available(), 1);
    }
}
