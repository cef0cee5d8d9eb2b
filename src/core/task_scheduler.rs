//! 任务调度：步骤工作池
//!
//! 每个 wave 内的步骤以独立任务提交，执行前先获取 Semaphore 许可，从而把同时运行的 handler 数量限制为 N。

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::core::error::{HiveError, Result};

/// 默认并发上限
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// 任务调度器：有界并发的工作池
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    permits: Arc<Semaphore>,
    max_concurrency: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// 当前空闲许可数
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// 获取一个执行许可
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HiveError::Internal("worker pool closed".to_string()))
    }

    /// 提交任务：在池内许可下运行 future，返回 JoinHandle
    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<Result<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.clone();
        tokio::spawn(async move {
            let _permit = pool.acquire().await?;
            Ok::<T, HiveError>(fut.await)
        })
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let pool = TaskScheduler::new(0);
        assert_eq!(pool.max_concurrency(), 1);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_spawn_respects_bound() {
        let pool = TaskScheduler::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
