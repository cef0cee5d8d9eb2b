//! 优雅关闭处理
//!
//! - ShutdownManager：进程级关闭信号（Ctrl+C / SIGTERM），宿主程序用它取消正在运行的计划
//! - BackgroundWorker：长期后台任务（如记忆整合）的取消令牌 + 完成句柄，
//!   shutdown(deadline) 幂等，且在截止时间内等待任务退出；并发或超时后的调用者同样会等待

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::{HiveError, Result};

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// 用户发起的退出 (Ctrl+C)
    UserInitiated,
    /// SIGTERM 信号
    Signal,
    /// 致命错误
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 获取关闭 token（用于取消正在进行的任务）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 后台任务句柄：派生取消令牌 + JoinHandle
#[derive(Debug)]
pub struct BackgroundWorker {
    name: &'static str,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundWorker {
    /// 在当前 tokio 运行时中启动后台任务；`task` 接收派生的取消令牌，应在其被取消后尽快返回
    pub fn spawn<F, Fut>(name: &'static str, parent: &CancellationToken, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let handle = tokio::spawn(task(token.clone()));
        tracing::debug!(worker = name, "background worker started");
        Self {
            name,
            token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// 未启动任何任务的占位（例如构造时不在运行时内）
    pub fn idle(name: &'static str) -> Self {
        Self {
            name,
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// 句柄正被某个 shutdown 等待时视为仍在运行
    pub fn is_running(&self) -> bool {
        match self.handle.try_lock() {
            Ok(guard) => guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false),
            Err(_) => true,
        }
    }

    /// 仅发出取消信号，不等待（供 Drop 使用）
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// 取消并在 deadline 内等待任务退出
    ///
    /// 句柄只在任务确实结束后才清除：超时返回 `ShutdownTimeout` 后再次调用仍会等待，
    /// 并发调用者排队等待同一个句柄。任务结束后的调用直接返回 Ok。
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.token.cancel();
        let wait = async {
            let mut guard = self.handle.lock().await;
            let Some(handle) = guard.as_mut() else {
                return;
            };
            let joined = handle.await;
            *guard = None;
            match joined {
                Ok(()) => tracing::debug!(worker = self.name, "background worker stopped"),
                Err(e) => tracing::warn!(worker = self.name, "background worker ended abnormally: {}", e),
            }
        };

        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| HiveError::ShutdownTimeout(deadline.as_millis() as u64))
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
