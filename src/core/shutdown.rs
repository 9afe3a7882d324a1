//! 优雅关闭处理
//!
//! 监听 Ctrl+C / SIGTERM，取消正在进行的规划调用，并保证退出前执行 `PlannerAdapter::close`
//! （终止所有子进程、写入最终快照）。

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 用户发起的退出 (Ctrl+C)
    UserInitiated,
    /// SIGTERM 信号
    Signal,
    /// 致命错误
    FatalError(String),
}

/// 关闭信号管理器：根 token 被取消时，所有派生的调用 token 一并取消
#[derive(Clone)]
pub struct ShutdownManager {
    root: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(4);
        Self {
            root: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 为单次 plan / finalize 调用派生取消信号
    pub fn call_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::info!(?reason, "shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
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
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }

    /// 运行 `work` 直到完成；无论是否收到关闭信号，都在返回前执行 `cleanup`
    pub async fn run_then_cleanup<T, W, C, CF>(&self, work: W, cleanup: C) -> T
    where
        W: Future<Output = T>,
        C: FnOnce() -> CF,
        CF: Future<Output = ()>,
    {
        let output = work.await;
        cleanup().await;
        output
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
