//! 错误恢复引擎
//!
//! 根据 PlannerError 分类返回 RecoveryAction，供回合编排器决定是重建线程重试、拆除会话还是直接失败。

use crate::core::{ErrorKind, PlannerError};

/// 恢复引擎给出的建议动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 远端线程丢失：重建线程并把当前阶段重试一次
    RecreateThread,
    /// 子进程不可用：本次调用失败，释放时拆除整个会话
    ResetSession,
    /// 终止当前调用，错误原样上抛
    Abort,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::RecreateThread => "recreate_thread",
            RecoveryAction::ResetSession => "reset_session",
            RecoveryAction::Abort => "abort",
        }
    }
}

/// 语义化错误恢复：线程丢失只恢复一次，第二次同类错误视为致命
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// `already_recovered` 为 true 表示本阶段已经重建过一次线程
    pub fn handle(&self, err: &PlannerError, already_recovered: bool) -> RecoveryAction {
        match err.kind() {
            ErrorKind::ThreadMissing if !already_recovered => RecoveryAction::RecreateThread,
            ErrorKind::Transport => RecoveryAction::ResetSession,
            _ => RecoveryAction::Abort,
        }
    }
}
