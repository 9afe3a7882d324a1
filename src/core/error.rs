//! 规划器错误类型与分类
//!
//! 与 RecoveryEngine 配合：根据 PlannerError 的分类决定重建线程 / 重置会话 / 直接失败。

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// 规划器运行过程中可能出现的错误（子进程、协议、回合、结构校验、取消）
#[derive(Error, Debug, Clone)]
pub enum PlannerError {
    #[error("failed to spawn planner process: {0}")]
    Spawn(String),

    /// 子进程退出、管道关闭或 Runner 已停止
    #[error("planner transport closed: {0}")]
    TransportClosed(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// JSON-RPC 风格的 `{id, error:{message}}`
    #[error("rpc {method} failed: {message}")]
    Rpc {
        method: String,
        message: String,
        code: Option<i64>,
    },

    /// `turn/completed` 携带非 completed 状态
    #[error("turn {turn_id} finished with status {status}: {message}")]
    TurnFailed {
        turn_id: String,
        status: String,
        message: String,
    },

    /// 响应缺字段等协议层问题
    #[error("protocol error: {0}")]
    Protocol(String),

    /// 抽取 JSON 不合法 / 动作结构不合法
    #[error("task allocation invalid: {0}")]
    Schema(String),

    #[error("tool call round limit exceeded ({0} rounds)")]
    ToolRoundLimit(usize),

    #[error("planner returned empty assistant text")]
    EmptyResponse,

    #[error("aborted")]
    Aborted,

    #[error("snapshot store error: {0}")]
    Store(String),
}

/// 错误分类（对应传输 / 线程丢失 / 协议 / 结构 / 取消五类）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    ThreadMissing,
    Protocol,
    Schema,
    Cancelled,
}

fn thread_missing_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(thread|conversation)\b[^.\n]{0,48}\b(not found|unknown|invalid|does not exist|missing|not loaded)|\b(unknown|invalid|no such|missing)\s+(thread|conversation)",
        )
        .expect("thread-missing pattern compiles")
    })
}

fn transport_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)broken pipe|process (has )?exited|not running|transport closed|connection reset|timed out|unresponsive|cancell?ed|terminated",
        )
        .expect("transport pattern compiles")
    })
}

impl PlannerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlannerError::Spawn(_)
            | PlannerError::TransportClosed(_)
            | PlannerError::Timeout { .. } => ErrorKind::Transport,
            PlannerError::Rpc { message, .. } | PlannerError::TurnFailed { message, .. } => {
                if thread_missing_pattern().is_match(message) {
                    ErrorKind::ThreadMissing
                } else if transport_pattern().is_match(message) {
                    ErrorKind::Transport
                } else {
                    ErrorKind::Protocol
                }
            }
            PlannerError::Protocol(_) | PlannerError::Store(_) => ErrorKind::Protocol,
            PlannerError::Schema(_)
            | PlannerError::ToolRoundLimit(_)
            | PlannerError::EmptyResponse => ErrorKind::Schema,
            PlannerError::Aborted => ErrorKind::Cancelled,
        }
    }

    pub fn is_thread_missing(&self) -> bool {
        self.kind() == ErrorKind::ThreadMissing
    }

    /// 子进程已不可用：会话（含 Runner）需整体拆除
    pub fn is_fatal_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        PlannerError::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }
}
