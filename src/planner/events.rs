//! 规划过程事件：流式文本、保活进度、组件查询工具调用与线程恢复

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// 单个事件（可序列化为 JSON 供 SSE 等前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlannerEvent {
    /// 增量文本
    Delta { text: String },
    /// 一条完整的 Agent 消息
    Message { text: String },
    /// 阶段切换与保活心跳
    Progress { stage: String, elapsed_ms: u64 },
    ToolCall { target_path: String },
    ToolResult {
        target_path: String,
        component_count: usize,
        error_code: Option<String>,
    },
    Recovery { action: String },
}

pub type EventSender = UnboundedSender<PlannerEvent>;

pub(crate) fn send_event(tx: Option<&EventSender>, ev: PlannerEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
