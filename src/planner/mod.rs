//! 规划层：回合编排器（PlannerAdapter）及其 prompt、抽取、校验、事件与外部桥

pub mod adapter;
pub mod allocation;
pub mod bridge;
pub mod events;
pub mod extract;
pub mod prompt;
pub mod report;

use serde::{Deserialize, Serialize};

pub use adapter::{
    ExecutionMemoryRecord, FinalizeTurnRequest, PlanTurnRequest, PlanTurnResult, PlannerAdapter,
};
pub use allocation::{FileAction, PrimitiveType, TaskAllocation, UiType, VisualAction};
pub use bridge::{ComponentInfo, ComponentQueryBridge, ComponentQueryResult};
pub use events::{EventSender, PlannerEvent};
pub use prompt::MEMORY_CAPSULE_MARKER;
pub use report::ExecutionReport;

/// 记忆胶囊的注入策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMode {
    /// 仅在远端线程（重新）创建后的第一个回合注入
    #[default]
    BootstrapOnly,
    Always,
    Disabled,
}
