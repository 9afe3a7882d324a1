//! Unity Planner - 长驻 Agent 子进程的规划适配器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复策略、取消、优雅退出
//! - **protocol**: 行分隔 JSON 信封、子进程 Runner、Runner 工厂
//! - **session**: 会话注册表、持久状态与快照存储
//! - **memory**: 紧凑记忆行、记忆日志与胶囊压缩
//! - **planner**: 回合编排器（推理 → 抽取 → 收尾）
//! - **observability**: tracing 初始化

pub mod config;
pub mod core;
pub mod memory;
pub mod observability;
pub mod planner;
pub mod protocol;
pub mod session;

pub use config::{load_config, AppConfig};
pub use core::PlannerError;
pub use planner::{
    ExecutionMemoryRecord, ExecutionReport, FinalizeTurnRequest, PlanTurnRequest, PlanTurnResult,
    PlannerAdapter, PlannerEvent, TaskAllocation,
};
