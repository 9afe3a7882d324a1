//! Runner 工厂：会话注册表通过它获得新的 ProtocolRunner
//!
//! 生产环境按 [agent] 配置启动子进程；测试可注入基于内存管道的实现。

use async_trait::async_trait;

use crate::config::AgentSection;
use crate::core::PlannerError;
use crate::protocol::{ProtocolRunner, RunnerOptions};

#[async_trait]
pub trait RunnerFactory: Send + Sync {
    /// 为会话 `session_key` 创建一个已连接（尚未握手）的 Runner
    async fn create(&self, session_key: &str) -> Result<ProtocolRunner, PlannerError>;
}

/// 按 [agent] 配置启动 Agent 子进程
#[derive(Debug, Clone)]
pub struct ProcessRunnerFactory {
    agent: AgentSection,
}

impl ProcessRunnerFactory {
    pub fn new(agent: AgentSection) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl RunnerFactory for ProcessRunnerFactory {
    async fn create(&self, session_key: &str) -> Result<ProtocolRunner, PlannerError> {
        ProtocolRunner::spawn(
            &self.agent,
            RunnerOptions::from_agent(&self.agent, session_key),
        )
    }
}
