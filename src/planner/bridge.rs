//! 组件查询桥：Agent 调用 `query_unity_components` 时由调用方提供的外部实现

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const E_BRIDGE_UNAVAILABLE: &str = "E_BRIDGE_UNAVAILABLE";
pub const E_BRIDGE_FAILED: &str = "E_BRIDGE_FAILED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub short_name: String,
    pub assembly_qualified_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentQueryResult {
    #[serde(default)]
    pub components: Vec<ComponentInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ComponentQueryResult {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            components: Vec::new(),
            error_code: Some(code.to_string()),
            error_message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait ComponentQueryBridge: Send + Sync {
    /// 查询场景对象上的组件；Err 会被折叠成带错误码的结果交回 Agent，而不是中断回合
    async fn query_unity_components(&self, target_path: &str) -> Result<ComponentQueryResult, String>;
}

/// 调用桥并把缺失 / 失败折叠成结构化错误
pub async fn run_component_query(
    bridge: Option<&dyn ComponentQueryBridge>,
    target_path: &str,
) -> ComponentQueryResult {
    let Some(bridge) = bridge else {
        return ComponentQueryResult::error(
            E_BRIDGE_UNAVAILABLE,
            "component query bridge is not configured",
        );
    };
    match bridge.query_unity_components(target_path).await {
        Ok(result) => result,
        Err(message) => {
            tracing::warn!(target_path, error = %message, "component query failed");
            ComponentQueryResult::error(E_BRIDGE_FAILED, message)
        }
    }
}
