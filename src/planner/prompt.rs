//! Prompt 组装：推理、工具续写、抽取、收尾四种回合输入，以及组件查询工具定义

use schemars::JsonSchema;
use serde_json::{json, Value};

use crate::memory::line::truncate_chars;
use crate::memory::MemoryCapsule;
use crate::planner::bridge::ComponentQueryResult;
use crate::planner::extract::{ToolCallRequest, COMPONENT_QUERY_TOOL};
use crate::planner::report::ExecutionReport;

/// 注入的记忆胶囊的标记行
pub const MEMORY_CAPSULE_MARKER: &str = "[Memory Capsule]";
const MEMORY_CAPSULE_END: &str = "[/Memory Capsule]";

const CONTEXT_MAX_CHARS: usize = 4_000;
const REASONING_MAX_CHARS: usize = 8_000;
const COMPONENTS_MAX_ITEMS: usize = 64;

/// 组件查询工具的参数（仅用于生成 Schema）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ComponentQueryArgs {
    /// 场景层级中的对象路径，如 Canvas/Panel/Button
    target_path: String,
}

/// turn/start 的 tools 参数
pub fn component_query_tools() -> Value {
    let schema = schemars::schema_for!(ComponentQueryArgs);
    json!([{
        "type": "function",
        "name": COMPONENT_QUERY_TOOL,
        "description": "List the components attached to a GameObject in the open Unity scene.",
        "parameters": serde_json::to_value(schema).unwrap_or_else(|_| json!({"type": "object"})),
    }])
}

fn capsule_block(capsule: &MemoryCapsule) -> String {
    format!(
        "{}\nEarlier turns in this conversation, oldest first:\n{}\n{}\n\n",
        MEMORY_CAPSULE_MARKER, capsule.text, MEMORY_CAPSULE_END
    )
}

fn context_block(context: &Value) -> String {
    if context.is_null() || context.as_object().map_or(false, |o| o.is_empty()) {
        return String::new();
    }
    let rendered = serde_json::to_string_pretty(context).unwrap_or_default();
    format!(
        "Editor context:\n{}\n\n",
        truncate_chars(&rendered, CONTEXT_MAX_CHARS)
    )
}

/// 推理回合：可选记忆胶囊 + 编辑器上下文 + 用户请求
pub fn reasoning_prompt(user_message: &str, context: &Value, capsule: Option<&MemoryCapsule>) -> String {
    let mut prompt = String::new();
    if let Some(capsule) = capsule.filter(|c| !c.is_empty()) {
        prompt.push_str(&capsule_block(capsule));
    }
    prompt.push_str(&context_block(context));
    prompt.push_str("User request:\n");
    prompt.push_str(user_message.trim());
    prompt.push_str(&format!(
        "\n\nThink through the change step by step and describe the plan in prose. \
         If you need to know which components a scene object has, call `{}` with its target_path. \
         Do not edit files yourself.",
        COMPONENT_QUERY_TOOL
    ));
    prompt
}

/// 工具续写回合：把查询结果（或错误）交回给 Agent
pub fn tool_continuation_prompt(call: &ToolCallRequest, result: &ComponentQueryResult) -> String {
    let components: Vec<Value> = result
        .components
        .iter()
        .take(COMPONENTS_MAX_ITEMS)
        .map(|c| json!({"short_name": c.short_name, "assembly_qualified_name": c.assembly_qualified_name}))
        .collect();
    let payload = json!({
        "tool": COMPONENT_QUERY_TOOL,
        "call_id": call.call_id,
        "target_path": call.target_path,
        "components": components,
        "error_code": result.error_code,
        "error_message": result.error_message,
    });
    format!(
        "Tool result:\n{}\n\nContinue the plan using this result. Call the tool again only if you need another object.",
        serde_json::to_string_pretty(&payload).unwrap_or_default()
    )
}

/// 抽取回合：基于推理结果输出严格 JSON
pub fn extraction_prompt(user_message: &str, reasoning: &str) -> String {
    format!(
        "Convert the plan below into a strict JSON object with exactly one top-level field \
         \"task_allocation\". Use null when the request needs no file or scene changes. \
         Otherwise provide reasoning_and_plan, file_actions (create_file, update_file, rename_file, delete_file) \
         and visual_layer_actions (add_component, remove_component, replace_component, create_gameobject). \
         create_gameobject takes exactly one of primitive_type or ui_type. \
         Output only the JSON object, no commentary.\n\nUser request:\n{}\n\nPlan:\n{}",
        user_message.trim(),
        truncate_chars(reasoning.trim(), REASONING_MAX_CHARS)
    )
}

/// 收尾回合：根据脱敏后的执行报告给用户写一段总结
pub fn finalize_prompt(report: &ExecutionReport) -> String {
    format!(
        "The planned changes were executed. Execution report:\n{}\n\n\
         Summarize the result for the user in a few sentences. \
         If something failed, name the error and suggest the next step. Do not call tools.",
        serde_json::to_string_pretty(&report.redacted_summary()).unwrap_or_default()
    )
}
