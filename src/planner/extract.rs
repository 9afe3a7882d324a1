//! 从回合输出中取结构化数据：JSON 对象、工具调用、通知里的文本与结构化输出
//!
//! 全部是纯函数，不依赖 Runner。

use serde_json::{Map, Value};

use crate::core::PlannerError;

/// 唯一允许 Agent 调用的外部工具
pub const COMPONENT_QUERY_TOOL: &str = "query_unity_components";

/// 工具调用搜索的最大深度
const TOOL_SEARCH_MAX_DEPTH: usize = 8;

/// 从 Agent 文本中解析 JSON 对象：整段 → 去代码围栏 → 第一个配平的 `{...}`
pub fn parse_json_object(text: &str) -> Option<Map<String, Value>> {
    let trimmed = text.trim();
    if let Ok(Value::Object(obj)) = serde_json::from_str(trimmed) {
        return Some(obj);
    }
    if let Some(inner) = strip_code_fence(trimmed) {
        if let Ok(Value::Object(obj)) = serde_json::from_str(inner.trim()) {
            return Some(obj);
        }
    }
    let block = first_balanced_object(trimmed)?;
    match serde_json::from_str(block) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

/// 去掉 ```json ... ``` 围栏（围栏前后允许有其它文字）
fn strip_code_fence(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

/// 第一个括号配平的 `{...}`，忽略字符串内的括号
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// 抽取回合结果的 `task_allocation` 字段值
///
/// 优先使用完成事件中的结构化输出（需已包含该字段），否则解析回合文本；找不到字段是 Schema 错误。
pub fn resolve_task_allocation(structured: Option<&Value>, text: &str) -> Result<Value, PlannerError> {
    if let Some(value) = structured {
        let candidate = match value {
            Value::String(s) => parse_json_object(s).map(Value::Object),
            other => Some(other.clone()),
        };
        if let Some(found) = candidate.as_ref().and_then(|v| v.get("task_allocation")) {
            return Ok(found.clone());
        }
    }
    let obj = parse_json_object(text).ok_or_else(|| {
        PlannerError::Schema("extraction output is not a JSON object".to_string())
    })?;
    obj.get("task_allocation")
        .cloned()
        .ok_or_else(|| PlannerError::Schema("extraction output is missing 'task_allocation'".to_string()))
}

/// 观察到的组件查询调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub call_id: Option<String>,
    pub target_path: String,
}

/// 在任意形状的通知 params 中有界深度搜索组件查询调用，返回第一个结构合法的
pub fn find_tool_call(value: &Value) -> Option<ToolCallRequest> {
    search(value, 0)
}

fn search(value: &Value, depth: usize) -> Option<ToolCallRequest> {
    if depth > TOOL_SEARCH_MAX_DEPTH {
        return None;
    }
    match value {
        Value::Object(obj) => {
            if let Some(found) = as_tool_call(obj) {
                return Some(found);
            }
            obj.values().find_map(|v| search(v, depth + 1))
        }
        Value::Array(items) => items.iter().find_map(|v| search(v, depth + 1)),
        _ => None,
    }
}

fn tool_name(obj: &Map<String, Value>) -> Option<&str> {
    ["name", "tool", "toolName", "tool_name"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .or_else(|| obj.get("function").and_then(|f| f.get("name")).and_then(Value::as_str))
}

fn tool_arguments(obj: &Map<String, Value>) -> Option<Value> {
    let raw = ["arguments", "args", "input", "params"]
        .iter()
        .find_map(|k| obj.get(*k))
        .or_else(|| obj.get("function").and_then(|f| f.get("arguments")))?;
    match raw {
        Value::Object(_) => Some(raw.clone()),
        Value::String(s) => serde_json::from_str::<Value>(s).ok().filter(Value::is_object),
        _ => None,
    }
}

fn as_tool_call(obj: &Map<String, Value>) -> Option<ToolCallRequest> {
    let name = tool_name(obj)?;
    if name != COMPONENT_QUERY_TOOL && !name.ends_with(COMPONENT_QUERY_TOOL) {
        return None;
    }
    let args = tool_arguments(obj)?;
    let target_path = ["target_path", "targetPath"]
        .iter()
        .find_map(|k| args.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())?
        .to_string();
    let call_id = ["call_id", "callId", "id"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::to_string);
    Some(ToolCallRequest {
        call_id,
        target_path,
    })
}

/// `item/agentMessage/delta` 的增量文本
pub fn delta_text(params: &Value) -> Option<&str> {
    params
        .get("delta")
        .and_then(|d| d.as_str().or_else(|| d.get("text").and_then(Value::as_str)))
        .filter(|s| !s.is_empty())
}

/// `item/completed` 中的完整 Agent 消息
pub fn completed_message_text(params: &Value) -> Option<&str> {
    let item = params.get("item")?;
    let kind = item.get("type").and_then(Value::as_str)?;
    if kind != "agentMessage" && kind != "agent_message" {
        return None;
    }
    item.get("text").and_then(Value::as_str)
}

/// `turn/completed` 携带的结构化输出
pub fn structured_output(params: &Value) -> Option<&Value> {
    ["/output", "/structuredOutput", "/structured_output", "/turn/output", "/turn/structuredOutput"]
        .iter()
        .find_map(|p| params.pointer(p))
        .filter(|v| !v.is_null())
}

/// `turn/completed` 的状态；未给出时视为 completed
pub fn turn_status(params: &Value) -> &str {
    params
        .pointer("/turn/status")
        .or_else(|| params.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("completed")
}

/// 失败回合的错误信息
pub fn turn_error_message(params: &Value) -> String {
    ["/turn/error/message", "/error/message", "/turn/error", "/error"]
        .iter()
        .find_map(|p| params.pointer(p).and_then(Value::as_str))
        .unwrap_or("turn did not complete")
        .to_string()
}

/// `turn/start` 返回的回合 id
pub fn turn_id_of_result(result: &Value) -> Option<String> {
    result
        .pointer("/turn/id")
        .or_else(|| result.get("turnId"))
        .or_else(|| result.get("turn_id"))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}
