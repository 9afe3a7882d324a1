//! 执行报告：执行器回传的结果，用于收尾回合的 prompt 与执行结果记忆行

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::line::truncate_chars;

const FIELD_MAX_CHARS: usize = 200;
const ERROR_MAX_CHARS: usize = 400;
const LIST_MAX_ITEMS: usize = 12;

/// 字段宽松：执行器不同版本的报告都能解析
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionReport {
    /// completed / failed / cancelled ...
    pub outcome: String,
    pub compile_success: Option<bool>,
    pub action_success: Option<bool>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub files_changed: Vec<String>,
    pub actions_applied: Vec<String>,
    #[serde(alias = "user_message")]
    pub goal: Option<String>,
    pub scope: Option<String>,
    /// 其它字段原样保留，不进入 prompt
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ExecutionReport {
    /// 逐字段宽松解析：某个字段类型不对只丢弃该字段，其它字段照常保留
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut fields) = value else {
            tracing::warn!("execution report is not an object; ignored");
            return Self::default();
        };
        let goal = match fields.remove("goal") {
            Some(v) => text_field("goal", v),
            None => None,
        };
        let user_message = fields.remove("user_message").and_then(|v| text_field("user_message", v));
        Self {
            outcome: take(&mut fields, "outcome", text_field).unwrap_or_default(),
            compile_success: take(&mut fields, "compile_success", flag_field),
            action_success: take(&mut fields, "action_success", flag_field),
            error_code: take(&mut fields, "error_code", code_field),
            error_message: take(&mut fields, "error_message", text_field),
            files_changed: take(&mut fields, "files_changed", list_field).unwrap_or_default(),
            actions_applied: take(&mut fields, "actions_applied", list_field).unwrap_or_default(),
            goal: goal.or(user_message),
            scope: take(&mut fields, "scope", text_field),
            extra: fields,
        }
    }

    pub fn compile_status(&self) -> &'static str {
        status_word(self.compile_success)
    }

    pub fn action_status(&self) -> &'static str {
        status_word(self.action_success)
    }

    pub fn outcome_or_default(&self) -> &str {
        let trimmed = self.outcome.trim();
        if !trimmed.is_empty() {
            return trimmed;
        }
        match (self.compile_success, self.action_success, self.error_code.is_some()) {
            (_, _, true) | (Some(false), _, _) | (_, Some(false), _) => "failed",
            (None, None, false) => "unknown",
            _ => "completed",
        }
    }

    /// 收尾 prompt 用的脱敏摘要：只保留结构化字段，长文本截断
    pub fn redacted_summary(&self) -> Value {
        let mut files: Vec<String> = self
            .files_changed
            .iter()
            .take(LIST_MAX_ITEMS)
            .map(|f| truncate_chars(f, FIELD_MAX_CHARS))
            .collect();
        if self.files_changed.len() > LIST_MAX_ITEMS {
            files.push(format!("(+{} more)", self.files_changed.len() - LIST_MAX_ITEMS));
        }
        let actions: Vec<String> = self
            .actions_applied
            .iter()
            .take(LIST_MAX_ITEMS)
            .map(|a| truncate_chars(a, FIELD_MAX_CHARS))
            .collect();
        serde_json::json!({
            "outcome": self.outcome_or_default(),
            "compile": self.compile_status(),
            "actions": self.action_status(),
            "error_code": self.error_code.as_deref().map(|c| truncate_chars(c, 64)),
            "error_message": self.error_message.as_deref().map(|m| truncate_chars(m.trim(), ERROR_MAX_CHARS)),
            "files_changed": files,
            "actions_applied": actions,
        })
    }
}

fn take<T>(
    fields: &mut Map<String, Value>,
    name: &str,
    parse: fn(&str, Value) -> Option<T>,
) -> Option<T> {
    fields.remove(name).and_then(|v| parse(name, v))
}

fn mistyped(name: &str, value: &Value) {
    tracing::warn!(field = name, value = %value, "execution report field has unexpected type; ignored");
}

fn text_field(name: &str, value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => {
            mistyped(name, &other);
            None
        }
    }
}

/// 布尔值，也接受 "true" / "false" 字符串
fn flag_field(name: &str, value: Value) -> Option<bool> {
    match &value {
        Value::Null => None,
        Value::Bool(b) => Some(*b),
        Value::String(s) if s.trim().eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.trim().eq_ignore_ascii_case("false") => Some(false),
        other => {
            mistyped(name, other);
            None
        }
    }
}

/// 错误码：字符串或数字
fn code_field(name: &str, value: Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        other => text_field(name, other),
    }
}

/// 字符串列表，非字符串元素跳过
fn list_field(name: &str, value: Value) -> Option<Vec<String>> {
    match value {
        Value::Null => None,
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s),
                    _ => None,
                })
                .collect(),
        ),
        other => {
            mistyped(name, &other);
            None
        }
    }
}

fn status_word(flag: Option<bool>) -> &'static str {
    match flag {
        Some(true) => "success",
        Some(false) => "failed",
        None => "unknown",
    }
}
