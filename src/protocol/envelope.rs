//! 行分隔 JSON 信封：`{id?, method, params}` / `{id, result|error}`
//!
//! 每行一个信封；无法解析或形状不符的行直接丢弃（子进程可能往 stdout 打诊断噪声）。

use serde_json::{json, Value};

/// 子进程主动推送的消息（无 id 的通知；带 id 的服务端请求也按通知分发给监听者）
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
    /// 服务端请求的 id（普通通知为 None）
    pub request_id: Option<Value>,
}

impl Notification {
    /// 通知所属的回合 id：`params.turnId` / `params.turn_id` / `params.turn.id`
    pub fn turn_id(&self) -> Option<&str> {
        turn_id_of(&self.params)
    }
}

/// JSON-RPC 风格的错误体
#[derive(Debug, Clone, PartialEq)]
pub struct RpcErrorBody {
    pub message: String,
    pub code: Option<i64>,
}

/// 解析后的入站信封
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Response {
        id: u64,
        result: Result<Value, RpcErrorBody>,
    },
    Notification(Notification),
}

/// 解析一行；空行、非 JSON、非对象、形状不符均返回 None
pub fn parse_line(line: &str) -> Option<Envelope> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let obj = value.as_object()?;

    if let Some(method) = obj.get("method").and_then(Value::as_str) {
        return Some(Envelope::Notification(Notification {
            method: method.to_string(),
            params: obj.get("params").cloned().unwrap_or(Value::Null),
            request_id: obj.get("id").filter(|id| !id.is_null()).cloned(),
        }));
    }

    let id = obj.get("id").and_then(parse_id)?;
    if let Some(err) = obj.get("error").filter(|e| !e.is_null()) {
        return Some(Envelope::Response {
            id,
            result: Err(parse_error_body(err)),
        });
    }
    let result = obj.get("result")?.clone();
    Some(Envelope::Response {
        id,
        result: Ok(result),
    })
}

fn parse_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_error_body(err: &Value) -> RpcErrorBody {
    match err {
        Value::String(s) => RpcErrorBody {
            message: s.clone(),
            code: None,
        },
        Value::Object(obj) => RpcErrorBody {
            message: obj
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string()),
            code: obj.get("code").and_then(Value::as_i64),
        },
        other => RpcErrorBody {
            message: other.to_string(),
            code: None,
        },
    }
}

/// 编码一条请求（带换行）
pub fn encode_request(id: u64, method: &str, params: &Value) -> String {
    let mut line = json!({ "id": id, "method": method, "params": params }).to_string();
    line.push('\n');
    line
}

/// 编码一条客户端通知（无 id，带换行）
pub fn encode_notification(method: &str, params: &Value) -> String {
    let mut line = json!({ "method": method, "params": params }).to_string();
    line.push('\n');
    line
}

/// 编码对服务端请求的应答（id 原样回传，带换行）
pub fn encode_response(id: &Value, result: &Value) -> String {
    let mut line = json!({ "id": id, "result": result }).to_string();
    line.push('\n');
    line
}

pub(crate) fn turn_id_of(params: &Value) -> Option<&str> {
    params
        .get("turnId")
        .or_else(|| params.get("turn_id"))
        .and_then(Value::as_str)
        .or_else(|| params.get("turn").and_then(|t| t.get("id")).and_then(Value::as_str))
}
