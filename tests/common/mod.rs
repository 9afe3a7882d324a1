//! 集成测试公共工具：进程内的脚本化假 Agent 服务端与 Runner 工厂
//!
//! 每次 `create` 建一对 `tokio::io::duplex`，一端交给 ProtocolRunner，另一端由假服务端按脚本应答。

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use unity_planner::config::{AgentSection, AppConfig};
use unity_planner::core::PlannerError;
use unity_planner::planner::{ComponentInfo, ComponentQueryBridge, ComponentQueryResult, PlannerAdapter};
use unity_planner::protocol::{ProtocolRunner, RunnerFactory, RunnerOptions};
use unity_planner::session::{InMemorySnapshotStore, SnapshotStore};

/// 每个 turn/start 依次消费一条脚本；脚本耗尽后回复固定文本
#[derive(Debug, Clone)]
pub enum TurnScript {
    /// 流式文本 + 完整消息 + completed
    Text(String),
    /// 只发出组件查询工具调用，不发送完成事件
    ToolCall(String),
    /// 以服务端请求（带 id）发出组件查询，等待客户端回应
    ToolRequest(String),
    /// turn/start 直接返回 RPC 错误
    RpcError(String),
    /// completed 并携带结构化输出
    Structured(Value),
    /// turn/completed 带 failed 状态
    Failed(String),
    /// 不再有任何输出
    Hang,
    /// 关闭连接，模拟子进程退出
    Exit,
}

#[derive(Default)]
pub struct FakeAgent {
    turns: Mutex<VecDeque<TurnScript>>,
    requests: Mutex<Vec<(String, Value)>>,
    notifications: Mutex<Vec<String>>,
    responses: Mutex<Vec<Value>>,
    threads: AtomicUsize,
    turn_ids: AtomicUsize,
    spawned: AtomicUsize,
    reject_resume: AtomicBool,
}

impl FakeAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, turns: impl IntoIterator<Item = TurnScript>) {
        self.turns.lock().unwrap().extend(turns);
    }

    pub fn reject_resume(&self) {
        self.reject_resume.store(true, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// 指定方法收到的全部请求参数
    pub fn params_of(&self, method: &str) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.params_of(method).len()
    }

    /// 第 n 个 turn/start 的输入文本
    pub fn turn_input(&self, n: usize) -> String {
        self.params_of("turn/start")[n]["input"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }

    pub fn client_notifications(&self) -> Vec<String> {
        self.notifications.lock().unwrap().clone()
    }

    /// 客户端对服务端请求的回应（有 id、无 method）
    pub fn client_responses(&self) -> Vec<Value> {
        self.responses.lock().unwrap().clone()
    }

    fn next_turn(&self) -> TurnScript {
        self.turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| TurnScript::Text("ok".into()))
    }

    /// 处理一条请求，返回要写回的行；None 表示关闭连接
    fn handle(&self, method: &str, id: &Value, params: &Value) -> Option<Vec<Value>> {
        self.requests
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));
        let reply = |result: Value| json!({"id": id, "result": result});
        let error = |message: &str| json!({"id": id, "error": {"code": -32000, "message": message}});

        let out = match method {
            "initialize" => vec![reply(json!({"serverInfo": {"name": "fake"}}))],
            "thread/start" => {
                let n = self.threads.fetch_add(1, Ordering::SeqCst) + 1;
                vec![reply(json!({"thread": {"id": format!("thr_{}", n)}}))]
            }
            "thread/resume" => {
                if self.reject_resume.load(Ordering::SeqCst) {
                    vec![error("thread not found")]
                } else {
                    vec![reply(json!({"thread": {"id": params["threadId"]}}))]
                }
            }
            "turn/interrupt" => vec![reply(json!({}))],
            "turn/start" => {
                let n = self.turn_ids.fetch_add(1, Ordering::SeqCst) + 1;
                let turn_id = format!("turn_{}", n);
                let started = reply(json!({"turn": {"id": turn_id, "status": "inProgress"}}));
                match self.next_turn() {
                    TurnScript::Exit => return None,
                    TurnScript::RpcError(message) => vec![error(&message)],
                    TurnScript::Hang => vec![started],
                    TurnScript::Text(text) => {
                        let mid = text.char_indices().nth(text.chars().count() / 2).map_or(0, |(i, _)| i);
                        vec![
                            started,
                            json!({"method": "item/agentMessage/delta", "params": {"turnId": turn_id, "delta": &text[..mid]}}),
                            json!({"method": "item/agentMessage/delta", "params": {"turnId": turn_id, "delta": &text[mid..]}}),
                            json!({"method": "item/completed", "params": {"turnId": turn_id, "item": {"type": "agentMessage", "text": text}}}),
                            json!({"method": "turn/completed", "params": {"turn": {"id": turn_id, "status": "completed"}}}),
                        ]
                    }
                    TurnScript::ToolCall(target_path) => vec![
                        started,
                        json!({"method": "item/started", "params": {"turnId": turn_id, "item": {
                            "type": "mcpToolCall",
                            "tool": "query_unity_components",
                            "arguments": {"target_path": target_path}
                        }}}),
                    ],
                    TurnScript::ToolRequest(target_path) => vec![
                        started,
                        json!({"id": format!("srv-{}", n), "method": "item/tool/call", "params": {
                            "turnId": turn_id,
                            "callId": format!("call_{}", n),
                            "tool": "query_unity_components",
                            "arguments": {"target_path": target_path}
                        }}),
                    ],
                    TurnScript::Structured(output) => vec![
                        started,
                        json!({"method": "turn/completed", "params": {"turn": {"id": turn_id, "status": "completed"}, "output": output}}),
                    ],
                    TurnScript::Failed(message) => vec![
                        started,
                        json!({"method": "turn/completed", "params": {"turn": {"id": turn_id, "status": "failed", "error": {"message": message}}}}),
                    ],
                }
            }
            other => vec![error(&format!("unknown method {}", other))],
        };
        Some(out)
    }

    /// 在一对 duplex 流上为单个 Runner 服务，直到连接关闭或脚本要求退出
    async fn serve(self: Arc<Self>, stream: tokio::io::DuplexStream) {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();
        // 握手前先吐一行噪声，Runner 应丢弃
        let _ = write.write_all(b"fake agent booting\n").await;
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(msg) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let method = msg["method"].as_str().unwrap_or_default().to_string();
            let Some(id) = msg.get("id").cloned() else {
                self.notifications.lock().unwrap().push(method);
                continue;
            };
            if msg.get("method").is_none() {
                self.responses.lock().unwrap().push(msg);
                continue;
            }
            let Some(out) = self.handle(&method, &id, &msg["params"]) else {
                return;
            };
            for value in out {
                let mut text = value.to_string();
                text.push('\n');
                if write.write_all(text.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }
}

pub struct FakeFactory {
    pub agent: Arc<FakeAgent>,
    pub request_timeout: Duration,
    pub turn_timeout: Duration,
}

impl FakeFactory {
    /// 超时取自 [agent] 配置段，与生产工厂一致
    pub fn new(agent: Arc<FakeAgent>, settings: &AgentSection) -> Self {
        Self {
            agent,
            request_timeout: settings.request_timeout(),
            turn_timeout: settings.turn_timeout(),
        }
    }
}

#[async_trait]
impl RunnerFactory for FakeFactory {
    async fn create(&self, session_key: &str) -> Result<ProtocolRunner, PlannerError> {
        self.agent.spawned.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(256 * 1024);
        tokio::spawn(Arc::clone(&self.agent).serve(server));
        let (read, write) = tokio::io::split(client);
        Ok(ProtocolRunner::from_streams(
            read,
            write,
            RunnerOptions {
                label: session_key.to_string(),
                request_timeout: self.request_timeout,
                turn_timeout: self.turn_timeout,
            },
        ))
    }
}

/// 短超时、快速保活的测试配置
pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.agent.request_timeout_ms = 2_000;
    cfg.agent.turn_timeout_ms = 2_000;
    cfg.agent.keepalive_interval_ms = 50;
    cfg.session.persist_debounce_ms = 0;
    cfg
}

pub async fn adapter_with(
    agent: &Arc<FakeAgent>,
    cfg: &AppConfig,
    store: Arc<dyn SnapshotStore>,
) -> PlannerAdapter {
    PlannerAdapter::new(cfg, Arc::new(FakeFactory::new(Arc::clone(agent), &cfg.agent)), store).await
}

pub async fn default_adapter(agent: &Arc<FakeAgent>) -> (PlannerAdapter, Arc<InMemorySnapshotStore>) {
    let store = Arc::new(InMemorySnapshotStore::new());
    let adapter = adapter_with(agent, &test_config(), store.clone()).await;
    (adapter, store)
}

/// 固定返回组件列表并计数的桥
#[derive(Default)]
pub struct StaticBridge {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ComponentQueryBridge for StaticBridge {
    async fn query_unity_components(&self, target_path: &str) -> Result<ComponentQueryResult, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ComponentQueryResult {
            components: vec![
                ComponentInfo {
                    short_name: "Transform".into(),
                    assembly_qualified_name: "UnityEngine.Transform, UnityEngine.CoreModule".into(),
                },
                ComponentInfo {
                    short_name: format!("{}Marker", target_path.rsplit('/').next().unwrap_or("")),
                    assembly_qualified_name: "UnityEngine.UI.Button, UnityEngine.UI".into(),
                },
            ],
            error_code: None,
            error_message: None,
        })
    }
}

/// 每次查询先等待一段时间再返回空列表的桥
pub struct SlowBridge {
    pub delay: Duration,
}

#[async_trait]
impl ComponentQueryBridge for SlowBridge {
    async fn query_unity_components(&self, _target_path: &str) -> Result<ComponentQueryResult, String> {
        tokio::time::sleep(self.delay).await;
        Ok(ComponentQueryResult::default())
    }
}

pub fn null_allocation() -> TurnScript {
    TurnScript::Structured(json!({"task_allocation": null}))
}
