//! 回合编排器集成测试：在脚本化的假 Agent 上跑完整的规划 / 收尾流程

mod common;

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::common::*;
    use unity_planner::core::{ErrorKind, PlannerError};
    use unity_planner::planner::{
        ExecutionMemoryRecord, ExecutionReport, FileAction, FinalizeTurnRequest, InjectionMode,
        PlanTurnRequest, PlannerEvent, MEMORY_CAPSULE_MARKER,
    };
    use unity_planner::session::InMemorySnapshotStore;

    fn plan_request(thread: &str, message: &str) -> PlanTurnRequest {
        PlanTurnRequest {
            request_id: "req".into(),
            thread_id: thread.into(),
            turn_id: "t".into(),
            user_message: message.into(),
            context: json!({"selection": {"path": "Canvas/Player"}}),
            ..Default::default()
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PlannerEvent>) -> Vec<PlannerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_plan_turn_extracts_fenced_allocation() {
        let agent = FakeAgent::new();
        agent.script([
            TurnScript::Text("Create a jump script and attach it.".into()),
            TurnScript::Text(
                "```json\n{\"task_allocation\": {\"reasoning_and_plan\": \"add jump\", \"file_actions\": [{\"type\": \"create_file\", \"path\": \"Assets/Scripts/Jump.cs\", \"content\": \"class Jump {}\"}], \"visual_layer_actions\": []}}\n```".into(),
            ),
        ]);
        let (adapter, store) = default_adapter(&agent).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = adapter
            .plan_turn(PlanTurnRequest {
                events: Some(tx),
                ..plan_request("scene-1", "add a jump button")
            })
            .await
            .unwrap();

        assert_eq!(result.assistant_text, "Create a jump script and attach it.");
        let allocation = result.task_allocation.expect("allocation");
        assert_eq!(allocation.reasoning_and_plan, "add jump");
        assert!(matches!(
            &allocation.file_actions[..],
            [FileAction::CreateFile { path, .. }] if path == "Assets/Scripts/Jump.cs"
        ));

        // 握手与回合参数
        assert_eq!(agent.count("initialize"), 1);
        assert!(agent.client_notifications().contains(&"initialized".to_string()));
        let turns = agent.params_of("turn/start");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0]["threadId"], "thr_1");
        assert!(turns[0]["tools"].is_array());
        assert_eq!(turns[1]["tool_choice"], "none");
        assert!(turns[1]["outputSchema"].is_object());

        let memory = adapter.state().memory_lines("scene-1");
        assert_eq!(memory.len(), 1);
        assert!(memory[0].starts_with("[Plan]"));
        assert!(memory[0].contains("file=1[create_file]"));

        let snapshot = store.current().expect("snapshot saved");
        assert!(snapshot
            .sessions
            .iter()
            .any(|e| e.session_key == "scene-1" && e.remote_thread_id == "thr_1"));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, PlannerEvent::Delta { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, PlannerEvent::Progress { stage, .. } if stage == "extracting")));
    }

    #[tokio::test]
    async fn test_null_allocation_is_chat_only() {
        let agent = FakeAgent::new();
        agent.script([TurnScript::Text("Hello there.".into()), null_allocation()]);
        let (adapter, _) = default_adapter(&agent).await;

        let result = adapter.plan_turn(plan_request("chat", "hi")).await.unwrap();
        assert!(result.task_allocation.is_none());
        let memory = adapter.state().memory_lines("chat");
        assert!(memory[0].ends_with("Actions=none"));
    }

    #[tokio::test]
    async fn test_invalid_allocation_is_schema_error() {
        let agent = FakeAgent::new();
        agent.script([
            TurnScript::Text("plan".into()),
            TurnScript::Structured(json!({"task_allocation": {"file_actions": [{"type": "explode_file"}]}})),
        ]);
        let (adapter, _) = default_adapter(&agent).await;

        let err = adapter.plan_turn(plan_request("s", "go")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert!(adapter.state().memory_lines("s").is_empty());
        // 结构错误不拆会话
        assert!(adapter.registry().contains("s"));
    }

    #[tokio::test]
    async fn test_memory_capsule_injected_only_on_bootstrap() {
        let agent = FakeAgent::new();
        agent.script([
            TurnScript::Text("first".into()),
            null_allocation(),
            TurnScript::Text("second".into()),
            null_allocation(),
        ]);
        let (adapter, _) = default_adapter(&agent).await;
        adapter
            .record_execution_memory(ExecutionMemoryRecord {
                thread_id: "scene-1".into(),
                execution_report: ExecutionReport::from_value(json!({
                    "outcome": "failed",
                    "compile_success": false,
                    "error_code": "E_COMPILE",
                    "goal": "add jump"
                })),
                final_message: None,
            })
            .await;

        adapter.plan_turn(plan_request("scene-1", "retry jump")).await.unwrap();
        adapter.plan_turn(plan_request("scene-1", "and again")).await.unwrap();

        assert_eq!(agent.count("turn/start"), 4);
        assert!(agent.turn_input(0).contains(MEMORY_CAPSULE_MARKER));
        assert!(agent.turn_input(0).contains("Error=E_COMPILE"));
        assert!(!agent.turn_input(2).contains(MEMORY_CAPSULE_MARKER));
    }

    #[tokio::test]
    async fn test_always_mode_injects_every_turn() {
        let agent = FakeAgent::new();
        let mut cfg = test_config();
        cfg.memory.injection_mode = InjectionMode::Always;
        let adapter = adapter_with(&agent, &cfg, Arc::new(InMemorySnapshotStore::new())).await;
        adapter
            .record_execution_memory(ExecutionMemoryRecord {
                thread_id: "k".into(),
                execution_report: ExecutionReport::from_value(json!({"outcome": "completed", "goal": "move cube"})),
                final_message: None,
            })
            .await;

        agent.script([TurnScript::Text("a".into()), null_allocation(), TurnScript::Text("b".into()), null_allocation()]);
        adapter.plan_turn(plan_request("k", "one")).await.unwrap();
        adapter.plan_turn(plan_request("k", "two")).await.unwrap();

        assert!(agent.turn_input(0).contains(MEMORY_CAPSULE_MARKER));
        assert!(agent.turn_input(2).contains(MEMORY_CAPSULE_MARKER));
    }

    #[tokio::test]
    async fn test_empty_memory_injects_nothing() {
        let agent = FakeAgent::new();
        agent.script([TurnScript::Text("a".into()), null_allocation()]);
        let (adapter, _) = default_adapter(&agent).await;

        adapter.plan_turn(plan_request("fresh", "hi")).await.unwrap();
        assert!(!agent.turn_input(0).contains(MEMORY_CAPSULE_MARKER));
    }

    #[tokio::test]
    async fn test_thread_missing_recovers_once() {
        let agent = FakeAgent::new();
        agent.script([
            TurnScript::RpcError("thread not found".into()),
            TurnScript::Text("recovered".into()),
            null_allocation(),
        ]);
        let (adapter, store) = default_adapter(&agent).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = adapter
            .plan_turn(PlanTurnRequest {
                events: Some(tx),
                ..plan_request("s", "go")
            })
            .await
            .unwrap();

        assert_eq!(result.assistant_text, "recovered");
        assert_eq!(agent.count("thread/start"), 2);
        assert_eq!(agent.params_of("turn/start")[1]["threadId"], "thr_2");
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, PlannerEvent::Recovery { action } if action == "recreate_thread")));
        let snapshot = store.current().unwrap();
        assert!(snapshot.sessions.iter().any(|e| e.remote_thread_id == "thr_2"));
    }

    #[tokio::test]
    async fn test_second_thread_missing_is_fatal() {
        let agent = FakeAgent::new();
        agent.script([
            TurnScript::RpcError("thread not found".into()),
            TurnScript::RpcError("thread not found".into()),
        ]);
        let (adapter, _) = default_adapter(&agent).await;

        let err = adapter.plan_turn(plan_request("s", "go")).await.unwrap_err();
        assert!(err.is_thread_missing());
        assert_eq!(agent.count("thread/start"), 2);
        assert_eq!(agent.count("turn/start"), 2);
    }

    #[tokio::test]
    async fn test_tool_round_limit() {
        let agent = FakeAgent::new();
        agent.script((0..4).map(|_| TurnScript::ToolCall("Canvas/Player".into())));
        let (adapter, _) = default_adapter(&agent).await;
        let bridge = Arc::new(StaticBridge::default());

        let err = adapter
            .plan_turn(PlanTurnRequest {
                bridge: Some(bridge.clone()),
                ..plan_request("s", "inspect player")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PlannerError::ToolRoundLimit(3)));
        assert_eq!(agent.count("turn/start"), 4);
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 3);
        // 每个被放弃的工具回合都被中断，包括超限的最后一个
        let interrupts = agent.params_of("turn/interrupt");
        assert_eq!(interrupts.len(), 4);
        assert_eq!(interrupts[3]["turnId"], "turn_4");
    }

    #[tokio::test]
    async fn test_server_request_tool_call_is_answered() {
        let agent = FakeAgent::new();
        agent.script([
            TurnScript::ToolRequest("Canvas/Button".into()),
            TurnScript::Text("Button inspected.".into()),
            null_allocation(),
        ]);
        let (adapter, _) = default_adapter(&agent).await;

        let result = adapter
            .plan_turn(PlanTurnRequest {
                bridge: Some(Arc::new(StaticBridge::default())),
                ..plan_request("s", "inspect button")
            })
            .await
            .unwrap();
        assert_eq!(result.assistant_text, "Button inspected.");

        let responses = agent.client_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], "srv-1");
        assert_eq!(responses[0]["result"]["components"].as_array().unwrap().len(), 2);

        let interrupts = agent.params_of("turn/interrupt");
        assert_eq!(interrupts.len(), 1);
        assert_eq!(interrupts[0]["turnId"], "turn_1");
        assert_eq!(interrupts[0]["threadId"], "thr_1");
        assert!(agent.turn_input(1).contains("call_1"));
    }

    #[tokio::test]
    async fn test_tool_result_feeds_continuation() {
        let agent = FakeAgent::new();
        agent.script([
            TurnScript::ToolCall("Canvas/Button".into()),
            TurnScript::Text("The button already has a Transform.".into()),
            null_allocation(),
        ]);
        let (adapter, _) = default_adapter(&agent).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = adapter
            .plan_turn(PlanTurnRequest {
                events: Some(tx),
                bridge: Some(Arc::new(StaticBridge::default())),
                ..plan_request("s", "inspect button")
            })
            .await
            .unwrap();

        assert_eq!(result.assistant_text, "The button already has a Transform.");
        assert!(agent.turn_input(1).contains("UnityEngine.UI.Button, UnityEngine.UI"));
        // 通知形式的工具调用不需要回应
        assert!(agent.client_responses().is_empty());
        assert_eq!(agent.count("turn/interrupt"), 1);
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, PlannerEvent::ToolCall { target_path } if target_path == "Canvas/Button")));
        assert!(events.iter().any(|e| matches!(
            e,
            PlannerEvent::ToolResult { component_count: 2, error_code: None, .. }
        )));
    }

    #[tokio::test]
    async fn test_missing_bridge_reports_unavailable() {
        let agent = FakeAgent::new();
        agent.script([
            TurnScript::ToolCall("Player".into()),
            TurnScript::Text("No bridge, planning blind.".into()),
            null_allocation(),
        ]);
        let (adapter, _) = default_adapter(&agent).await;

        adapter.plan_turn(plan_request("s", "go")).await.unwrap();
        assert!(agent.turn_input(1).contains("E_BRIDGE_UNAVAILABLE"));
    }

    #[tokio::test]
    async fn test_cancel_aborts_without_teardown() {
        let agent = FakeAgent::new();
        agent.script([TurnScript::Hang]);
        let (adapter, _) = default_adapter(&agent).await;
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = adapter
            .plan_turn(PlanTurnRequest {
                signal: Some(token),
                ..plan_request("s", "slow")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PlannerError::Aborted));
        assert!(adapter.registry().contains("s"));
        assert_eq!(agent.spawned(), 1);
    }

    #[tokio::test]
    async fn test_slow_bridge_emits_keepalive() {
        let agent = FakeAgent::new();
        agent.script([
            TurnScript::ToolCall("Canvas/Slow".into()),
            TurnScript::Text("done".into()),
            null_allocation(),
        ]);
        let (adapter, _) = default_adapter(&agent).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        adapter
            .plan_turn(PlanTurnRequest {
                events: Some(tx),
                bridge: Some(Arc::new(SlowBridge {
                    delay: Duration::from_millis(200),
                })),
                ..plan_request("s", "inspect")
            })
            .await
            .unwrap();

        let ticks = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, PlannerEvent::Progress { stage, .. } if stage == "querying_components"))
            .count();
        assert!(ticks >= 2, "expected keepalive during bridge call, got {}", ticks);
    }

    #[tokio::test]
    async fn test_cancel_during_slow_bridge_aborts() {
        let agent = FakeAgent::new();
        agent.script([TurnScript::ToolCall("Canvas/Slow".into())]);
        let (adapter, _) = default_adapter(&agent).await;
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            trigger.cancel();
        });

        let err = adapter
            .plan_turn(PlanTurnRequest {
                signal: Some(token),
                bridge: Some(Arc::new(SlowBridge {
                    delay: Duration::from_secs(5),
                })),
                ..plan_request("s", "inspect")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::Aborted));
        assert!(adapter.registry().contains("s"));
    }

    #[tokio::test]
    async fn test_hung_turn_emits_reasoning_keepalive() {
        let agent = FakeAgent::new();
        agent.script([TurnScript::Hang]);
        let (adapter, _) = default_adapter(&agent).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let err = adapter
            .plan_turn(PlanTurnRequest {
                signal: Some(token),
                events: Some(tx),
                ..plan_request("s", "slow")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::Aborted));

        let ticks = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, PlannerEvent::Progress { stage, .. } if stage == "reasoning"))
            .count();
        assert!(ticks >= 3, "expected keepalive ticks while waiting, got {}", ticks);
    }

    #[tokio::test]
    async fn test_turn_timeout_tears_down_session() {
        let agent = FakeAgent::new();
        agent.script([TurnScript::Hang]);
        let mut cfg = test_config();
        cfg.agent.turn_timeout_ms = 150;
        let adapter = adapter_with(&agent, &cfg, Arc::new(InMemorySnapshotStore::new())).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let started = std::time::Instant::now();
        let err = adapter
            .plan_turn(PlanTurnRequest {
                events: Some(tx),
                ..plan_request("s", "slow")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PlannerError::Timeout { .. }));
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!adapter.registry().contains("s"));
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, PlannerEvent::Recovery { action } if action == "reset_session")));
    }

    #[tokio::test]
    async fn test_already_cancelled_signal_short_circuits() {
        let agent = FakeAgent::new();
        let (adapter, _) = default_adapter(&agent).await;
        let token = CancellationToken::new();
        token.cancel();

        let err = adapter
            .plan_turn(PlanTurnRequest {
                signal: Some(token),
                ..plan_request("s", "never")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PlannerError::Aborted));
        assert_eq!(agent.spawned(), 0);
    }

    #[tokio::test]
    async fn test_transport_exit_tears_down_session() {
        let agent = FakeAgent::new();
        agent.script([TurnScript::Exit]);
        let (adapter, _) = default_adapter(&agent).await;

        let err = adapter.plan_turn(plan_request("s", "go")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(!adapter.registry().contains("s"));

        agent.script([TurnScript::Text("back".into()), null_allocation()]);
        let result = adapter.plan_turn(plan_request("s", "again")).await.unwrap();
        assert_eq!(result.assistant_text, "back");
        assert_eq!(agent.spawned(), 2);
        // 持久化的线程被恢复到新子进程上
        assert_eq!(agent.params_of("thread/resume")[0]["threadId"], "thr_1");
    }

    #[tokio::test]
    async fn test_failed_turn_keeps_session() {
        let agent = FakeAgent::new();
        agent.script([TurnScript::Failed("model overloaded".into())]);
        let (adapter, _) = default_adapter(&agent).await;

        let err = adapter.plan_turn(plan_request("s", "go")).await.unwrap_err();
        assert!(matches!(err, PlannerError::TurnFailed { ref status, .. } if status == "failed"));
        assert!(adapter.registry().contains("s"));
    }

    #[tokio::test]
    async fn test_finalize_writes_final_line() {
        let agent = FakeAgent::new();
        agent.script([
            TurnScript::Text("plan".into()),
            null_allocation(),
            TurnScript::Text("All changes applied.".into()),
        ]);
        let (adapter, _) = default_adapter(&agent).await;
        adapter.plan_turn(plan_request("s", "add jump")).await.unwrap();

        let summary = adapter
            .finalize_turn(FinalizeTurnRequest {
                thread_id: "s".into(),
                execution_report: ExecutionReport::from_value(json!({
                    "outcome": "completed",
                    "compile_success": true,
                    "action_success": true,
                    "secret_blob": "do not forward"
                })),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(summary, "All changes applied.");
        let finalize = &agent.params_of("turn/start")[2];
        assert_eq!(finalize["tool_choice"], "none");
        assert!(finalize.get("outputSchema").is_none());
        assert!(!agent.turn_input(2).contains("secret_blob"));

        let memory = adapter.state().memory_lines("s");
        let last = memory.last().unwrap();
        assert!(last.starts_with("[Final]"));
        // 目标与范围取自上一条规划记忆
        assert!(last.contains("Goal=add jump"));
        assert!(last.contains("Scope=Canvas/Player"));
        assert!(last.contains("Outcome=completed"));
    }

    #[tokio::test]
    async fn test_finalize_empty_text_fails() {
        let agent = FakeAgent::new();
        agent.script([TurnScript::Text(String::new())]);
        let (adapter, _) = default_adapter(&agent).await;

        let err = adapter
            .finalize_turn(FinalizeTurnRequest {
                thread_id: "s".into(),
                execution_report: ExecutionReport::from_value(json!({"outcome": "completed"})),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::EmptyResponse));
        assert!(adapter.state().memory_lines("s").is_empty());
    }

    #[tokio::test]
    async fn test_close_persists_and_stops_sessions() {
        let agent = FakeAgent::new();
        agent.script([TurnScript::Text("a".into()), null_allocation()]);
        let (adapter, store) = default_adapter(&agent).await;
        adapter.plan_turn(plan_request("s", "go")).await.unwrap();

        adapter.close().await;
        assert_eq!(adapter.registry().active_count(), 0);
        let snapshot = store.current().unwrap();
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.memories.len(), 1);
    }
}
