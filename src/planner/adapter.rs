//! 回合编排器：获取会话 → 推理（含组件查询子循环）→ 抽取 → 写记忆 → 释放
//!
//! 收尾回合单独走 获取会话 → 收尾 → 写记忆 → 释放。
//! 每个阶段遇到线程丢失会重建线程并重试一次；传输类错误让会话在释放时被拆除；
//! 取消只让本次调用以 aborted 失败。无论成败，会话都会被释放。

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentSection, AppConfig};
use crate::core::{ensure_active, race_cancel, PlannerError, RecoveryAction, RecoveryEngine};
use crate::memory::{
    build_capsule, final_line, plan_line, FinalLineInput, FocusScope, LineKind, MemoryCapsule,
    MemoryLine, NO_ACTIONS,
};
use crate::planner::allocation::{extraction_output_schema, TaskAllocation};
use crate::planner::bridge::{run_component_query, ComponentQueryBridge};
use crate::planner::events::{send_event, EventSender, PlannerEvent};
use crate::planner::extract::{
    completed_message_text, delta_text, find_tool_call, resolve_task_allocation,
    structured_output, turn_error_message, turn_id_of_result, turn_status, ToolCallRequest,
};
use crate::planner::prompt::{
    component_query_tools, extraction_prompt, finalize_prompt, reasoning_prompt,
    tool_continuation_prompt,
};
use crate::planner::report::ExecutionReport;
use crate::planner::InjectionMode;
use crate::protocol::{Notification, RunnerFactory};
use crate::session::{PersistedState, SessionLease, SessionRegistry, SnapshotStore};

/// 规划回合的输入
#[derive(Clone, Default)]
pub struct PlanTurnRequest {
    pub request_id: String,
    /// 会话 key（调用方的对话 id）
    pub thread_id: String,
    /// 调用方的回合 id，仅用于日志
    pub turn_id: String,
    pub user_message: String,
    /// 编辑器上下文（选中对象、场景等）
    pub context: Value,
    pub signal: Option<CancellationToken>,
    pub events: Option<EventSender>,
    pub bridge: Option<Arc<dyn ComponentQueryBridge>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanTurnResult {
    pub assistant_text: String,
    pub task_allocation: Option<TaskAllocation>,
}

#[derive(Clone, Default)]
pub struct FinalizeTurnRequest {
    pub request_id: String,
    pub thread_id: String,
    pub turn_id: String,
    pub execution_report: ExecutionReport,
    pub signal: Option<CancellationToken>,
    pub events: Option<EventSender>,
}

/// 不跑回合、只把执行结果写进记忆
#[derive(Debug, Clone, Default)]
pub struct ExecutionMemoryRecord {
    pub thread_id: String,
    pub execution_report: ExecutionReport,
    pub final_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnMode {
    /// 带组件查询工具，观察到工具调用即结束本回合
    Reasoning,
    /// tool_choice=none + outputSchema
    Extraction,
    /// tool_choice=none
    Finalize,
}

impl TurnMode {
    fn stage(self) -> &'static str {
        match self {
            TurnMode::Reasoning => "reasoning",
            TurnMode::Extraction => "extracting",
            TurnMode::Finalize => "finalizing",
        }
    }
}

#[derive(Debug, Default)]
struct TurnOutcome {
    turn_id: String,
    text: String,
    structured: Option<Value>,
    tool_call: Option<ToolCallRequest>,
    /// 工具调用以服务端请求形式到达时的请求 id，需要回应
    tool_request_id: Option<Value>,
}

/// 单次调用内各阶段共享的取消信号、事件通道与起始时间
struct CallCtx<'a> {
    signal: Option<&'a CancellationToken>,
    events: Option<&'a EventSender>,
    started: Instant,
}

impl CallCtx<'_> {
    fn progress(&self, stage: &str) {
        send_event(
            self.events,
            PlannerEvent::Progress {
                stage: stage.to_string(),
                elapsed_ms: self.started.elapsed().as_millis() as u64,
            },
        );
    }
}

async fn cancelled(signal: Option<&CancellationToken>) {
    match signal {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

pub struct PlannerAdapter {
    registry: SessionRegistry,
    state: Arc<PersistedState>,
    agent: AgentSection,
    recovery: RecoveryEngine,
}

impl PlannerAdapter {
    /// 从快照恢复持久状态并创建会话注册表
    pub async fn new(
        config: &AppConfig,
        factory: Arc<dyn RunnerFactory>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let state = Arc::new(
            PersistedState::restore(store, config.session.clone(), config.memory.clone()).await,
        );
        let registry = SessionRegistry::new(
            factory,
            Arc::clone(&state),
            config.session.clone(),
            config.agent.model.clone(),
        );
        Self {
            registry,
            state,
            agent: config.agent.clone(),
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn state(&self) -> &Arc<PersistedState> {
        &self.state
    }

    /// 规划回合：推理 → 抽取 → 校验 → 写规划记忆
    pub async fn plan_turn(&self, req: PlanTurnRequest) -> Result<PlanTurnResult, PlannerError> {
        let ctx = CallCtx {
            signal: req.signal.as_ref(),
            events: req.events.as_ref(),
            started: Instant::now(),
        };
        ensure_active(ctx.signal)?;
        tracing::info!(request_id = %req.request_id, thread = %req.thread_id, turn = %req.turn_id, "plan turn started");

        ctx.progress("acquiring_session");
        let lease = race_cancel(ctx.signal, self.registry.acquire(&req.thread_id)).await?;
        let result = self.run_plan(&lease, &req, &ctx).await;
        self.settle(lease, &result, &ctx).await;

        match &result {
            Ok(r) => tracing::info!(
                request_id = %req.request_id,
                executable = r.task_allocation.is_some(),
                elapsed_ms = ctx.started.elapsed().as_millis() as u64,
                "plan turn finished"
            ),
            Err(e) => tracing::warn!(request_id = %req.request_id, error = %e, "plan turn failed"),
        }
        result
    }

    async fn run_plan(
        &self,
        lease: &SessionLease,
        req: &PlanTurnRequest,
        ctx: &CallCtx<'_>,
    ) -> Result<PlanTurnResult, PlannerError> {
        let focus = FocusScope::from_context(&req.context);
        let focus = &focus;

        ctx.progress("reasoning");
        let reasoning = self
            .with_thread_recovery(lease, ctx, "reasoning", move || {
                self.reasoning_stage(lease, req, focus, ctx)
            })
            .await?;
        lease.mark_bootstrapped();

        ctx.progress("extracting");
        let plan_text = reasoning.as_str();
        let allocation_value = self
            .with_thread_recovery(lease, ctx, "extracting", move || async move {
                let outcome = self
                    .run_turn(
                        lease,
                        ctx,
                        TurnMode::Extraction,
                        extraction_prompt(&req.user_message, plan_text),
                    )
                    .await?;
                resolve_task_allocation(outcome.structured.as_ref(), &outcome.text)
            })
            .await?;
        let task_allocation = TaskAllocation::from_value(&allocation_value, &reasoning)?;

        ctx.progress("updating_memory");
        let actions = task_allocation
            .as_ref()
            .map(TaskAllocation::action_summary)
            .unwrap_or_else(|| NO_ACTIONS.to_string());
        self.append_memory(
            lease.key(),
            plan_line(&req.user_message, &focus.token(), &actions),
        )
        .await;

        Ok(PlanTurnResult {
            assistant_text: reasoning,
            task_allocation,
        })
    }

    /// 收尾回合：根据执行报告生成总结，并写入执行结果记忆
    pub async fn finalize_turn(&self, req: FinalizeTurnRequest) -> Result<String, PlannerError> {
        let ctx = CallCtx {
            signal: req.signal.as_ref(),
            events: req.events.as_ref(),
            started: Instant::now(),
        };
        ensure_active(ctx.signal)?;
        tracing::info!(request_id = %req.request_id, thread = %req.thread_id, turn = %req.turn_id, "finalize turn started");

        ctx.progress("acquiring_session");
        let lease = race_cancel(ctx.signal, self.registry.acquire(&req.thread_id)).await?;
        let result = async {
            ctx.progress("finalizing");
            let prompt = finalize_prompt(&req.execution_report);
            let (lease, ctx, prompt) = (&lease, &ctx, prompt.as_str());
            let summary = self
                .with_thread_recovery(lease, ctx, "finalizing", move || async move {
                    let outcome = self
                        .run_turn(lease, ctx, TurnMode::Finalize, prompt.to_string())
                        .await?;
                    let text = outcome.text.trim().to_string();
                    if text.is_empty() {
                        return Err(PlannerError::EmptyResponse);
                    }
                    Ok(text)
                })
                .await?;
            ctx.progress("updating_memory");
            let line = self.execution_line(lease.key(), &req.execution_report, None);
            self.append_memory(lease.key(), line).await;
            Ok(summary)
        }
        .await;
        self.settle(lease, &result, &ctx).await;

        if let Err(e) = &result {
            tracing::warn!(request_id = %req.request_id, error = %e, "finalize turn failed");
        }
        result
    }

    /// 只写执行结果记忆，不跑回合
    pub async fn record_execution_memory(&self, record: ExecutionMemoryRecord) {
        let key = crate::session::normalize_key(&record.thread_id);
        let line = self.execution_line(
            &key,
            &record.execution_report,
            record.final_message.as_deref(),
        );
        self.append_memory(&key, line).await;
    }

    /// 拆除所有会话并写入最终快照
    pub async fn close(&self) {
        self.registry.close().await;
    }

    /// 失败时按错误类别决定会话去留，然后释放
    async fn settle<T>(&self, lease: SessionLease, result: &Result<T, PlannerError>, ctx: &CallCtx<'_>) {
        if let Err(e) = result {
            if self.recovery.handle(e, true) == RecoveryAction::ResetSession {
                send_event(
                    ctx.events,
                    PlannerEvent::Recovery {
                        action: RecoveryAction::ResetSession.as_str().to_string(),
                    },
                );
                self.registry.mark_broken(&lease);
            }
        }
        self.registry.release(lease).await;
    }

    /// 运行一个阶段；线程丢失时重建线程并重试一次，第二次同类错误直接上抛
    async fn with_thread_recovery<T, F, Fut>(
        &self,
        lease: &SessionLease,
        ctx: &CallCtx<'_>,
        stage: &str,
        mut run: F,
    ) -> Result<T, PlannerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlannerError>>,
    {
        let mut recovered = false;
        loop {
            let err = match run().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match self.recovery.handle(&err, recovered) {
                RecoveryAction::RecreateThread => {
                    tracing::warn!(session = %lease.key(), stage, error = %err, "remote thread missing, recreating");
                    send_event(
                        ctx.events,
                        PlannerEvent::Recovery {
                            action: RecoveryAction::RecreateThread.as_str().to_string(),
                        },
                    );
                    race_cancel(ctx.signal, self.registry.recover_thread(lease)).await?;
                    recovered = true;
                }
                RecoveryAction::ResetSession | RecoveryAction::Abort => return Err(err),
            }
        }
    }

    /// 需要注入时的记忆胶囊（空胶囊不注入）
    fn capsule_for(&self, lease: &SessionLease, focus: &FocusScope) -> Option<MemoryCapsule> {
        let settings = self.state.memory_settings();
        let inject = match settings.injection_mode {
            InjectionMode::Disabled => false,
            InjectionMode::Always => true,
            InjectionMode::BootstrapOnly => lease.needs_bootstrap(),
        };
        if !inject {
            return None;
        }
        let lines = self.state.memory_lines(lease.key());
        let capsule = build_capsule(&lines, focus, settings);
        tracing::debug!(
            session = %lease.key(),
            mode = ?capsule.mode,
            source = capsule.source_line_count,
            included = capsule.included_line_count,
            pinned = capsule.pinned_count,
            dropped = capsule.dropped.total(),
            ratio = capsule.compaction_ratio,
            "built memory capsule"
        );
        (!capsule.is_empty()).then_some(capsule)
    }

    /// 推理阶段：首个回合 + 最多 max_tool_rounds 个工具续写回合
    async fn reasoning_stage(
        &self,
        lease: &SessionLease,
        req: &PlanTurnRequest,
        focus: &FocusScope,
        ctx: &CallCtx<'_>,
    ) -> Result<String, PlannerError> {
        let capsule = self.capsule_for(lease, focus);
        let mut input = reasoning_prompt(&req.user_message, &req.context, capsule.as_ref());
        let max_rounds = self.agent.max_tool_rounds;
        let mut rounds = 0usize;

        loop {
            let outcome = self
                .run_turn(lease, ctx, TurnMode::Reasoning, input)
                .await?;
            let Some(call) = outcome.tool_call else {
                let text = outcome.text.trim().to_string();
                if text.is_empty() {
                    return Err(PlannerError::EmptyResponse);
                }
                return Ok(text);
            };

            if rounds >= max_rounds {
                self.interrupt_turn(lease, ctx, &outcome.turn_id).await;
                return Err(PlannerError::ToolRoundLimit(max_rounds));
            }
            rounds += 1;
            tracing::info!(
                session = %lease.key(),
                round = rounds,
                call_id = call.call_id.as_deref().unwrap_or("-"),
                target_path = %call.target_path,
                "component query requested"
            );
            send_event(
                ctx.events,
                PlannerEvent::ToolCall {
                    target_path: call.target_path.clone(),
                },
            );
            let result = self
                .with_keepalive(
                    ctx,
                    "querying_components",
                    run_component_query(req.bridge.as_deref(), &call.target_path),
                )
                .await?;
            send_event(
                ctx.events,
                PlannerEvent::ToolResult {
                    target_path: call.target_path.clone(),
                    component_count: result.components.len(),
                    error_code: result.error_code.clone(),
                },
            );

            if let Some(request_id) = &outcome.tool_request_id {
                let reply = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
                let answered = race_cancel(ctx.signal, lease.runner().respond(request_id, reply)).await;
                if let Err(e) = answered {
                    tracing::warn!(session = %lease.key(), id = %request_id, error = %e, "failed to answer tool call request");
                }
            }
            // 续写在新回合里进行，原回合不再等待
            self.interrupt_turn(lease, ctx, &outcome.turn_id).await;
            input = tool_continuation_prompt(&call, &result);
        }
    }

    /// 尽力中断被放弃的回合；失败只记日志
    async fn interrupt_turn(&self, lease: &SessionLease, ctx: &CallCtx<'_>, turn_id: &str) {
        let params = json!({ "threadId": lease.thread_id(), "turnId": turn_id });
        match race_cancel(ctx.signal, lease.runner().request("turn/interrupt", params)).await {
            Ok(_) => tracing::debug!(session = %lease.key(), turn = %turn_id, "abandoned turn interrupted"),
            Err(e) => tracing::debug!(session = %lease.key(), turn = %turn_id, error = %e, "turn interrupt failed"),
        }
    }

    /// 等待 `fut` 期间按保活间隔发进度事件；取消时以 aborted 结束
    async fn with_keepalive<T, Fut>(&self, ctx: &CallCtx<'_>, stage: &str, fut: Fut) -> Result<T, PlannerError>
    where
        Fut: Future<Output = T>,
    {
        tokio::pin!(fut);
        let cancel = cancelled(ctx.signal);
        tokio::pin!(cancel);
        let period = self.agent.keepalive_interval();
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                biased;
                _ = &mut cancel => return Err(PlannerError::Aborted),
                out = &mut fut => return Ok(out),
                _ = keepalive.tick() => ctx.progress(stage),
            }
        }
    }

    /// 跑一个协议回合并收集它的文本、结构化输出与工具调用
    async fn run_turn(
        &self,
        lease: &SessionLease,
        ctx: &CallCtx<'_>,
        mode: TurnMode,
        input: String,
    ) -> Result<TurnOutcome, PlannerError> {
        ensure_active(ctx.signal)?;
        let runner = lease.runner();

        // 先订阅再发 turn/start，避免漏掉回合开头的通知
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let _subscription = runner.on_notification(move |n| {
            let _ = tx.send(n.clone());
        });

        let mut params = json!({
            "threadId": lease.thread_id(),
            "input": [{ "type": "text", "text": input }],
        });
        match mode {
            TurnMode::Reasoning => {
                params["tools"] = component_query_tools();
            }
            TurnMode::Extraction => {
                params["tool_choice"] = json!("none");
                params["outputSchema"] = extraction_output_schema();
            }
            TurnMode::Finalize => {
                params["tool_choice"] = json!("none");
            }
        }

        let started = race_cancel(ctx.signal, runner.request("turn/start", params)).await?;
        let turn_id = turn_id_of_result(&started)
            .ok_or_else(|| PlannerError::Protocol("turn/start returned no turn id".into()))?;
        tracing::debug!(session = %lease.key(), turn = %turn_id, stage = mode.stage(), "turn started");

        let mut collector = TurnCollector::new(turn_id.clone(), mode);
        let completion = runner.wait_for_turn_completed(&turn_id);
        tokio::pin!(completion);
        let cancel = cancelled(ctx.signal);
        tokio::pin!(cancel);
        let period = self.agent.keepalive_interval();
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;
                _ = &mut cancel => return Err(PlannerError::Aborted),
                Some(notification) = rx.recv() => {
                    collector.observe(&notification, ctx);
                    if collector.outcome.tool_call.is_some() {
                        // 工具调用在新回合里续写，不再等待本回合完成
                        return Ok(collector.outcome);
                    }
                }
                done = &mut completion => {
                    let params = done?;
                    while let Ok(notification) = rx.try_recv() {
                        collector.observe(&notification, ctx);
                    }
                    return collector.finish(&params);
                }
                _ = keepalive.tick() => ctx.progress(mode.stage()),
            }
        }
    }

    fn execution_line(&self, key: &str, report: &ExecutionReport, final_message: Option<&str>) -> String {
        let last_plan = self.state.last_memory_of_kind(key, LineKind::Plan);
        let plan = last_plan.as_deref().map(MemoryLine::parse);
        let goal = report
            .goal
            .clone()
            .filter(|g| !g.trim().is_empty())
            .or_else(|| plan.as_ref().and_then(|p| p.goal()).map(str::to_string))
            .or_else(|| final_message.map(str::to_string))
            .unwrap_or_default();
        let scope = report
            .scope
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| plan.as_ref().and_then(|p| p.scope()).map(str::to_string))
            .unwrap_or_default();
        final_line(&FinalLineInput {
            goal: &goal,
            scope: &scope,
            outcome: report.outcome_or_default(),
            compile: report.compile_status(),
            action_status: report.action_status(),
            error_code: report.error_code.as_deref(),
        })
    }

    async fn append_memory(&self, key: &str, line: String) {
        if !self.state.append_memory(key, line) {
            return;
        }
        if let Err(e) = self.state.persist(false).await {
            tracing::warn!(session = %key, error = %e, "failed to persist memory");
        }
    }
}

/// 按回合 id 过滤通知并累积输出
struct TurnCollector {
    turn_id: String,
    mode: TurnMode,
    deltas: String,
    last_message: Option<String>,
    outcome: TurnOutcome,
}

impl TurnCollector {
    fn new(turn_id: String, mode: TurnMode) -> Self {
        Self {
            turn_id: turn_id.clone(),
            mode,
            deltas: String::new(),
            last_message: None,
            outcome: TurnOutcome {
                turn_id,
                ..TurnOutcome::default()
            },
        }
    }

    fn observe(&mut self, notification: &Notification, ctx: &CallCtx<'_>) {
        if notification
            .turn_id()
            .map_or(false, |id| id != self.turn_id)
        {
            return;
        }
        match notification.method.as_str() {
            "item/agentMessage/delta" => {
                if let Some(delta) = delta_text(&notification.params) {
                    self.deltas.push_str(delta);
                    send_event(
                        ctx.events,
                        PlannerEvent::Delta {
                            text: delta.to_string(),
                        },
                    );
                }
            }
            "item/completed" => {
                if let Some(text) = completed_message_text(&notification.params) {
                    self.last_message = Some(text.to_string());
                    send_event(
                        ctx.events,
                        PlannerEvent::Message {
                            text: text.to_string(),
                        },
                    );
                }
            }
            _ => {}
        }
        if self.mode == TurnMode::Reasoning && self.outcome.tool_call.is_none() {
            self.outcome.tool_call = find_tool_call(&notification.params);
            if self.outcome.tool_call.is_some() {
                self.outcome.tool_request_id = notification.request_id.clone();
                self.outcome.text = self.text();
            }
        }
    }

    fn text(&self) -> String {
        self.last_message
            .clone()
            .unwrap_or_else(|| self.deltas.clone())
    }

    fn finish(mut self, params: &Value) -> Result<TurnOutcome, PlannerError> {
        let status = turn_status(params);
        if status != "completed" {
            return Err(PlannerError::TurnFailed {
                turn_id: self.turn_id,
                status: status.to_string(),
                message: turn_error_message(params),
            });
        }
        if self.mode == TurnMode::Reasoning && self.outcome.tool_call.is_none() {
            self.outcome.tool_call = find_tool_call(params);
        }
        self.outcome.text = self.text();
        self.outcome.structured = structured_output(params).cloned();
        Ok(self.outcome)
    }
}
