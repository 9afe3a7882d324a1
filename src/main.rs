//! Unity Planner CLI
//!
//! ```bash
//! unity-planner plan "add a jump button" --thread scene-1 --context '{"selection":{"path":"Canvas"}}'
//! unity-planner finalize --report '{"outcome":"completed","compile_success":true}' --thread scene-1
//! unity-planner memory --report '{"outcome":"failed","error_code":"E_COMPILE"}' --thread scene-1
//! ```
//!
//! 流式文本写到 stdout，最终结果以一行 JSON 输出；日志写到 stderr。Ctrl+C / SIGTERM 取消当前调用。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use unity_planner::config::load_config;
use unity_planner::core::ShutdownManager;
use unity_planner::observability;
use unity_planner::planner::{
    ExecutionMemoryRecord, ExecutionReport, FinalizeTurnRequest, PlanTurnRequest, PlannerAdapter,
    PlannerEvent,
};
use unity_planner::protocol::ProcessRunnerFactory;
use unity_planner::session::{normalize_key, JsonFileSnapshotStore};

/// Unity 编辑器规划 Sidecar
#[derive(Debug, Parser)]
#[command(
    name = "unity-planner",
    about = "Plan and finalize Unity editor turns through a long-lived agent process",
    version,
    after_help = "Logs go to stderr; set RUST_LOG=debug for protocol traces."
)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 会话线程 id（为空时落到 default 会话）
    #[arg(short, long, global = true, default_value = "")]
    thread: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Plan a turn from a user message
    Plan {
        /// User message (remaining words are joined with spaces)
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,

        /// Editor context as JSON
        #[arg(long, value_parser = parse_json, default_value = "{}")]
        context: Value,
    },

    /// Summarize an execution report
    Finalize {
        /// Execution report as JSON
        #[arg(long, value_parser = parse_json)]
        report: Value,
    },

    /// Record an execution report into session memory
    Memory {
        /// Execution report as JSON
        #[arg(long, value_parser = parse_json)]
        report: Value,

        /// Final assistant message for the memory line
        #[arg(long)]
        message: Option<String>,
    },
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {}", e))
}

async fn run_command(
    adapter: &PlannerAdapter,
    cli: &Cli,
    signal: CancellationToken,
    events: mpsc::UnboundedSender<PlannerEvent>,
) -> anyhow::Result<Value> {
    let request_id = uuid::Uuid::new_v4().to_string();
    match &cli.command {
        Command::Plan { message, context } => {
            let result = adapter
                .plan_turn(PlanTurnRequest {
                    request_id: request_id.clone(),
                    thread_id: cli.thread.clone(),
                    turn_id: request_id,
                    user_message: message.join(" "),
                    context: context.clone(),
                    signal: Some(signal),
                    events: Some(events),
                    bridge: None,
                })
                .await?;
            Ok(json!({
                "assistant_text": result.assistant_text,
                "task_allocation": result.task_allocation,
            }))
        }
        Command::Finalize { report } => {
            let summary = adapter
                .finalize_turn(FinalizeTurnRequest {
                    request_id: request_id.clone(),
                    thread_id: cli.thread.clone(),
                    turn_id: request_id,
                    execution_report: ExecutionReport::from_value(report.clone()),
                    signal: Some(signal),
                    events: Some(events),
                })
                .await?;
            Ok(json!({ "summary": summary }))
        }
        Command::Memory { report, message } => {
            adapter
                .record_execution_memory(ExecutionMemoryRecord {
                    thread_id: cli.thread.clone(),
                    execution_report: ExecutionReport::from_value(report.clone()),
                    final_message: message.clone(),
                })
                .await;
            let key = normalize_key(&cli.thread);
            Ok(json!({ "memory": adapter.state().memory_lines(&key) }))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let adapter = PlannerAdapter::new(
        &cfg,
        Arc::new(ProcessRunnerFactory::new(cfg.agent.clone())),
        Arc::new(JsonFileSnapshotStore::new(&cfg.persistence.snapshot_path)),
    )
    .await;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<PlannerEvent>();
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = event_rx.recv().await {
            match event {
                PlannerEvent::Delta { text } => {
                    let _ = write!(stdout, "{}", text);
                    let _ = stdout.flush();
                }
                other => tracing::debug!(event = ?other, "planner event"),
            }
        }
    });

    let signal = shutdown.call_token();
    let outcome = shutdown
        .run_then_cleanup(run_command(&adapter, &cli, signal, event_tx.clone()), || {
            adapter.close()
        })
        .await;

    drop(event_tx);
    let _ = printer.await;

    let value: Value = outcome?;
    println!();
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}
