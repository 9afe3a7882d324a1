//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PLANNER__*` 覆盖（双下划线表示嵌套，如 `PLANNER__MEMORY__CAPSULE_MODE=layered`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::memory::CapsuleMode;
use crate::planner::InjectionMode;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub session: SessionSection,
    pub memory: MemorySection,
    pub persistence: PersistenceSection,
}

/// [agent] 段：Agent 子进程命令与各类超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// 传给 thread/start 的模型名，未设置时由子进程决定
    pub model: Option<String>,
    /// 单个请求等待响应的上限
    pub request_timeout_ms: u64,
    /// 等待 turn/completed 的上限
    pub turn_timeout_ms: u64,
    /// 保活进度事件的间隔
    pub keepalive_interval_ms: u64,
    pub max_tool_rounds: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            args: vec!["app-server".to_string()],
            cwd: None,
            env: HashMap::new(),
            model: None,
            request_timeout_ms: 30_000,
            turn_timeout_ms: 600_000,
            keepalive_interval_ms: 5_000,
            max_tool_rounds: 3,
        }
    }
}

impl AgentSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }
}

/// [session] 段：会话池容量、空闲淘汰与持久化映射的保留策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub idle_ttl_secs: u64,
    pub max_sessions: usize,
    /// 持久化线程映射的保留时长
    pub persisted_ttl_secs: u64,
    pub max_persisted_entries: usize,
    /// 非强制写入时两次快照写入的最小间隔
    pub persist_debounce_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 900,
            max_sessions: 8,
            persisted_ttl_secs: 7 * 24 * 3600,
            max_persisted_entries: 256,
            persist_debounce_ms: 2_000,
        }
    }
}

impl SessionSection {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

/// [memory] 段：记忆日志上限、胶囊模式与各阶段预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub injection_mode: InjectionMode,
    pub capsule_mode: CapsuleMode,
    /// 单个会话保留的记忆行数
    pub max_lines: usize,
    /// 单个会话记忆的总字符数
    pub max_chars: usize,
    pub capsule_max_lines: usize,
    /// layered 模式下原样保留的最近行数
    pub hot_lines: usize,
    pub cold_summary_max_chars: usize,
    pub scope_filter: bool,
    pub noise_filter: bool,
    /// 每个过滤阶段至少保留的行数
    pub min_keep_lines: usize,
    pub signal_pin: bool,
    pub pin_max_lines: usize,
    pub pin_max_added_chars: usize,
    pub pin_max_chars_per_line: usize,
    pub memory_ttl_secs: u64,
    pub max_memory_entries: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            injection_mode: InjectionMode::BootstrapOnly,
            capsule_mode: CapsuleMode::Legacy,
            max_lines: 24,
            max_chars: 6_000,
            capsule_max_lines: 8,
            hot_lines: 4,
            cold_summary_max_chars: 240,
            scope_filter: true,
            noise_filter: true,
            min_keep_lines: 2,
            signal_pin: true,
            pin_max_lines: 2,
            pin_max_added_chars: 320,
            pin_max_chars_per_line: 160,
            memory_ttl_secs: 30 * 24 * 3600,
            max_memory_entries: 256,
        }
    }
}

/// [persistence] 段：快照文件位置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    pub snapshot_path: PathBuf,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("state/planner-snapshot.json"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 PLANNER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PLANNER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PLANNER")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
