//! 可观测性：tracing 订阅器初始化
//!
//! 默认 `info`，可用 `RUST_LOG` 覆盖（如 `RUST_LOG=unity_planner=debug` 查看协议收发与子进程 stderr）。
//! 日志写到 stderr，stdout 留给 CLI 的流式输出与最终 JSON。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
