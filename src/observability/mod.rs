//! 可观测性
//!
//! 内部诊断统一走 tracing；`Logger` 是对外暴露的日志协作者接口，默认实现转发到 tracing。

mod logger;

pub use logger::{Level, Logger, NoopLogger, TracingLogger};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化 tracing：默认 info，可用 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
