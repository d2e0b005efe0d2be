//! 可观测性：tracing 日志初始化

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局日志订阅者；RUST_LOG 优先，否则使用传入的默认指令。重复调用安全（第二次忽略）。
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
