//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HERALD__*` 覆盖（双下划线表示嵌套，如 `HERALD__COORDINATOR__DEPLOYMENT_SETTLE_MS=200`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HeraldConfig {
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub text: TextSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// [coordinator] 段：完成后部署钩子的防抖延迟、交接事件广播容量
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorSection {
    /// 生成完成后，等待状态稳定再触发部署上下文钩子（毫秒）
    #[serde(default = "default_deployment_settle_ms")]
    pub deployment_settle_ms: u64,
    #[serde(default = "default_handoff_channel_capacity")]
    pub handoff_channel_capacity: usize,
}

impl CoordinatorSection {
    pub fn deployment_settle(&self) -> Duration {
        Duration::from_millis(self.deployment_settle_ms)
    }
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            deployment_settle_ms: default_deployment_settle_ms(),
            handoff_channel_capacity: default_handoff_channel_capacity(),
        }
    }
}

fn default_deployment_settle_ms() -> u64 {
    500
}

fn default_handoff_channel_capacity() -> usize {
    64
}

/// [text] 段：友好文案的最短长度，短于此值改用阶段兜底文案
#[derive(Debug, Clone, Deserialize)]
pub struct TextSection {
    #[serde(default = "default_min_friendly_length")]
    pub min_friendly_length: usize,
}

impl Default for TextSection {
    fn default() -> Self {
        Self {
            min_friendly_length: default_min_friendly_length(),
        }
    }
}

fn default_min_friendly_length() -> usize {
    4
}

/// [logging] 段：默认日志过滤指令（RUST_LOG 优先）
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// 从 config 目录加载配置，环境变量 HERALD__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HERALD__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<HeraldConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
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
        config::Environment::with_prefix("HERALD")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
