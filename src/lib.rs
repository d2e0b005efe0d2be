//! Herald - 消息所有权与 UI 状态协调器
//!
//! 模块划分：
//! - **config**: 配置加载（TOML + 环境变量）
//! - **core**: 协调器本体：状态、更新队列、所有权状态机、阶段切换、生成生命周期
//! - **observability**: tracing 日志初始化
//! - **sink**: 宿主注入的消息出口（创建 / 更新 / 持久化 / 优先级）
//! - **text**: 友好文案改写与阶段状态行推导

pub mod config;
pub mod core;
pub mod observability;
pub mod sink;
pub mod text;

pub use crate::core::{MessageCoordinator, MessageOwner};
