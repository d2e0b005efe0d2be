//! 消息出口抽象
//!
//! 宿主应用注入的外部协作者：创建消息、更新消息内容、本地持久化、远端（canister）更新、优先级登记。
//! 协调器只把它当作不透明的异步函数，不重试、不设超时。

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::InMemorySink;

/// 出口失败时的错误描述
pub type SinkError = String;

/// 消息类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    System,
    Assistant,
}

/// 用户消息优先级，Critical 为最高档（成为「当前指令」）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    pub fn is_highest(self) -> bool {
        self == MessagePriority::Critical
    }

    /// 人类可读的优先级原因
    pub fn reason(self) -> &'static str {
        match self {
            MessagePriority::Critical => {
                "Current user instruction - takes precedence over earlier requests"
            }
            MessagePriority::High => "Recent user request - handled before background work",
            MessagePriority::Normal => "Standard user message",
            MessagePriority::Low => "Background note - handled when idle",
        }
    }
}

/// 随用户消息附带的优先级上下文
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriorityContext {
    pub priority: MessagePriority,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub is_current_instruction: bool,
    /// 会话关联（预留）
    pub conversation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl PriorityContext {
    pub fn new(priority: MessagePriority) -> Self {
        Self {
            priority,
            reason: priority.reason().to_string(),
            timestamp: Utc::now(),
            is_current_instruction: priority.is_highest(),
            conversation_id: None,
            reply_to: None,
        }
    }
}

/// 交给出口创建的消息记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub project_id: String,
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// 由生成流水线创建（系统消息）
    pub is_generation: bool,
    pub priority_context: Option<PriorityContext>,
}

impl ChatMessage {
    pub fn system(
        id: impl Into<String>,
        project_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            kind: MessageKind::System,
            content: content.into(),
            timestamp: Utc::now(),
            is_generation: true,
            priority_context: None,
        }
    }

    pub fn user(
        id: impl Into<String>,
        project_id: impl Into<String>,
        content: impl Into<String>,
        priority: MessagePriority,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            kind: MessageKind::User,
            content: content.into(),
            timestamp: Utc::now(),
            is_generation: false,
            priority_context: Some(PriorityContext::new(priority)),
        }
    }
}

/// 消息出口 trait：除 create 外都有空实现，未提供即视为「未注册、不调用」
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// 创建消息（必须实现）
    async fn create(&self, message: ChatMessage) -> Result<(), SinkError>;

    /// 更新已创建消息的内容
    async fn update(&self, _message_id: &str, _content: &str) -> Result<(), SinkError> {
        Ok(())
    }

    /// 本地持久化
    async fn persist(&self, _message: &ChatMessage) -> Result<(), SinkError> {
        Ok(())
    }

    /// 远端（canister）内容更新
    async fn update_in_canister(&self, _message_id: &str, _content: &str) -> Result<(), SinkError> {
        Ok(())
    }

    /// 登记消息优先级
    async fn assign_priority(
        &self,
        _message_id: &str,
        _priority: MessagePriority,
    ) -> Result<(), SinkError> {
        Ok(())
    }
}
