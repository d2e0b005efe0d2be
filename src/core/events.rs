//! 交接事件与消息创建事件：与状态快照分开的独立通道

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::state::{GenerationPhase, MessageOwner, PhaseTransitionContext};
use crate::sink::MessagePriority;

/// 交接原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandoffReason {
    ExclusiveControlStarted,
    StreamingStarted,
    /// 文件管理器交还控制权，视为流式输出已结束
    StreamingComplete,
    ControlReclaimed,
    PhaseTransition,
    GenerationComplete,
    UserMessageCreated,
    ControlReleased,
}

/// 所有权转移或阶段切换的离散事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandoffEvent {
    pub from: MessageOwner,
    pub to: MessageOwner,
    pub reason: HandoffReason,
    pub message: Option<String>,
    pub phase: GenerationPhase,
    pub transition: Option<PhaseTransitionContext>,
    pub message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HandoffEvent {
    pub fn new(
        from: MessageOwner,
        to: MessageOwner,
        reason: HandoffReason,
        phase: GenerationPhase,
    ) -> Self {
        Self {
            from,
            to,
            reason,
            message: None,
            phase,
            transition: None,
            message_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_transition(mut self, transition: PhaseTransitionContext) -> Self {
        self.transition = Some(transition);
        self
    }

    pub fn with_message_id(mut self, id: Option<String>) -> Self {
        self.message_id = id;
        self
    }
}

/// 用户消息创建完成事件（第三个监听通道）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageCreationEvent {
    pub message_id: String,
    pub project_id: String,
    pub priority: MessagePriority,
    pub current_instruction_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}
