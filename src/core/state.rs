//! 状态定义：CoordinatorState 及其枚举
//!
//! 协调器独占一份 CoordinatorState；每次排队更新都以整体替换的方式产生新状态，订阅者拿到的永远是克隆快照。

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sink::MessagePriority;

/// 当前有权推送状态文案的生产者
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageOwner {
    #[default]
    None,
    ProjectService,
    FileManager,
}

impl fmt::Display for MessageOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageOwner::None => "NONE",
            MessageOwner::ProjectService => "PROJECT_SERVICE",
            MessageOwner::FileManager => "FILE_MANAGER",
        };
        f.write_str(s)
    }
}

/// UI 渲染状态
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    #[default]
    Idle,
    Thinking,
    Streaming,
    Completed,
}

impl DisplayState {
    /// 允许的迁移：自身、任意 → Idle、Idle → Thinking、Thinking ⇄ Streaming、
    /// Thinking/Streaming → Completed、Completed → Thinking（新一轮生成）
    pub fn can_transition_to(self, next: DisplayState) -> bool {
        use DisplayState::*;
        if self == next || next == Idle {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Thinking)
                | (Thinking, Streaming)
                | (Streaming, Thinking)
                | (Thinking, Completed)
                | (Streaming, Completed)
                | (Completed, Thinking)
        )
    }
}

/// 项目生成流水线阶段（顺序即声明顺序，单轮生成内单调递增）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPhase {
    #[default]
    Idle,
    Specification,
    TemplateSelection,
    TemplateFetching,
    BackendPreparation,
    BackendGeneration,
    BackendAnalysis,
    FrontendPreparation,
    FrontendGeneration,
    ConfigurationGeneration,
    ProjectOrganization,
    PlatformIntegration,
    Complete,
}

impl GenerationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationPhase::Idle => "idle",
            GenerationPhase::Specification => "specification",
            GenerationPhase::TemplateSelection => "template_selection",
            GenerationPhase::TemplateFetching => "template_fetching",
            GenerationPhase::BackendPreparation => "backend_preparation",
            GenerationPhase::BackendGeneration => "backend_generation",
            GenerationPhase::BackendAnalysis => "backend_analysis",
            GenerationPhase::FrontendPreparation => "frontend_preparation",
            GenerationPhase::FrontendGeneration => "frontend_generation",
            GenerationPhase::ConfigurationGeneration => "configuration_generation",
            GenerationPhase::ProjectOrganization => "project_organization",
            GenerationPhase::PlatformIntegration => "platform_integration",
            GenerationPhase::Complete => "complete",
        }
    }

    /// 退出该阶段时是否需要记录耗时（合成的 idle 与终态 complete 不记录）
    pub fn is_timed(self) -> bool {
        !matches!(self, GenerationPhase::Idle | GenerationPhase::Complete)
    }
}

impl fmt::Display for GenerationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GenerationPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let phase = match s.trim().to_lowercase().as_str() {
            "idle" => GenerationPhase::Idle,
            "specification" => GenerationPhase::Specification,
            "template_selection" => GenerationPhase::TemplateSelection,
            "template_fetching" => GenerationPhase::TemplateFetching,
            "backend_preparation" => GenerationPhase::BackendPreparation,
            "backend_generation" => GenerationPhase::BackendGeneration,
            "backend_analysis" => GenerationPhase::BackendAnalysis,
            "frontend_preparation" => GenerationPhase::FrontendPreparation,
            "frontend_generation" => GenerationPhase::FrontendGeneration,
            "configuration_generation" => GenerationPhase::ConfigurationGeneration,
            "project_organization" => GenerationPhase::ProjectOrganization,
            "platform_integration" => GenerationPhase::PlatformIntegration,
            "complete" => GenerationPhase::Complete,
            other => return Err(format!("unknown phase: {other}")),
        };
        Ok(phase)
    }
}

/// 调用方随阶段切换附带的上下文提示，用于拼出展示文案
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionHints {
    /// 用户原始需求文本（从中提取「主题」）
    pub user_request: Option<String>,
    /// 直接指定的展示文案，优先于按阶段推导
    pub custom_message: Option<String>,
    pub file_count: Option<usize>,
    pub template_name: Option<String>,
    pub detail: Option<String>,
}

impl TransitionHints {
    pub fn with_user_request(mut self, request: impl Into<String>) -> Self {
        self.user_request = Some(request.into());
        self
    }

    pub fn with_custom_message(mut self, message: impl Into<String>) -> Self {
        self.custom_message = Some(message.into());
        self
    }

    pub fn with_file_count(mut self, count: usize) -> Self {
        self.file_count = Some(count);
        self
    }

    pub fn with_template(mut self, name: impl Into<String>) -> Self {
        self.template_name = Some(name.into());
        self
    }
}

/// 最近一次阶段切换
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransitionContext {
    pub from_phase: GenerationPhase,
    pub to_phase: GenerationPhase,
    #[serde(flatten)]
    pub hints: TransitionHints,
}

/// 阶段耗时记录（只追加）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: GenerationPhase,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

/// 单轮生成完成时写入的数据
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionData {
    pub final_content: String,
    pub extracted_files: BTreeMap<String, String>,
    pub template_used: Option<String>,
    pub deployment_ready: bool,
    /// 由协调器覆写为当前活跃消息 id
    pub message_id: Option<String>,
}

/// 进行中的用户消息创建请求
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingMessageCreation {
    pub message_id: String,
    pub project_id: String,
    pub priority: MessagePriority,
    pub requested_at: DateTime<Utc>,
}

/// 协调器完整状态；快照即整体克隆
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CoordinatorState {
    pub current_owner: MessageOwner,
    pub display_state: DisplayState,
    pub current_phase: GenerationPhase,

    // 三个文案字段始终同步，不同 UI 读不同字段
    pub current_message: String,
    pub k_loading_message: String,
    pub active_message_content: String,

    pub is_generating: bool,
    pub is_streaming_active: bool,
    pub show_k_loading_animation: bool,
    pub exclusive_rendering_active: bool,
    pub pure_visual_state: bool,

    pub ownership_locked: bool,
    pub pending_ownership_transfer: bool,

    pub active_message_id: Option<String>,
    pub controlled_messages: HashSet<String>,

    pub completion_data: Option<CompletionData>,
    pub current_transition: Option<PhaseTransitionContext>,

    pub phase_start_time: Option<DateTime<Utc>>,
    pub phase_history: Vec<PhaseRecord>,

    pub generation_complete: bool,
    pub streaming_complete: bool,

    pub message_creation_in_progress: bool,
    pub pending_message_creation: Option<PendingMessageCreation>,
}

impl CoordinatorState {
    /// 同时写入三个镜像文案字段
    pub fn set_status_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.current_message = text.clone();
        self.k_loading_message = text.clone();
        self.active_message_content = text;
    }

    /// 当前阶段已经持续的时间；未开始计时则为 0
    pub fn phase_elapsed(&self, now: DateTime<Utc>) -> Duration {
        self.phase_start_time
            .and_then(|start| (now - start).to_std().ok())
            .unwrap_or_default()
    }

    /// 退出当前阶段时追加一条耗时记录（idle / complete 跳过）
    pub fn record_phase_exit(&mut self, now: DateTime<Utc>) {
        if !self.current_phase.is_timed() {
            return;
        }
        let duration = self.phase_elapsed(now);
        self.phase_history.push(PhaseRecord {
            phase: self.current_phase,
            duration,
            timestamp: now,
        });
    }

    /// 生产者能否推送文案：必须是当前 owner，且锁定时只有 owner 本身放行
    pub fn permits(&self, owner: MessageOwner) -> bool {
        if self.ownership_locked && owner != self.current_owner {
            return false;
        }
        owner == self.current_owner
    }

    pub fn is_chat_k_animation_blocked(&self) -> bool {
        self.show_k_loading_animation || self.is_generating || self.exclusive_rendering_active
    }

    pub fn phase_info(&self, now: DateTime<Utc>) -> PhaseInfo {
        PhaseInfo {
            phase: self.current_phase,
            started_at: self.phase_start_time,
            elapsed: self.phase_elapsed(now),
            transition: self.current_transition.clone(),
            history: self.phase_history.clone(),
        }
    }
}

/// get_current_phase_info 的返回值
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PhaseInfo {
    pub phase: GenerationPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed: Duration,
    pub transition: Option<PhaseTransitionContext>,
    pub history: Vec<PhaseRecord>,
}
