//! 纯视觉状态：简单编辑 / 聊天使用的轻量展示模式，不走阶段追踪
//!
//! 完整流水线持有独占渲染时，轻量模式不会覆盖它。

use crate::core::coordinator::MessageCoordinator;
use crate::core::state::DisplayState;

impl MessageCoordinator {
    pub fn start_pure_visual_state(&self, message: &str) {
        let message = message.to_string();
        let text = self.inner.text;
        self.queue_update(move |mut s, _| {
            if s.exclusive_rendering_active {
                tracing::warn!("pure visual state rejected: exclusive rendering active");
                return s;
            }
            let status = text.rewrite(&message, s.current_phase);
            s.pure_visual_state = true;
            s.show_k_loading_animation = true;
            s.is_streaming_active = false;
            s.display_state = DisplayState::Thinking;
            s.set_status_text(status);
            s
        });
    }

    /// 只在 K 动画显示时更新文案，否则忽略
    pub fn update_k_loading_message(&self, message: &str) {
        let message = message.to_string();
        let text = self.inner.text;
        self.queue_update(move |mut s, _| {
            if !s.show_k_loading_animation {
                tracing::warn!("k-loading update rejected: no animation active");
                return s;
            }
            let status = text.rewrite(&message, s.current_phase);
            s.set_status_text(status);
            s
        });
    }

    pub fn transition_from_visual_to_streaming(&self) {
        self.queue_update(|mut s, _| {
            if !s.pure_visual_state {
                tracing::warn!("visual → streaming ignored: not in pure visual state");
                return s;
            }
            s.display_state = DisplayState::Streaming;
            s.show_k_loading_animation = false;
            s.is_streaming_active = true;
            s
        });
    }

    pub fn complete_pure_visual_state(&self) {
        self.queue_update(|mut s, _| {
            if !s.pure_visual_state {
                tracing::debug!("complete ignored: not in pure visual state");
                return s;
            }
            s.pure_visual_state = false;
            s.show_k_loading_animation = false;
            s.is_streaming_active = false;
            s.display_state = DisplayState::Completed;
            s
        });
    }

    /// 无条件清掉视觉标志；没有流水线独占时回到 Idle
    pub fn force_complete_pure_visual_state(&self) {
        self.queue_update(|mut s, _| {
            s.pure_visual_state = false;
            s.is_streaming_active = false;
            if !s.exclusive_rendering_active {
                s.show_k_loading_animation = false;
                s.display_state = DisplayState::Idle;
            }
            s
        });
    }
}
