//! 生成生命周期：创建并控制生成消息、完成生成、带优先级的用户消息创建

use chrono::Utc;
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::core::coordinator::MessageCoordinator;
use crate::core::error::CoordinatorError;
use crate::core::events::{HandoffEvent, HandoffReason, MessageCreationEvent};
use crate::core::queue::AfterApply;
use crate::core::state::{CompletionData, DisplayState, GenerationPhase, PendingMessageCreation};
use crate::sink::{ChatMessage, MessagePriority};

/// create_user_message_with_priority 的结果；调用方检查 success 而不是捕获错误
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageCreationResult {
    pub message_id: String,
    pub success: bool,
    /// 仅最高优先级且创建成功时非空
    pub current_instruction_id: Option<String>,
    pub error: Option<String>,
}

impl MessageCoordinator {
    /// 生成消息 id、通过出口创建系统消息，然后独占控制它
    ///
    /// 未注册出口属于宿主的编程错误，在任何异步操作之前就返回 `SinkNotRegistered`。
    pub async fn create_and_control_generation_message(
        &self,
        project_id: &str,
        initial_content: &str,
    ) -> Result<String, CoordinatorError> {
        let sink = self.sink().ok_or(CoordinatorError::SinkNotRegistered)?;

        let message_id = format!("gen_{}_{}", project_id, Uuid::new_v4().simple());
        let content = self.inner.text.rewrite(initial_content, GenerationPhase::Idle);
        let message = ChatMessage::system(message_id.clone(), project_id, content.clone());

        sink.create(message.clone())
            .await
            .map_err(CoordinatorError::Sink)?;
        if let Err(e) = sink.persist(&message).await {
            tracing::warn!(message_id = %message_id, "persist generation message failed: {}", e);
        }

        self.start_exclusive_message_control(message_id.clone(), &content);
        Ok(message_id)
    }

    /// 完成本轮生成；completion.message_id 总是被覆写为当前活跃消息 id
    ///
    /// 完成不释放独占渲染（需要调用方随后 release_exclusive_control）。
    /// 状态写回后，经过 deployment_settle 延迟再通知部署上下文监听者。
    pub fn complete_generation(&self, final_message: &str, completion: CompletionData) {
        let final_message = final_message.to_string();
        let text = self.inner.text;

        self.queue_update(move |mut s, ctx| {
            let now = Utc::now();
            s.record_phase_exit(now);

            let mut data = completion;
            data.message_id = s.active_message_id.clone();

            let status = text.rewrite(&final_message, GenerationPhase::Complete);
            s.current_phase = GenerationPhase::Complete;
            s.phase_start_time = Some(now);
            s.display_state = DisplayState::Completed;
            s.show_k_loading_animation = false;
            s.is_generating = false;
            s.is_streaming_active = false;
            s.generation_complete = true;
            s.streaming_complete = true;
            s.set_status_text(status.clone());
            s.completion_data = Some(data.clone());

            tracing::info!(
                message_id = ?data.message_id,
                files = data.extracted_files.len(),
                phases = s.phase_history.len(),
                "generation complete"
            );
            ctx.emit_handoff(
                HandoffEvent::new(
                    s.current_owner,
                    s.current_owner,
                    HandoffReason::GenerationComplete,
                    GenerationPhase::Complete,
                )
                .with_message(status)
                .with_message_id(data.message_id.clone()),
            );
            ctx.after_apply(AfterApply::DeploymentContext(data));
            s
        });
    }

    /// 原子地创建一条带优先级的用户消息
    ///
    /// 同一时刻只有一个创建在进行；无论成功与否，进行中标志都会被清除，
    /// 并在该清除生效后才返回。失败通过 `success == false` 体现，不会返回错误。
    pub async fn create_user_message_with_priority(
        &self,
        project_id: &str,
        content: &str,
        priority: MessagePriority,
    ) -> MessageCreationResult {
        let _gate = self.inner.creation_gate.lock().await;

        let message_id = format!("user_{}", Uuid::new_v4().simple());
        let pending = PendingMessageCreation {
            message_id: message_id.clone(),
            project_id: project_id.to_string(),
            priority,
            requested_at: Utc::now(),
        };
        self.queue_update(move |mut s, _| {
            s.message_creation_in_progress = true;
            s.pending_message_creation = Some(pending);
            s
        });

        let message = ChatMessage::user(message_id.clone(), project_id, content, priority);
        let outcome = self.deliver_user_message(&message, priority).await;

        let current_instruction_id = match outcome {
            Ok(()) if priority.is_highest() => Some(message_id.clone()),
            _ => None,
        };

        let (tx, rx) = oneshot::channel();
        match &outcome {
            Ok(()) => {
                let event = MessageCreationEvent {
                    message_id: message_id.clone(),
                    project_id: project_id.to_string(),
                    priority,
                    current_instruction_id: current_instruction_id.clone(),
                    timestamp: Utc::now(),
                };
                self.queue_update(move |mut s, ctx| {
                    s.message_creation_in_progress = false;
                    s.pending_message_creation = None;
                    ctx.emit_handoff(
                        HandoffEvent::new(
                            s.current_owner,
                            s.current_owner,
                            HandoffReason::UserMessageCreated,
                            s.current_phase,
                        )
                        .with_message_id(Some(event.message_id.clone())),
                    );
                    ctx.emit_message_created(event);
                    ctx.after_apply(AfterApply::Resolve(tx));
                    s
                });
            }
            Err(e) => {
                tracing::error!(message_id = %message_id, "user message creation failed: {}", e);
                self.queue_update(move |mut s, ctx| {
                    s.message_creation_in_progress = false;
                    s.pending_message_creation = None;
                    ctx.after_apply(AfterApply::Resolve(tx));
                    s
                });
            }
        }

        let outcome = match rx.await {
            Ok(()) => outcome,
            Err(_) => {
                tracing::warn!(
                    message_id = %message_id,
                    "creation settled without queue confirmation"
                );
                outcome.and(Err(CoordinatorError::Closed))
            }
        };

        MessageCreationResult {
            message_id,
            success: outcome.is_ok(),
            current_instruction_id: current_instruction_id.filter(|_| outcome.is_ok()),
            error: outcome.err().map(|e| e.to_string()),
        }
    }

    async fn deliver_user_message(
        &self,
        message: &ChatMessage,
        priority: MessagePriority,
    ) -> Result<(), CoordinatorError> {
        let sink = self.sink().ok_or(CoordinatorError::SinkNotRegistered)?;
        sink.create(message.clone())
            .await
            .map_err(CoordinatorError::Sink)?;
        sink.assign_priority(&message.id, priority)
            .await
            .map_err(CoordinatorError::Sink)?;
        if let Err(e) = sink.persist(message).await {
            tracing::warn!(message_id = %message.id, "persist user message failed: {}", e);
        }
        Ok(())
    }

    /// 通过出口更新一条受控消息的内容（本地 + canister）
    pub async fn update_controlled_message(
        &self,
        message_id: &str,
        content: &str,
    ) -> Result<(), CoordinatorError> {
        if !self.is_controlling_message(message_id) {
            return Err(CoordinatorError::NotControlling(message_id.to_string()));
        }
        let sink = self.sink().ok_or(CoordinatorError::SinkNotRegistered)?;
        sink.update(message_id, content)
            .await
            .map_err(CoordinatorError::Sink)?;
        sink.update_in_canister(message_id, content)
            .await
            .map_err(CoordinatorError::Sink)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::InMemorySink;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_and_control_requires_sink() {
        let coordinator = MessageCoordinator::default();
        let err = coordinator
            .create_and_control_generation_message("p1", "Getting started...")
            .await
            .unwrap_err();
        assert_eq!(err, CoordinatorError::SinkNotRegistered);
        coordinator.flush().await;
        assert!(coordinator.active_message_id().is_none());
    }

    #[tokio::test]
    async fn test_create_and_control_generation_message() {
        let sink = Arc::new(InMemorySink::new());
        let coordinator = MessageCoordinator::default().with_sink(sink.clone());

        let id = coordinator
            .create_and_control_generation_message("p1", "Getting started...")
            .await
            .unwrap();
        coordinator.flush().await;

        assert!(id.starts_with("gen_p1_"));
        assert_eq!(coordinator.active_message_id().as_deref(), Some(id.as_str()));
        assert!(coordinator.is_controlling_message(&id));
        let created = sink.created().await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].id, id);
        assert!(created[0].is_generation);
    }

    #[tokio::test]
    async fn test_complete_generation_keeps_exclusive_rendering() {
        let coordinator = MessageCoordinator::default();
        coordinator.start_exclusive_message_control("m1", "Getting started...");
        coordinator.complete_generation("All set!", CompletionData::default());
        coordinator.flush().await;

        let state = coordinator.current_state();
        assert_eq!(state.display_state, DisplayState::Completed);
        assert!(state.exclusive_rendering_active);
        assert!(!state.show_k_loading_animation);
        assert!(!state.is_generating);
        assert!(state.generation_complete && state.streaming_complete);
        assert_eq!(state.current_message, "All set!");
    }

    #[tokio::test]
    async fn test_update_controlled_message() {
        let sink = Arc::new(InMemorySink::new());
        let coordinator = MessageCoordinator::default().with_sink(sink.clone());
        coordinator.start_exclusive_message_control("m1", "Getting started...");
        coordinator.flush().await;

        coordinator.update_controlled_message("m1", "partial output").await.unwrap();
        let err = coordinator
            .update_controlled_message("m2", "nope")
            .await
            .unwrap_err();
        assert_eq!(err, CoordinatorError::NotControlling("m2".to_string()));
        assert_eq!(sink.updates().await, vec![("m1".to_string(), "partial output".to_string())]);
        assert_eq!(sink.canister_updates().await.len(), 1);
    }
}
