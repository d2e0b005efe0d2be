//! 内存出口（用于演示与测试，不落盘）
//!
//! 记录所有创建、更新与优先级登记；可设置为创建失败，便于走错误路径。

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::sink::{ChatMessage, MessagePriority, MessageSink, SinkError};

#[derive(Debug, Default)]
pub struct InMemorySink {
    created: RwLock<Vec<ChatMessage>>,
    updates: RwLock<Vec<(String, String)>>,
    canister_updates: RwLock<Vec<(String, String)>>,
    priorities: RwLock<Vec<(String, MessagePriority)>>,
    fail_creates: AtomicBool,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的 create 调用全部返回错误
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub async fn created(&self) -> Vec<ChatMessage> {
        self.created.read().await.clone()
    }

    pub async fn updates(&self) -> Vec<(String, String)> {
        self.updates.read().await.clone()
    }

    pub async fn canister_updates(&self) -> Vec<(String, String)> {
        self.canister_updates.read().await.clone()
    }

    pub async fn priorities(&self) -> Vec<(String, MessagePriority)> {
        self.priorities.read().await.clone()
    }
}

#[async_trait]
impl MessageSink for InMemorySink {
    async fn create(&self, message: ChatMessage) -> Result<(), SinkError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(format!("create rejected for {}", message.id));
        }
        tracing::debug!(message_id = %message.id, "sink: message created");
        self.created.write().await.push(message);
        Ok(())
    }

    async fn update(&self, message_id: &str, content: &str) -> Result<(), SinkError> {
        self.updates
            .write()
            .await
            .push((message_id.to_string(), content.to_string()));
        Ok(())
    }

    async fn update_in_canister(&self, message_id: &str, content: &str) -> Result<(), SinkError> {
        self.canister_updates
            .write()
            .await
            .push((message_id.to_string(), content.to_string()));
        Ok(())
    }

    async fn assign_priority(
        &self,
        message_id: &str,
        priority: MessagePriority,
    ) -> Result<(), SinkError> {
        self.priorities
            .write()
            .await
            .push((message_id.to_string(), priority));
        Ok(())
    }
}
