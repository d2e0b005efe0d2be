//! 更新队列与派发通道
//!
//! 每次状态变更都是一个闭包：拿到当前状态（按值）、返回完整的新状态。
//! 队列由单一的排空循环处理（processing 标志保证不会重入），排空后才向订阅者发一次快照。
//! 交接事件与消息创建事件在闭包内部同步派发。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, oneshot};

use crate::core::events::{HandoffEvent, MessageCreationEvent};
use crate::core::listeners::ListenerSet;
use crate::core::state::{CompletionData, CoordinatorState};

/// 排队的状态更新
pub(crate) type StateUpdate =
    Box<dyn FnOnce(CoordinatorState, &mut UpdateContext<'_>) -> CoordinatorState + Send>;

/// 新状态写回之后才执行的动作
pub(crate) enum AfterApply {
    /// 作废尚未触发的部署钩子（须在同一轮里排在新的 DeploymentContext 之前）
    CancelDeployment,
    /// 延迟触发部署上下文钩子
    DeploymentContext(CompletionData),
    /// 唤醒等待该更新生效的调用方
    Resolve(oneshot::Sender<()>),
}

/// 四个监听通道 + 交接事件广播
pub(crate) struct Channels {
    pub state: Arc<ListenerSet<CoordinatorState>>,
    pub handoff: Arc<ListenerSet<HandoffEvent>>,
    pub message_creation: Arc<ListenerSet<MessageCreationEvent>>,
    pub deployment: Arc<ListenerSet<CompletionData>>,
    pub handoff_tx: broadcast::Sender<HandoffEvent>,
}

impl Channels {
    pub fn new(handoff_capacity: usize) -> Self {
        let (handoff_tx, _) = broadcast::channel(handoff_capacity.max(1));
        Self {
            state: Arc::new(ListenerSet::new("state")),
            handoff: Arc::new(ListenerSet::new("handoff")),
            message_creation: Arc::new(ListenerSet::new("message_creation")),
            deployment: Arc::new(ListenerSet::new("deployment_context")),
            handoff_tx,
        }
    }
}

/// 闭包执行期间可用的上下文
pub(crate) struct UpdateContext<'a> {
    channels: &'a Channels,
    after: Vec<AfterApply>,
}

impl<'a> UpdateContext<'a> {
    pub fn new(channels: &'a Channels) -> Self {
        Self {
            channels,
            after: Vec::new(),
        }
    }

    pub fn emit_handoff(&self, event: HandoffEvent) {
        tracing::debug!(from = %event.from, to = %event.to, reason = ?event.reason, "handoff");
        self.channels.handoff.notify(&event);
        // 没有接收端时 send 会失败，忽略即可
        let _ = self.channels.handoff_tx.send(event);
    }

    pub fn emit_message_created(&self, event: MessageCreationEvent) {
        self.channels.message_creation.notify(&event);
    }

    pub fn after_apply(&mut self, action: AfterApply) {
        self.after.push(action);
    }

    pub fn into_after(self) -> Vec<AfterApply> {
        self.after
    }
}

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<StateUpdate>,
    /// 新订阅者：等待首次快照
    initial: Vec<u64>,
    processing: bool,
    scheduled: bool,
}

/// 待处理更新 + 排空标志；同一把锁保证「入队并决定是否调度」是原子的
#[derive(Default)]
pub(crate) struct UpdateQueue {
    inner: Mutex<QueueInner>,
}

impl UpdateQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 入队；返回 true 表示调用方需要调度一次排空
    pub fn push(&self, update: StateUpdate) -> bool {
        let mut q = self.lock();
        q.pending.push_back(update);
        Self::claim_schedule(&mut q)
    }

    /// 登记新订阅者的首次快照
    pub fn push_initial(&self, listener_id: u64) -> bool {
        let mut q = self.lock();
        q.initial.push(listener_id);
        Self::claim_schedule(&mut q)
    }

    fn claim_schedule(q: &mut QueueInner) -> bool {
        if q.processing || q.scheduled {
            return false;
        }
        q.scheduled = true;
        true
    }

    /// 进入排空；已有排空在进行则返回 false
    pub fn begin_drain(&self) -> bool {
        let mut q = self.lock();
        q.scheduled = false;
        if q.processing {
            return false;
        }
        q.processing = true;
        true
    }

    pub fn pop(&self) -> Option<StateUpdate> {
        self.lock().pending.pop_front()
    }

    pub fn take_initial(&self) -> Vec<u64> {
        std::mem::take(&mut self.lock().initial)
    }

    /// 一轮派发结束：队列已空则退出排空并返回 true；否则继续下一轮
    pub fn finish_round(&self) -> bool {
        let mut q = self.lock();
        if q.pending.is_empty() && q.initial.is_empty() {
            q.processing = false;
            true
        } else {
            false
        }
    }

    pub fn is_idle(&self) -> bool {
        let q = self.lock();
        q.pending.is_empty() && q.initial.is_empty() && !q.processing && !q.scheduled
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }
}
